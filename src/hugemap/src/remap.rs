// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Tears down the original segment mappings and rebuilds them in place on
//! top of the prepared huge page files.

use std::os::fd::AsRawFd;

use crate::emergency::{self, Part};
use crate::segment::Segment;

/// Replace every segment's standard-page mapping with its prepared file at
/// the same fixed address.
///
/// Between the first munmap and the last successful mmap the process is in
/// a black hole: parts of its own text and data are gone, so nothing that
/// could fault in a not-yet-resolved dynamic symbol or touch static state
/// may run. This function confines itself to raw syscalls and stack state
/// inside that window, and any failure there ends the process through
/// [`emergency::abort_unmapped`]: with the address space partially torn
/// down, returning an error would be indistinguishable from corruption.
///
/// # Safety
///
/// Every segment must carry a fully populated backing descriptor, the
/// segment addresses must describe mappings this process owns, and no other
/// thread may exist yet.
pub unsafe fn remap_segments(segments: &[Segment], hpage_size: usize) {
    // Touch the calls the window needs once up front, while the PLT and GOT
    // are still mapped, so the loader resolves them now. This matters most
    // when every file arrived pre-prepared from another process and this
    // process never mapped anything itself.
    // SAFETY: zero-length anonymous mmap and munmap fail cleanly; only the
    // symbol resolution side effect matters. errno access resolves the
    // thread-local errno location.
    unsafe {
        libc::mmap(std::ptr::null_mut(), 0, 0, 0, -1, 0);
        libc::munmap(std::ptr::null_mut(), 0);
    }
    let _ = std::io::Error::last_os_error();

    for seg in segments {
        // SAFETY: per the function contract, vaddr/memsz describe live
        // mappings owned by this process.
        unsafe {
            libc::munmap(seg.vaddr as *mut libc::c_void, seg.memsz);
        }
    }

    // Rebuild only after every original mapping is gone: some architectures
    // cannot hold standard and huge translations for one region at the same
    // time, so mixing the loops would fault.
    for (index, seg) in segments.iter().enumerate() {
        let len = hugefs::align_up(seg.memsz, hpage_size);
        let fd = match seg.fd.as_ref() {
            Some(file) => file.as_raw_fd(),
            None => emergency::abort_unmapped(&[
                Part::Str("libhugemap: segment "),
                Part::Dec(index as u64),
                Part::Str(" has no prepared file"),
            ]),
        };

        // SAFETY: MAP_FIXED onto the segment's own former address range,
        // which was just unmapped, backed by the fully populated file.
        let addr = unsafe {
            libc::mmap(
                seg.vaddr as *mut libc::c_void,
                len,
                seg.prot.to_mmap_prot(),
                libc::MAP_PRIVATE | libc::MAP_FIXED,
                fd,
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            // SAFETY: reads the already-resolved thread-local errno.
            let errno = unsafe { *libc::__errno_location() };
            emergency::abort_unmapped(&[
                Part::Str("libhugemap: failed to map huge page segment "),
                Part::Dec(index as u64),
                Part::Str(": "),
                Part::Addr(seg.vaddr),
                Part::Str("-"),
                Part::Addr(seg.vaddr + len),
                Part::Str(" (errno "),
                Part::Dec(errno as u64),
                Part::Str(")"),
            ]);
        }
        if addr as usize != seg.vaddr {
            emergency::abort_unmapped(&[
                Part::Str("libhugemap: huge page segment "),
                Part::Dec(index as u64),
                Part::Str(" ("),
                Part::Addr(seg.vaddr),
                Part::Str("-"),
                Part::Addr(seg.vaddr + len),
                Part::Str(") mapped at wrong address "),
                Part::Addr(addr as usize),
            ]);
        }
    }
    // Every segment is back; static data and the PLT are safe again.
}
