// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Populates a backing file with a segment's live bytes.

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;

use log::{debug, warn};
use vmm_sys_util::syscall::SyscallReturnCode;

use crate::segment::Segment;

#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum PrepareError {
    /// Cannot size backing file to {0} bytes: {1}
    Truncate(usize, io::Error),
    /// Cannot map backing file for copying: {0}
    Map(io::Error),
}

/// Scratch mapping over a backing file, unmapped on drop.
#[derive(Debug)]
struct ScratchMapping {
    addr: *mut libc::c_void,
    len: usize,
}

impl ScratchMapping {
    fn new(file: &File, len: usize) -> Result<Self, PrepareError> {
        // SAFETY: shared read/write mapping of `file` at a kernel-chosen
        // address; checked for MAP_FAILED below.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(PrepareError::Map(io::Error::last_os_error()));
        }
        Ok(Self { addr, len })
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        self.addr.cast()
    }
}

impl Drop for ScratchMapping {
    fn drop(&mut self) {
        // SAFETY: addr/len describe the mapping created in new().
        if let Err(err) =
            SyscallReturnCode(unsafe { libc::munmap(self.addr, self.len) }).into_empty_result()
        {
            warn!("cannot unmap scratch mapping: {err}");
        }
    }
}

/// Copy the segment's bytes into `file`.
///
/// Sources the *currently live* segment memory, so this must run before the
/// original mappings are torn down. The on-disk portion lands at the start
/// of the file; the extra-copy range, when present, lands at its
/// segment-relative offset. Everything in between and after stays zero.
/// The file is sized to the huge-page-aligned copy extent up front.
pub fn prepare_segment(seg: &Segment, file: &File, hpage_size: usize) -> Result<(), PrepareError> {
    let size = hugefs::align_up(seg.copy_extent(), hpage_size);
    file.set_len(size as u64).map_err(|err| PrepareError::Truncate(size, err))?;

    let mapping = ScratchMapping::new(file, size)?;

    debug!("copying {:#x} bytes from {:#x}", seg.filesz, seg.vaddr);
    // SAFETY: the segment is still mapped readable for filesz bytes and the
    // scratch mapping spans at least copy_extent() bytes.
    unsafe {
        std::ptr::copy_nonoverlapping(seg.vaddr as *const u8, mapping.as_mut_ptr(), seg.filesz);
    }

    if let Some(extra) = seg.extra {
        let offset = extra.vaddr - seg.vaddr;
        debug!("copying extra {:#x} bytes from {:#x}", extra.len, extra.vaddr);
        // SAFETY: the extra range lies within the live tail, and
        // offset + len <= copy_extent() by construction.
        unsafe {
            std::ptr::copy_nonoverlapping(
                extra.vaddr as *const u8,
                mapping.as_mut_ptr().add(offset),
                extra.len,
            );
        }
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use vmm_sys_util::tempfile::TempFile;

    use super::*;
    use crate::segment::{test_segment, ExtraCopy};

    // Stands in for a huge page size; preparation is size-agnostic.
    pub(crate) const PAGE: usize = 4096;

    /// A fake live segment over heap memory: `filesz` bytes of 0xAB, then a
    /// tail counting up from 1.
    pub(crate) fn live_segment(filesz: usize, memsz: usize) -> (Vec<u8>, Segment) {
        let mut memory = vec![0xAB_u8; memsz];
        for (i, byte) in memory[filesz..].iter_mut().enumerate() {
            *byte = (i % 251 + 1) as u8;
        }
        let seg = test_segment(memory.as_ptr() as usize, filesz, memsz);
        (memory, seg)
    }

    #[test]
    fn test_prepare_copies_disk_portion() {
        let (memory, seg) = live_segment(100, 100);
        let file = TempFile::new().unwrap();

        prepare_segment(&seg, file.as_file(), PAGE).unwrap();

        let contents = std::fs::read(file.as_path()).unwrap();
        assert_eq!(contents.len(), PAGE);
        assert_eq!(&contents[..100], &memory[..100]);
        assert!(contents[100..].iter().all(|&byte| byte == 0));
    }

    #[test]
    fn test_prepare_copies_extra_range_at_relative_offset() {
        let (memory, mut seg) = live_segment(100, 3 * PAGE);
        // Preserve [300, 420) out of the tail, leaving a gap after filesz.
        seg.extra = Some(ExtraCopy { vaddr: seg.vaddr + 300, len: 120 });
        let file = TempFile::new().unwrap();

        prepare_segment(&seg, file.as_file(), PAGE).unwrap();

        let contents = std::fs::read(file.as_path()).unwrap();
        assert_eq!(contents.len(), PAGE);
        assert_eq!(&contents[..100], &memory[..100]);
        // The gap between the disk portion and the extra range stays zero.
        assert!(contents[100..300].iter().all(|&byte| byte == 0));
        assert_eq!(&contents[300..420], &memory[300..420]);
        assert!(contents[420..].iter().all(|&byte| byte == 0));
    }

    #[test]
    fn test_prepare_sizes_file_to_aligned_extent() {
        let (_memory, mut seg) = live_segment(4 * PAGE, 6 * PAGE);
        // Whole-tail copy: the file must cover all six pages.
        seg.extra = Some(ExtraCopy { vaddr: seg.vaddr + 4 * PAGE, len: 2 * PAGE });
        let file = TempFile::new().unwrap();

        prepare_segment(&seg, file.as_file(), PAGE).unwrap();

        let metadata = file.as_file().metadata().unwrap();
        assert_eq!(metadata.len(), (6 * PAGE) as u64);
    }
}
