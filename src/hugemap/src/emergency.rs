// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The only code permitted inside the unmap/remap window.
//!
//! While the original segment mappings are gone, anything that might fault
//! in a lazily resolved PLT entry or touch static data in the affected
//! segments is off limits: the memory backing both may be exactly what was
//! just unmapped. These primitives talk to the kernel through raw syscalls
//! and keep every byte of state on the stack. Formatting is limited to
//! string, decimal and address parts; that is all an abort message needs
//! and all this environment can afford.

/// One piece of an emergency message.
#[derive(Debug, Clone, Copy)]
pub enum Part<'a> {
    Str(&'a str),
    Dec(u64),
    Addr(usize),
}

fn write_stderr(bytes: &[u8]) {
    // SAFETY: direct write(2) to stderr; no library state involved.
    unsafe {
        libc::syscall(
            libc::SYS_write,
            2 as libc::c_long,
            bytes.as_ptr(),
            bytes.len(),
        );
    }
}

/// Render `val` into the tail of `buf`, returning the first used index.
/// `buf` fits u64::MAX in the smallest supported base.
fn format_number(mut val: u64, base: u64, buf: &mut [u8; 20]) -> usize {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut pos = buf.len();
    loop {
        pos -= 1;
        buf[pos] = DIGITS[(val % base) as usize];
        val /= base;
        if val == 0 {
            break;
        }
    }
    pos
}

fn write_number(val: u64, base: u64) {
    let mut buf = [0u8; 20];
    let pos = format_number(val, base, &mut buf);
    write_stderr(&buf[pos..]);
}

/// Write the message to stderr and terminate the process with SIGABRT,
/// using nothing but direct system calls.
pub fn abort_unmapped(parts: &[Part<'_>]) -> ! {
    for part in parts {
        match *part {
            Part::Str(text) => write_stderr(text.as_bytes()),
            Part::Dec(val) => write_number(val, 10),
            Part::Addr(addr) => {
                write_stderr(b"0x");
                write_number(addr as u64, 16);
            }
        }
    }
    write_stderr(b"\n");

    // SAFETY: raw getpid/kill/exit_group; none of them return control to
    // library code that could touch unmapped memory.
    unsafe {
        let pid = libc::syscall(libc::SYS_getpid);
        libc::syscall(libc::SYS_kill, pid, libc::SIGABRT as libc::c_long);
        // SIGABRT may be blocked or handled; nothing is left to save.
        loop {
            libc::syscall(libc::SYS_exit_group, 134 as libc::c_long);
        }
    }
}
