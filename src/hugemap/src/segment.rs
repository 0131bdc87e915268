// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Segment descriptors filled in stage by stage during setup.

use std::fs::File;

use arrayvec::ArrayVec;

/// Upper bound on segments an executable may mark for huge page backing.
/// Exceeding it abandons the whole procedure rather than honoring a prefix.
pub const MAX_SEGMENTS: usize = 2;

/// Fixed-capacity table of eligible segments, in program header order.
pub type SegmentTable = ArrayVec<Segment, MAX_SEGMENTS>;

bitflags::bitflags! {
    /// Segment access permissions, in ELF p_flags encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u32 {
        const EXEC = 0x1;
        const WRITE = 0x2;
        const READ = 0x4;
    }
}

impl Protection {
    pub(crate) fn from_phdr_flags(flags: u32) -> Self {
        Self::from_bits_truncate(flags)
    }

    pub(crate) fn to_mmap_prot(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Self::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Self::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Self::EXEC) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

/// Sub-range of a segment's zero-filled tail that must travel into the
/// prepared file because runtime init code may have written it already.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtraCopy {
    pub vaddr: usize,
    pub len: usize,
}

impl ExtraCopy {
    pub fn end(&self) -> usize {
        self.vaddr + self.len
    }
}

/// One segment the linker marked for huge page backing.
///
/// Created by the scanner; `extra` is filled by the minimal-copy analysis
/// and `fd` by whichever path produced the prepared backing file. Addresses
/// are absolute: executables built for remapping are linked at fixed
/// addresses by the accompanying linker scripts.
#[derive(Debug)]
pub struct Segment {
    /// Base virtual address of the mapping.
    pub vaddr: usize,
    /// Bytes backed by the binary image on disk.
    pub filesz: usize,
    /// Total mapped size; anything past `filesz` starts out zero-filled.
    pub memsz: usize,
    pub prot: Protection,
    /// Index of the describing entry in the program header table; part of
    /// the shared file identity.
    pub phdr_index: usize,
    pub extra: Option<ExtraCopy>,
    pub fd: Option<File>,
}

impl Segment {
    /// Start of the zero-filled tail.
    pub fn tail_start(&self) -> usize {
        self.vaddr + self.filesz
    }

    /// One past the end of the segment.
    pub fn end(&self) -> usize {
        self.vaddr + self.memsz
    }

    /// Bytes of the segment, from its base, that must land in the prepared
    /// file. Everything beyond is implicitly zero.
    pub fn copy_extent(&self) -> usize {
        match self.extra {
            Some(extra) => extra.end() - self.vaddr,
            None => self.filesz,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_segment(vaddr: usize, filesz: usize, memsz: usize) -> Segment {
    Segment {
        vaddr,
        filesz,
        memsz,
        prot: Protection::READ | Protection::WRITE,
        phdr_index: 0,
        extra: None,
        fd: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protection_from_phdr_flags() {
        let prot = Protection::from_phdr_flags(0x4 | 0x1);
        assert_eq!(prot, Protection::READ | Protection::EXEC);
        assert!(!prot.contains(Protection::WRITE));
    }

    #[test]
    fn test_protection_ignores_foreign_flag_bits() {
        let prot = Protection::from_phdr_flags(0x10_0000 | 0x4);
        assert_eq!(prot, Protection::READ);
    }

    #[test]
    fn test_to_mmap_prot() {
        assert_eq!(
            (Protection::READ | Protection::WRITE).to_mmap_prot(),
            libc::PROT_READ | libc::PROT_WRITE
        );
        assert_eq!(
            (Protection::READ | Protection::EXEC).to_mmap_prot(),
            libc::PROT_READ | libc::PROT_EXEC
        );
        assert_eq!(Protection::empty().to_mmap_prot(), libc::PROT_NONE);
    }

    #[test]
    fn test_copy_extent() {
        let mut seg = test_segment(0x1000, 0x200, 0x800);
        assert_eq!(seg.copy_extent(), 0x200);

        seg.extra = Some(ExtraCopy { vaddr: 0x1400, len: 0x100 });
        assert_eq!(seg.copy_extent(), 0x500);
    }

    #[test]
    fn test_table_capacity() {
        let mut table = SegmentTable::new();
        assert!(table.try_push(test_segment(0x1000, 1, 1)).is_ok());
        assert!(table.try_push(test_segment(0x2000, 1, 1)).is_ok());
        assert!(table.try_push(test_segment(0x3000, 1, 1)).is_err());
    }
}
