// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Queries against the running executable's own load metadata.
//!
//! The kernel describes the executable to the loader through the auxiliary
//! vector; from there the program header table, the dynamic symbol/string
//! tables and the copy-end marker are all reachable without opening a single
//! file. Addresses read here are absolute: binaries built for segment
//! remapping are linked at fixed addresses by the accompanying linker
//! scripts, not as position-independent executables.

use std::ffi::CStr;

use log::debug;

use crate::segment::{Protection, Segment, SegmentTable};

#[cfg(target_pointer_width = "64")]
pub use libc::{Elf64_Phdr as Phdr, Elf64_Sym as Sym};
#[cfg(target_pointer_width = "32")]
pub use libc::{Elf32_Phdr as Phdr, Elf32_Sym as Sym};

/// Dynamic section entry. Tag and value are both address-sized words; the
/// ELF d_un union collapses to a single field.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Dyn {
    d_tag: isize,
    d_val: usize,
}

const DT_NULL: isize = 0;
const DT_STRTAB: isize = 5;
const DT_SYMTAB: isize = 6;

/// Program header flag the linker sets on segments destined for huge pages.
pub const PF_LINUX_HUGETLB: u32 = 0x10_0000;

const STB_GLOBAL: u8 = 1;
const STB_WEAK: u8 = 2;
const STT_OBJECT: u8 = 1;

/// Marker symbol naming the true end of tail data that must be preserved,
/// covering data no ordinary symbol spans. Emitted by the linker scripts.
pub const COPY_END_MARKER: &str = "__hugemap_copy_end";

pub(crate) fn st_bind(info: u8) -> u8 {
    info >> 4
}

pub(crate) fn st_type(info: u8) -> u8 {
    info & 0xf
}

/// Whether a symbol is a global or weak data object.
pub(crate) fn is_data_object(sym: &Sym) -> bool {
    matches!(st_bind(sym.st_info), STB_GLOBAL | STB_WEAK) && st_type(sym.st_info) == STT_OBJECT
}

#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum ScanError {
    /// Executable marks more segments for huge pages than the table holds
    TooManySegments,
}

/// The running executable's load metadata.
#[derive(Debug, Clone, Copy)]
pub struct ExecutableImage {
    phdrs: &'static [Phdr],
}

impl ExecutableImage {
    /// Locate the program header table through the auxiliary vector.
    ///
    /// Returns `None` when the loader supplied no table; callers treat that
    /// as "nothing to remap".
    pub fn from_auxv() -> Option<Self> {
        // SAFETY: getauxval only reads the process's auxiliary vector.
        let phdr = unsafe { libc::getauxval(libc::AT_PHDR) } as *const Phdr;
        // SAFETY: as above.
        let phnum = unsafe { libc::getauxval(libc::AT_PHNUM) } as usize;
        if phdr.is_null() || phnum == 0 {
            return None;
        }
        // SAFETY: AT_PHDR/AT_PHNUM describe the live program header table,
        // which stays mapped for the lifetime of the process.
        Some(Self { phdrs: unsafe { std::slice::from_raw_parts(phdr, phnum) } })
    }

    #[cfg(test)]
    pub(crate) fn from_phdrs(phdrs: &'static [Phdr]) -> Self {
        Self { phdrs }
    }

    /// Collect the loadable segments flagged for huge page backing.
    ///
    /// More eligible segments than [`crate::segment::MAX_SEGMENTS`] is a
    /// configuration error; partial coverage would be worse than none, so
    /// the whole procedure is abandoned.
    pub fn scan_segments(&self) -> Result<SegmentTable, ScanError> {
        let mut table = SegmentTable::new();
        for (index, phdr) in self.phdrs.iter().enumerate() {
            if phdr.p_type != libc::PT_LOAD || phdr.p_flags & PF_LINUX_HUGETLB == 0 {
                continue;
            }
            let segment = Segment {
                vaddr: phdr.p_vaddr as usize,
                filesz: phdr.p_filesz as usize,
                memsz: phdr.p_memsz as usize,
                prot: Protection::from_phdr_flags(phdr.p_flags),
                phdr_index: index,
                extra: None,
                fd: None,
            };
            debug!(
                "huge page segment {} (phdr {index}): {:#x}-{:#x} (filesz={:#x}) (prot={:?})",
                table.len(),
                segment.vaddr,
                segment.end(),
                segment.filesz,
                segment.prot,
            );
            if table.try_push(segment).is_err() {
                return Err(ScanError::TooManySegments);
            }
        }
        Ok(table)
    }

    /// Locate the dynamic symbol and string tables.
    ///
    /// Returns `None` when the executable has no dynamic section or the
    /// tables are incomplete; that only costs the minimal-copy optimization,
    /// not the remapping itself.
    pub fn dynamic_tables(&self) -> Option<DynamicTables> {
        let dynamic = self.phdrs.iter().find(|phdr| phdr.p_type == libc::PT_DYNAMIC)?;

        let mut symtab: *const Sym = std::ptr::null();
        let mut strtab: *const libc::c_char = std::ptr::null();
        let mut entry = dynamic.p_vaddr as usize as *const Dyn;
        // SAFETY: PT_DYNAMIC points at the live dynamic section, an array
        // terminated by a DT_NULL entry.
        unsafe {
            while (*entry).d_tag != DT_NULL {
                match (*entry).d_tag {
                    DT_SYMTAB => symtab = (*entry).d_val as *const Sym,
                    DT_STRTAB => strtab = (*entry).d_val as *const libc::c_char,
                    _ => {}
                }
                entry = entry.add(1);
            }
        }

        if symtab.is_null() || strtab.is_null() {
            debug!("no dynamic symbol or string table");
            return None;
        }

        // The symbol count is not recorded in the dynamic section. The
        // linker scripts guarantee the string table directly follows the
        // symbol table; the distance between them is the table size.
        if strtab as usize <= symtab as usize {
            debug!("cannot derive dynamic symbol table size");
            return None;
        }
        let count = (strtab as usize - symtab as usize) / std::mem::size_of::<Sym>();
        // SAFETY: both tables live in mapped segments of the running
        // executable; count entries fit between them by construction.
        let syms = unsafe { std::slice::from_raw_parts(symtab, count) };
        Some(DynamicTables { syms, strtab })
    }
}

/// The executable's dynamic symbol table plus its string table.
#[derive(Debug, Clone, Copy)]
pub struct DynamicTables {
    syms: &'static [Sym],
    strtab: *const libc::c_char,
}

impl DynamicTables {
    #[cfg(test)]
    pub(crate) fn from_raw(syms: &'static [Sym], strtab: *const libc::c_char) -> Self {
        Self { syms, strtab }
    }

    pub fn symbols(&self) -> &'static [Sym] {
        self.syms
    }

    /// Resolve a symbol's address by name.
    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.syms.iter().find_map(|sym| {
            if sym.st_name == 0 {
                return None;
            }
            // SAFETY: st_name is an offset into the live, NUL-terminated
            // dynamic string table.
            let sym_name = unsafe { CStr::from_ptr(self.strtab.add(sym.st_name as usize)) };
            (sym_name.to_bytes() == name.as_bytes()).then(|| sym.st_value as usize)
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::segment::MAX_SEGMENTS;

    // Auxiliary function being used throughout the analyzer tests as well.
    pub(crate) fn test_sym(value: usize, size: usize, bind: u8, typ: u8) -> Sym {
        test_named_sym(0, value, size, bind, typ)
    }

    pub(crate) fn test_named_sym(name: u32, value: usize, size: usize, bind: u8, typ: u8) -> Sym {
        Sym {
            st_name: name,
            st_info: (bind << 4) | (typ & 0xf),
            st_other: 0,
            st_shndx: 0,
            st_value: value as _,
            st_size: size as _,
        }
    }

    fn test_phdr(p_type: u32, flags: u32, vaddr: usize, filesz: usize, memsz: usize) -> Phdr {
        Phdr {
            p_type,
            p_flags: flags,
            p_offset: 0,
            p_vaddr: vaddr as _,
            p_paddr: vaddr as _,
            p_filesz: filesz as _,
            p_memsz: memsz as _,
            p_align: 0x20_0000,
        }
    }

    #[test]
    fn test_symbol_classification() {
        assert!(is_data_object(&test_sym(0, 8, 1, 1)));
        assert!(is_data_object(&test_sym(0, 8, 2, 1)));
        // Local binding.
        assert!(!is_data_object(&test_sym(0, 8, 0, 1)));
        // Function type.
        assert!(!is_data_object(&test_sym(0, 8, 1, 2)));
    }

    #[test]
    fn test_scan_ignores_unflagged_segments() {
        let phdrs = vec![
            test_phdr(libc::PT_LOAD, 0x5, 0x40_0000, 0x1000, 0x1000),
            test_phdr(libc::PT_DYNAMIC, 0x6, 0x60_0000, 0x100, 0x100),
        ];
        let image = ExecutableImage::from_phdrs(Box::leak(phdrs.into_boxed_slice()));
        assert!(image.scan_segments().unwrap().is_empty());
    }

    #[test]
    fn test_scan_records_flagged_segments() {
        let phdrs = vec![
            test_phdr(libc::PT_LOAD, 0x5 | PF_LINUX_HUGETLB, 0x40_0000, 0x1000, 0x1000),
            test_phdr(libc::PT_LOAD, 0x6 | PF_LINUX_HUGETLB, 0x80_0000, 0x800, 0x2000),
        ];
        let image = ExecutableImage::from_phdrs(Box::leak(phdrs.into_boxed_slice()));

        let table = image.scan_segments().unwrap();
        assert_eq!(table.len(), 2);

        assert_eq!(table[0].vaddr, 0x40_0000);
        assert_eq!(table[0].prot, Protection::READ | Protection::EXEC);
        assert_eq!(table[0].phdr_index, 0);

        assert_eq!(table[1].memsz, 0x2000);
        assert_eq!(table[1].prot, Protection::READ | Protection::WRITE);
        assert_eq!(table[1].phdr_index, 1);
    }

    #[test]
    fn test_scan_rejects_too_many_segments() {
        let phdrs: Vec<_> = (0..MAX_SEGMENTS + 1)
            .map(|i| {
                test_phdr(libc::PT_LOAD, 0x4 | PF_LINUX_HUGETLB, 0x40_0000 * (i + 1), 0x1000, 0x1000)
            })
            .collect();
        let image = ExecutableImage::from_phdrs(Box::leak(phdrs.into_boxed_slice()));
        assert!(matches!(image.scan_segments(), Err(ScanError::TooManySegments)));
    }

    #[test]
    fn test_lookup_by_name() {
        // Layout: [0]=NUL, [1..]="__hugemap_copy_end\0other\0"
        let strtab: &'static [u8] = b"\0__hugemap_copy_end\0other\0";
        let syms = vec![
            test_named_sym(0, 0, 0, 0, 0),
            test_named_sym(20, 0xdead, 4, 1, 1),
            test_named_sym(1, 0xbeef, 0, 1, 0),
        ];
        let tables = DynamicTables::from_raw(
            Box::leak(syms.into_boxed_slice()),
            strtab.as_ptr().cast(),
        );

        assert_eq!(tables.lookup(COPY_END_MARKER), Some(0xbeef));
        assert_eq!(tables.lookup("other"), Some(0xdead));
        assert_eq!(tables.lookup("missing"), None);
    }

    #[test]
    fn test_running_test_binary_has_no_flagged_segments() {
        let image = ExecutableImage::from_auxv().unwrap();
        assert!(image.scan_segments().unwrap().is_empty());
    }
}
