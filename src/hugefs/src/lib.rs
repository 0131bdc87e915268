// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Access to the hugetlbfs filesystem.
//!
//! Everything the remapping sequence needs from the huge page side of the
//! kernel lives here: locating a hugetlbfs mount, learning the default huge
//! page size, verifying that a path sits on hugetlbfs, and producing
//! anonymous (unlinked) huge page backed file descriptors. Pool sizing and
//! mount administration are the operator's job; this crate only consumes
//! what is already set up.

use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Filesystem magic returned by statfs(2) for hugetlbfs.
pub const HUGETLBFS_MAGIC: u64 = 0x958458f6;

#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum FsError {
    /// Cannot read {0}: {1}
    ProcRead(&'static str, io::Error),
    /// No hugetlbfs mount in /proc/mounts
    NoMount,
    /// No Hugepagesize line in /proc/meminfo
    NoPageSize,
    /// Cannot statfs {0}: {1}
    Statfs(PathBuf, io::Error),
    /// Cannot create scratch file under {0}: {1}
    Scratch(PathBuf, io::Error),
}

/// Mount point of the first hugetlbfs filesystem listed in /proc/mounts.
pub fn mount_point() -> Result<PathBuf, FsError> {
    let mounts =
        fs::read_to_string("/proc/mounts").map_err(|err| FsError::ProcRead("/proc/mounts", err))?;
    parse_mounts(&mounts).ok_or(FsError::NoMount)
}

fn parse_mounts(contents: &str) -> Option<PathBuf> {
    contents.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let _device = fields.next()?;
        let target = fields.next()?;
        let fstype = fields.next()?;
        (fstype == "hugetlbfs").then(|| PathBuf::from(target))
    })
}

/// Default huge page size in bytes, from /proc/meminfo.
pub fn hugepage_size() -> Result<usize, FsError> {
    let meminfo =
        fs::read_to_string("/proc/meminfo").map_err(|err| FsError::ProcRead("/proc/meminfo", err))?;
    parse_meminfo(&meminfo).ok_or(FsError::NoPageSize)
}

fn parse_meminfo(contents: &str) -> Option<usize> {
    let line = contents.lines().find(|line| line.starts_with("Hugepagesize:"))?;
    let kib: usize = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

/// Whether `path` resides on a hugetlbfs filesystem.
pub fn is_hugetlbfs(path: &Path) -> Result<bool, FsError> {
    let cpath = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        FsError::Statfs(
            path.to_path_buf(),
            io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"),
        )
    })?;
    let mut stat = MaybeUninit::<libc::statfs>::zeroed();
    // SAFETY: cpath is NUL terminated and stat points at a full statfs
    // buffer for the kernel to fill.
    let ret = unsafe { libc::statfs(cpath.as_ptr(), stat.as_mut_ptr()) };
    if ret < 0 {
        return Err(FsError::Statfs(path.to_path_buf(), io::Error::last_os_error()));
    }
    // SAFETY: statfs returned 0, so the buffer is initialized.
    let stat = unsafe { stat.assume_init() };
    Ok(stat.f_type as u64 == HUGETLBFS_MAGIC)
}

/// An unlinked huge page backed file descriptor for private mappings.
///
/// Prefers a hugetlb memfd, which needs no mount at all; page sizes the
/// memfd flag set cannot express fall back to an exclusively created and
/// immediately unlinked scratch file on the hugetlbfs mount.
pub fn unlinked_fd(hpage_size: usize) -> Result<File, FsError> {
    if let Some(size) = memfd_hugetlb_size(hpage_size) {
        match memfd::MemfdOptions::default().hugetlb(Some(size)).create("hugemap-seg") {
            Ok(mfd) => return Ok(mfd.into_file()),
            Err(err) => {
                log::debug!("hugetlb memfd unavailable ({err}), falling back to a scratch file")
            }
        }
    }
    scratch_fd(&mount_point()?)
}

fn memfd_hugetlb_size(hpage_size: usize) -> Option<memfd::HugetlbSize> {
    match hpage_size {
        0x1_0000 => Some(memfd::HugetlbSize::Huge64KB),
        0x8_0000 => Some(memfd::HugetlbSize::Huge512KB),
        0x10_0000 => Some(memfd::HugetlbSize::Huge1MB),
        0x20_0000 => Some(memfd::HugetlbSize::Huge2MB),
        0x80_0000 => Some(memfd::HugetlbSize::Huge8MB),
        0x100_0000 => Some(memfd::HugetlbSize::Huge16MB),
        0x1000_0000 => Some(memfd::HugetlbSize::Huge256MB),
        0x4000_0000 => Some(memfd::HugetlbSize::Huge1GB),
        _ => None,
    }
}

fn scratch_fd(dir: &Path) -> Result<File, FsError> {
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);

    loop {
        let name = format!(
            "hugemap-scratch-{}-{}",
            std::process::id(),
            SEQUENCE.fetch_add(1, Ordering::Relaxed)
        );
        let path = dir.join(name);
        match OpenOptions::new().read(true).write(true).create_new(true).open(&path) {
            Ok(file) => {
                if let Err(err) = fs::remove_file(&path) {
                    log::warn!("cannot unlink scratch file {}: {err}", path.display());
                }
                return Ok(file);
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(FsError::Scratch(dir.to_path_buf(), err)),
        }
    }
}

/// Round `value` up to a multiple of `alignment` (a power of two).
pub fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Seek, SeekFrom, Write};

    use vmm_sys_util::tempdir::TempDir;

    use super::*;

    #[test]
    fn test_parse_mounts() {
        let contents = "sysfs /sys sysfs rw,nosuid 0 0\n\
                        none /dev/hugepages hugetlbfs rw,relatime,pagesize=2M 0 0\n\
                        none /mnt/huge1g hugetlbfs rw,pagesize=1024M 0 0\n";
        assert_eq!(parse_mounts(contents), Some(PathBuf::from("/dev/hugepages")));
    }

    #[test]
    fn test_parse_mounts_no_hugetlbfs() {
        let contents = "sysfs /sys sysfs rw,nosuid 0 0\ntmpfs /tmp tmpfs rw 0 0\n";
        assert_eq!(parse_mounts(contents), None);
        assert_eq!(parse_mounts(""), None);
    }

    #[test]
    fn test_parse_meminfo() {
        let contents = "MemTotal:       32610224 kB\n\
                        Hugepagesize:       2048 kB\n\
                        DirectMap4k:      276268 kB\n";
        assert_eq!(parse_meminfo(contents), Some(2048 * 1024));
        assert_eq!(parse_meminfo("MemTotal: 1 kB\n"), None);
    }

    #[test]
    fn test_memfd_hugetlb_size() {
        assert!(matches!(memfd_hugetlb_size(2 << 20), Some(memfd::HugetlbSize::Huge2MB)));
        assert!(matches!(memfd_hugetlb_size(1 << 30), Some(memfd::HugetlbSize::Huge1GB)));
        assert!(memfd_hugetlb_size(12345).is_none());
    }

    #[test]
    fn test_scratch_fd_is_unlinked() {
        let dir = TempDir::new().unwrap();
        let mut file = scratch_fd(dir.as_path()).unwrap();

        // The directory must hold no trace of the descriptor.
        assert_eq!(fs::read_dir(dir.as_path()).unwrap().count(), 0);

        file.write_all(b"backing bytes").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "backing bytes");
    }

    #[test]
    fn test_is_hugetlbfs_on_plain_fs() {
        let dir = TempDir::new().unwrap();
        assert!(!is_hugetlbfs(dir.as_path()).unwrap());
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 0x20_0000), 0);
        assert_eq!(align_up(1, 0x20_0000), 0x20_0000);
        assert_eq!(align_up(0x20_0000, 0x20_0000), 0x20_0000);
        assert_eq!(align_up(0x20_0001, 0x20_0000), 0x40_0000);
    }
}
