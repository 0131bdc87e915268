// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shared backing files, published atomically by rename.
//!
//! Processes running the same binary can reuse one prepared copy of a
//! read-only segment instead of each burning their own huge pages. There is
//! no lock service to lean on; mutual exclusion comes from the filesystem
//! itself. Each round a contender attempts an exclusive create of the
//! `.tmp` lock artifact and a read-only open of the final path, and the
//! pair of outcomes decides its role:
//!
//! - the final open succeeded: somebody already published; clean up our
//!   artifact if we also created one and use the published file.
//! - only the exclusive create succeeded: we are the preparer. Populate the
//!   artifact, then rename it onto the final path; rename is atomic, so no
//!   third party ever observes a partially filled file.
//! - both failed (artifact exists, final missing): another process is
//!   mid-preparation. Sleep and retry. There is no retry bound: a preparer
//!   dying before its rename parks every waiter here.
//!
//! Published files are never written again by anyone.

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, error, warn};

use crate::config::Config;
use crate::prepare::{prepare_segment, PrepareError};
use crate::segment::{Protection, Segment};

/// Suffix distinguishing the lock artifact from the published file.
pub const TMP_SUFFIX: &str = ".tmp";

/// Fixed wait between rounds while another process prepares.
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum ShareError {
    /// Share path {0} is not on a hugetlbfs filesystem
    PathNotHugetlbfs(PathBuf),
    /// {0}
    Fs(#[from] hugefs::FsError),
    /// Cannot create share directory {0}: {1}
    CreateDir(PathBuf, io::Error),
    /// Cannot stat share directory {0}: {1}
    StatDir(PathBuf, io::Error),
    /// Share directory {0} is not a directory
    NotADirectory(PathBuf),
    /// Share directory {0} has owner uid {1} instead of {2}
    WrongOwner(PathBuf, u32, u32),
    /// Share directory {0} has unsafe mode {1:03o}
    BadPermissions(PathBuf, u32),
    /// Cannot resolve /proc/self/exe: {0}
    ExePath(io::Error),
    /// Cannot publish {0}: {1}
    Publish(PathBuf, io::Error),
    /// {0}
    Prepare(#[from] PrepareError),
}

/// Resolve and secure the directory holding shared segment files.
///
/// Either the configured override (which must sit on hugetlbfs) or a
/// per-uid directory under the hugetlbfs mount. The directory may predate
/// this process and anyone may have raced to create it, so its ownership
/// and permissions are never taken on faith: it must belong to the current
/// user and must not be group or world writable. Validation failure fails
/// sharing cleanly rather than falling back to an insecure location.
pub fn resolve_share_dir(cfg: &Config) -> Result<PathBuf, ShareError> {
    // SAFETY: getuid never fails.
    let uid = unsafe { libc::getuid() };

    let dir = match &cfg.share_path {
        Some(path) => {
            if !hugefs::is_hugetlbfs(path)? {
                return Err(ShareError::PathNotHugetlbfs(path.clone()));
            }
            path.clone()
        }
        None => hugefs::mount_point()?.join(format!("hugemap-uid-{uid}")),
    };

    match DirBuilder::new().mode(0o700).create(&dir) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
        Err(err) => return Err(ShareError::CreateDir(dir, err)),
    }

    validate_share_dir(&dir, uid)?;
    Ok(dir)
}

fn validate_share_dir(dir: &Path, uid: u32) -> Result<(), ShareError> {
    let meta =
        fs::symlink_metadata(dir).map_err(|err| ShareError::StatDir(dir.to_path_buf(), err))?;
    if !meta.is_dir() {
        return Err(ShareError::NotADirectory(dir.to_path_buf()));
    }
    if meta.uid() != uid {
        return Err(ShareError::WrongOwner(dir.to_path_buf(), meta.uid(), uid));
    }
    if meta.mode() & 0o022 != 0 {
        return Err(ShareError::BadPermissions(dir.to_path_buf(), meta.mode() & 0o777));
    }
    Ok(())
}

/// Name identifying a segment's shared file: executable basename, address
/// width and program header index.
///
/// Deliberately not unique across distinct binaries sharing a basename;
/// colliding processes regenerate correct content for themselves either
/// way, so a collision only costs the sharing benefit, never correctness.
fn shared_file_identity(seg: &Segment) -> Result<String, ShareError> {
    let exe = fs::read_link("/proc/self/exe").map_err(ShareError::ExePath)?;
    let base = exe
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| {
            ShareError::ExePath(io::Error::new(io::ErrorKind::InvalidData, "no basename"))
        })?;
    Ok(format!("{base}_{}_{}", usize::BITS, seg.phdr_index))
}

/// Obtain a descriptor for `final_path`, reusing a published file or
/// winning the exclusive-create race and populating one via `prepare`.
///
/// See the module docs for the protocol. Unexpected open failures are
/// logged but never override the role the successful opens determined.
pub fn find_or_prepare(
    final_path: &Path,
    tmp_path: &Path,
    retry: Duration,
    mut prepare: impl FnMut(&File) -> Result<(), PrepareError>,
) -> Result<File, ShareError> {
    loop {
        // NB: the artifact mode is modified by umask, like any create.
        let exclusive = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o666)
            .open(tmp_path);
        let published = File::open(final_path);

        match (exclusive, published) {
            (exclusive, Ok(file)) => {
                match exclusive {
                    Ok(_lock) => {
                        // Won the artifact but lost the publish race;
                        // drop the unneeded claim.
                        if let Err(err) = fs::remove_file(tmp_path) {
                            error!(
                                "cannot clean up unneeded lock artifact {}: {err}",
                                tmp_path.display()
                            );
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                    Err(err) => warn!(
                        "unexpected failure on exclusive open of {}: {err}",
                        tmp_path.display()
                    ),
                }
                return Ok(file);
            }
            (Ok(lock), Err(err)) => {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(
                        "unexpected failure on shared open of {}: {err}",
                        final_path.display()
                    );
                }
                debug!("got unpopulated lock artifact, preparing {}", final_path.display());
                if let Err(prep_err) = prepare(&lock) {
                    remove_artifact(tmp_path);
                    return Err(prep_err.into());
                }
                if let Err(err) = fs::rename(tmp_path, final_path) {
                    remove_artifact(tmp_path);
                    return Err(ShareError::Publish(final_path.to_path_buf(), err));
                }
                return Ok(lock);
            }
            (Err(excl_err), Err(pub_err)) => {
                if excl_err.kind() != io::ErrorKind::AlreadyExists
                    || pub_err.kind() != io::ErrorKind::NotFound
                {
                    warn!(
                        "unexpected open failures for {}: {excl_err} / {pub_err}",
                        final_path.display()
                    );
                }
                debug!("another process is preparing {}, waiting", final_path.display());
                std::thread::sleep(retry);
            }
        }
    }
}

fn remove_artifact(tmp_path: &Path) {
    if let Err(err) = fs::remove_file(tmp_path) {
        error!("cannot clean up lock artifact {}: {err}", tmp_path.display());
    }
}

fn find_or_prepare_shared(
    seg: &Segment,
    dir: &Path,
    hpage_size: usize,
) -> Result<File, ShareError> {
    let identity = shared_file_identity(seg)?;
    let final_path = dir.join(&identity);
    let tmp_path = dir.join(format!("{identity}{TMP_SUFFIX}"));
    find_or_prepare(&final_path, &tmp_path, RETRY_INTERVAL, |file| {
        prepare_segment(seg, file, hpage_size)
    })
}

/// Attach a fully prepared backing file to the segment.
///
/// Read-only segments go through the shared protocol when a share
/// directory is available; a failed sharing attempt falls back to the
/// private path. Writable segments and disabled sharing use a private,
/// unlinked descriptor with no cross-process coordination at all.
pub fn obtain_prepared_file(
    seg: &mut Segment,
    share_dir: Option<&Path>,
    hpage_size: usize,
) -> Result<(), ShareError> {
    if let Some(dir) = share_dir {
        if !seg.prot.contains(Protection::WRITE) {
            match find_or_prepare_shared(seg, dir, hpage_size) {
                Ok(file) => {
                    seg.fd = Some(file);
                    return Ok(());
                }
                Err(err) => debug!("sharing failed ({err}), falling back to a private file"),
            }
        }
    }

    let file = hugefs::unlinked_fd(hpage_size)?;
    prepare_segment(seg, &file, hpage_size)?;
    seg.fd = Some(file);
    Ok(())
}
