// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transparent huge page backing for linker-flagged program segments.
//!
//! A program whose linker script marks text or data segments for huge pages
//! gets them remapped onto hugetlbfs-backed memory at startup, before user
//! code runs, with no source changes and no API calls. The work happens
//! once, from an `.init_array` constructor:
//!
//! 1. eligible segments are discovered from the program's own load metadata
//!    ([`image`]),
//! 2. the live portion of each zero-filled tail is pinned down
//!    ([`extracopy`]),
//! 3. a huge page backed file is populated with the segment's bytes
//!    ([`prepare`]), optionally shared with other processes running the
//!    same binary through a race-safe publish-by-rename protocol
//!    ([`share`]),
//! 4. the original mappings are replaced in place ([`remap`]).
//!
//! Any failure before step 4 abandons the procedure and leaves the process
//! running untouched on standard pages. Failures inside step 4 are fatal:
//! the address space is already partially gone, so the process aborts
//! through a raw-syscall path ([`emergency`]).
//!
//! Behavior is controlled by environment variables ([`config`]); huge page
//! pool sizing and the hugetlbfs mount itself are the operator's job.

pub mod config;
pub mod emergency;
pub mod extracopy;
pub mod image;
mod logger;
pub mod prepare;
pub mod remap;
pub mod segment;
pub mod share;

use log::{debug, warn};

pub use crate::config::{Config, Sharing};
pub use crate::image::ExecutableImage;
pub use crate::segment::{ExtraCopy, Protection, Segment, SegmentTable, MAX_SEGMENTS};

#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum SetupError {
    /// {0}
    Scan(#[from] image::ScanError),
    /// Cannot determine the huge page size: {0}
    PageSize(hugefs::FsError),
    /// Cannot set up the share directory: {0}
    ShareDir(share::ShareError),
    /// Cannot obtain a prepared file for segment {0}: {1}
    ObtainFile(usize, share::ShareError),
}

/// Run the whole remapping sequence.
///
/// Called from the constructor; a program linking the rlib can also call it
/// directly after adjusting the environment. Never panics and never leaves
/// partial state behind on failure: the process ends up fully remapped or
/// keeps running untouched on standard pages. Only a failure inside the
/// remap window itself terminates the process.
pub fn setup() {
    let cfg = Config::from_env();
    if cfg.debug {
        logger::install();
    }
    if !cfg.remap {
        return;
    }
    match try_setup(&cfg) {
        Ok(true) => debug!("segment remapping complete"),
        Ok(false) => {}
        Err(err) => warn!("abandoning segment remapping: {err}"),
    }
}

/// Returns whether a remap actually happened; `Ok(false)` is the clean
/// no-op path for binaries without flagged segments.
fn try_setup(cfg: &Config) -> Result<bool, SetupError> {
    let Some(image) = ExecutableImage::from_auxv() else {
        debug!("no program header table from the loader, not attempting to remap");
        return Ok(false);
    };

    let mut segments = image.scan_segments()?;
    if segments.is_empty() {
        debug!("executable is not linked for huge page segments");
        return Ok(false);
    }

    let tables = image.dynamic_tables();
    let marker = tables.as_ref().and_then(|tables| tables.lookup(image::COPY_END_MARKER));
    if let Some(marker) = marker {
        debug!("copy-end marker at {marker:#x}");
    }
    for seg in &mut segments {
        seg.extra =
            extracopy::compute(seg, tables.as_ref().map(|tables| tables.symbols()), marker, cfg);
    }

    let hpage_size = hugefs::hugepage_size().map_err(SetupError::PageSize)?;

    let share_dir = match cfg.sharing {
        Sharing::ReadOnly => {
            Some(share::resolve_share_dir(cfg).map_err(SetupError::ShareDir)?)
        }
        Sharing::Disabled => None,
    };

    for seg in &mut segments {
        let index = seg.phdr_index;
        share::obtain_prepared_file(seg, share_dir.as_deref(), hpage_size)
            .map_err(|err| SetupError::ObtainFile(index, err))?;
    }

    // SAFETY: process initialization is single-threaded, every segment now
    // carries a prepared descriptor, and remap_segments aborts instead of
    // returning on failure.
    unsafe { remap::remap_segments(&segments, hpage_size) };
    Ok(true)
}

extern "C" fn init() {
    setup();
}

// Runs before main, alongside every other initializer the loader executes.
#[used]
#[link_section = ".init_array"]
static SETUP: extern "C" fn() = init;
