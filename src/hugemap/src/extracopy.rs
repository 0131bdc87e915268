// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Minimal-copy analysis of a segment's zero-filled tail.
//!
//! Runtime dependencies initialize before this library does, and some of
//! them store into global data living in the tail (the classic case is the
//! C runtime setting up its standard streams). Those bytes must travel into
//! the prepared file. Copying the whole tail is always correct but inflates
//! shared files; the dynamic symbol table usually pins down the handful of
//! objects that can actually hold live data.

use log::{debug, warn};

use crate::config::Config;
use crate::image::{self, Sym};
use crate::segment::{ExtraCopy, Segment};

/// Candidate live data in the tail: a global or weak object with actual
/// size. Zero-sized symbols are markers, not data.
fn keep_symbol(sym: &Sym, tail_start: usize, tail_end: usize) -> bool {
    let value = sym.st_value as usize;
    value >= tail_start && value < tail_end && image::is_data_object(sym) && sym.st_size != 0
}

/// Compute the extra-copy range for a segment's tail.
///
/// The tight range spans every candidate symbol and is stretched to the
/// copy-end marker when that lies further out. Whenever the symbol
/// information cannot be trusted to be complete (optimization disabled,
/// tables missing, or no candidate found at all) the whole tail is
/// returned instead. `None` means the segment has no tail.
pub fn compute(
    seg: &Segment,
    syms: Option<&[Sym]>,
    marker: Option<usize>,
    cfg: &Config,
) -> Option<ExtraCopy> {
    let tail_start = seg.tail_start();
    let tail_end = seg.end();
    if tail_start == tail_end {
        return None;
    }
    let full_tail = ExtraCopy { vaddr: tail_start, len: tail_end - tail_start };

    if !cfg.minimal_copy {
        return Some(full_tail);
    }
    let Some(syms) = syms else {
        debug!("dynamic tables unavailable, copying the whole tail");
        return Some(full_tail);
    };

    let mut start = tail_end;
    let mut end = tail_start;
    let mut found = false;
    for sym in syms {
        if !keep_symbol(sym, tail_start, tail_end) {
            continue;
        }
        found = true;
        start = start.min(sym.st_value as usize);
        end = end.max(sym.st_value as usize + sym.st_size as usize);
    }
    if !found {
        debug!("no candidate symbols in the tail, copying the whole tail");
        return Some(full_tail);
    }

    if let Some(marker) = marker {
        if marker > end {
            debug!("copy-end marker at {marker:#x} extends the copy window");
            end = marker;
        }
    }
    // Symbol sizes and the marker must not drag the window out of the tail.
    let end = end.min(tail_end);

    if cfg.debug {
        check_tail(end, tail_end);
    }

    Some(ExtraCopy { vaddr: start, len: end - start })
}

/// Scan the words excluded from the copy window. A non-zero value there
/// means the window would silently drop live data.
fn check_tail(start: usize, end: usize) {
    let mut addr = start;
    while addr + std::mem::size_of::<usize>() <= end {
        // SAFETY: [start, end) lies inside the still-mapped tail of a live
        // segment.
        let word = unsafe { std::ptr::read_unaligned(addr as *const usize) };
        if word != 0 {
            warn!("non-zero tail data at {addr:#x}: {word:#x}");
        }
        addr += std::mem::size_of::<usize>();
    }
}
