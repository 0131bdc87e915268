// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Stderr logger for debug runs.
//!
//! Only installed when `HUGETLB_DEBUG` is set, so a host application that
//! installs its own logger later is never preempted in normal operation.
//! Must never be reached from the unmap/remap window.

use log::{LevelFilter, Log, Metadata, Record};

#[derive(Debug)]
struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        eprintln!("libhugemap [{}] {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

/// Install the stderr logger at debug verbosity. Loses quietly if the host
/// process already installed one.
pub(crate) fn install() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
}
