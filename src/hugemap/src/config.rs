// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Environment-driven configuration.
//!
//! Read once by the orchestrator and passed by reference through every
//! stage; no component consults the environment on its own.

use std::path::PathBuf;

use log::{debug, error};

/// Cross-process sharing of prepared segment files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sharing {
    Disabled,
    /// Share only read-only segments. Writable segments are never shared:
    /// one process's stores would corrupt every other process's view.
    ReadOnly,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Master switch; `HUGETLB_ELFMAP=no` or a preloaded copy of this
    /// library turns the whole procedure off.
    pub remap: bool,
    /// Copy only symbol-covered tail data instead of the whole tail.
    pub minimal_copy: bool,
    pub sharing: Sharing,
    /// Extra consistency checks and verbose diagnostics.
    pub debug: bool,
    /// Explicit shared-directory override; must reside on hugetlbfs.
    pub share_path: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup, so tests can drive the
    /// parsing without mutating the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut remap = true;

        if let Some(val) = lookup("HUGETLB_ELFMAP") {
            if val.eq_ignore_ascii_case("no") {
                debug!("HUGETLB_ELFMAP={val}, not attempting to remap program segments");
                remap = false;
            }
        }

        if let Some(val) = lookup("LD_PRELOAD") {
            if val.contains("hugemap") {
                error!("LD_PRELOAD is incompatible with segment remapping");
                error!("segment remapping has been disabled");
                remap = false;
            }
        }

        let minimal_copy = match lookup("HUGETLB_MINIMAL_COPY") {
            Some(val) if val.eq_ignore_ascii_case("no") => {
                debug!("HUGETLB_MINIMAL_COPY={val}, disabling filesz copy optimization");
                false
            }
            _ => true,
        };

        let sharing = match lookup("HUGETLB_SHARE").map(|val| val.parse::<u32>().unwrap_or(0)) {
            None | Some(0) => Sharing::Disabled,
            Some(1) => {
                debug!("HUGETLB_SHARE=1, sharing enabled for read-only segments");
                Sharing::ReadOnly
            }
            Some(other) => {
                error!(
                    "HUGETLB_SHARE={other} is no longer supported, sharing disabled"
                );
                Sharing::Disabled
            }
        };

        let debug = lookup("HUGETLB_DEBUG").is_some();
        if debug {
            debug!("HUGETLB_DEBUG set, enabling extra checking");
        }

        let share_path = lookup("HUGETLB_SHARE_PATH").map(PathBuf::from);

        Config { remap, minimal_copy, sharing, debug, share_path }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_vars(vars: &[(&str, &str)]) -> Config {
        let map: HashMap<&str, &str> = vars.iter().copied().collect();
        Config::from_lookup(|name| map.get(name).map(|val| (*val).to_string()))
    }

    #[test]
    fn test_defaults() {
        let cfg = from_vars(&[]);
        assert!(cfg.remap);
        assert!(cfg.minimal_copy);
        assert_eq!(cfg.sharing, Sharing::Disabled);
        assert!(!cfg.debug);
        assert!(cfg.share_path.is_none());
    }

    #[test]
    fn test_elfmap_no_disables_remap() {
        assert!(!from_vars(&[("HUGETLB_ELFMAP", "no")]).remap);
        assert!(!from_vars(&[("HUGETLB_ELFMAP", "NO")]).remap);
        assert!(from_vars(&[("HUGETLB_ELFMAP", "yes")]).remap);
    }

    #[test]
    fn test_preloaded_library_disables_remap() {
        assert!(!from_vars(&[("LD_PRELOAD", "/usr/lib/libhugemap.so")]).remap);
        assert!(from_vars(&[("LD_PRELOAD", "/usr/lib/libother.so")]).remap);
    }

    #[test]
    fn test_minimal_copy_toggle() {
        assert!(!from_vars(&[("HUGETLB_MINIMAL_COPY", "no")]).minimal_copy);
        assert!(from_vars(&[("HUGETLB_MINIMAL_COPY", "yes")]).minimal_copy);
    }

    #[test]
    fn test_sharing_modes() {
        assert_eq!(from_vars(&[("HUGETLB_SHARE", "0")]).sharing, Sharing::Disabled);
        assert_eq!(from_vars(&[("HUGETLB_SHARE", "1")]).sharing, Sharing::ReadOnly);
        // Writable-segment sharing is a rejected historical mode.
        assert_eq!(from_vars(&[("HUGETLB_SHARE", "2")]).sharing, Sharing::Disabled);
        assert_eq!(from_vars(&[("HUGETLB_SHARE", "junk")]).sharing, Sharing::Disabled);
    }

    #[test]
    fn test_debug_and_share_path() {
        let cfg = from_vars(&[("HUGETLB_DEBUG", "1"), ("HUGETLB_SHARE_PATH", "/mnt/huge")]);
        assert!(cfg.debug);
        assert_eq!(cfg.share_path.as_deref(), Some(std::path::Path::new("/mnt/huge")));
    }
}
