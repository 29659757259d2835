//! Tunables for the block access loop

use crate::constants::{DEFAULT_MAX_ATTEMPTS, ENV_COMPACT_ON_RELEASE, ENV_MAX_ATTEMPTS};
use log::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessConfig {
    /// Fetch/apply/CAS rounds before giving up with `ConcurrentModification`.
    pub max_attempts: usize,
    /// Drop unreferenced attribute records in the same write as a release.
    /// Off by default; [`BlockStore::compact`](crate::BlockStore::compact)
    /// is the explicit maintenance call.
    pub compact_on_release: bool,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            compact_on_release: false,
        }
    }
}

impl AccessConfig {
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_compact_on_release(mut self, compact: bool) -> Self {
        self.compact_on_release = compact;
        self
    }

    /// Defaults overridden by `IPAM_BLOCK_MAX_ATTEMPTS` and
    /// `IPAM_BLOCK_COMPACT_ON_RELEASE`. Unparseable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(raw) = lookup(ENV_MAX_ATTEMPTS) {
            match raw.trim().parse::<usize>() {
                Ok(n) => cfg = cfg.with_max_attempts(n),
                Err(_) => warn!("ignoring {ENV_MAX_ATTEMPTS}={raw:?}: not a count"),
            }
        }
        if let Some(raw) = lookup(ENV_COMPACT_ON_RELEASE) {
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => cfg.compact_on_release = true,
                "0" | "false" | "no" | "off" => cfg.compact_on_release = false,
                _ => warn!("ignoring {ENV_COMPACT_ON_RELEASE}={raw:?}: not a boolean"),
            }
        }
        cfg
    }
}
