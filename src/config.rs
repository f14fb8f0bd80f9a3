//! Process-wide identity range configuration.
//!
//! `MAX_UID`/`MAX_GID` are resolved once, at manager-construction time, and
//! treated as read-only constants for the remainder of the process
//! lifetime (spec Design Notes: "Global state").

use std::env;

/// The conventional single-range subuid/subgid size on Linux hosts that
/// support user namespaces, used when no explicit override is configured.
const DEFAULT_MAX_ID: u32 = 65536;

/// A resolved, immutable identity range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityRange {
    max_uid: u32,
    max_gid: u32,
}

impl IdentityRange {
    /// Resolve the identity range from the environment, falling back to
    /// [`DEFAULT_MAX_ID`] for whichever variable is unset or unparsable.
    pub fn from_env() -> Self {
        Self {
            max_uid: read_env_u32("VOLMAN_MAX_UID").unwrap_or(DEFAULT_MAX_ID),
            max_gid: read_env_u32("VOLMAN_MAX_GID").unwrap_or(DEFAULT_MAX_ID),
        }
    }

    /// Build an explicit range, bypassing the environment. Mainly for tests.
    pub fn new(max_uid: u32, max_gid: u32) -> Self {
        Self { max_uid, max_gid }
    }

    pub fn max_uid(&self) -> u32 {
        self.max_uid
    }

    pub fn max_gid(&self) -> u32 {
        self.max_gid
    }
}

impl Default for IdentityRange {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ID, DEFAULT_MAX_ID)
    }
}

fn read_env_u32(key: &str) -> Option<u32> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_range_is_strictly_positive() {
        let range = IdentityRange::default();
        assert!(range.max_uid() > 0);
        assert!(range.max_gid() > 0);
    }

    #[test]
    fn explicit_range_round_trips() {
        let range = IdentityRange::new(100, 200);
        assert_eq!(range.max_uid(), 100);
        assert_eq!(range.max_gid(), 200);
    }
}
