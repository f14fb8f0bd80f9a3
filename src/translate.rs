//! Ownership Translator (C2).
//!
//! Pure function layer: given a mode of operation, translates a (uid, gid)
//! pair. Operates atomically — if either half of the pair fails to
//! translate, the whole call fails and nothing is applied.

use crate::identity::IdentityOracle;
use crate::errors::{VolmanError, VolmanResult};

/// Which way ownership is being moved across the privilege boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host-native id -> namespace-shifted id (entering an Unprivileged tree).
    ToNamespace,
    /// Namespace-shifted id -> host-native id (entering a Privileged tree).
    ToHost,
    /// No-op; used when source and destination flavors match.
    Identity,
}

/// Pure translator, parameterized by the host's [`IdentityOracle`].
#[derive(Debug, Clone, Copy)]
pub struct Translator<'a> {
    oracle: &'a IdentityOracle,
}

impl<'a> Translator<'a> {
    pub fn new(oracle: &'a IdentityOracle) -> Self {
        Self { oracle }
    }

    /// Translate a single uid in the given direction.
    pub fn translate_uid(&self, direction: Direction, uid: u32) -> VolmanResult<u32> {
        match direction {
            Direction::Identity => Ok(uid),
            Direction::ToNamespace => to_namespace(uid, self.oracle.max_uid()),
            Direction::ToHost => to_host(uid, self.oracle.max_uid()),
        }
    }

    /// Translate a single gid in the given direction.
    pub fn translate_gid(&self, direction: Direction, gid: u32) -> VolmanResult<u32> {
        match direction {
            Direction::Identity => Ok(gid),
            Direction::ToNamespace => to_namespace(gid, self.oracle.max_gid()),
            Direction::ToHost => to_host(gid, self.oracle.max_gid()),
        }
    }

    /// Translate a (uid, gid) pair atomically: if either half fails, no
    /// partial result is returned.
    pub fn apply(&self, direction: Direction, uid: u32, gid: u32) -> VolmanResult<(u32, u32)> {
        let u = self.translate_uid(direction, uid)?;
        let g = self.translate_gid(direction, gid)?;
        Ok((u, g))
    }
}

/// `ToNamespace(0) == max`; for `0 < id < max`, `id + max` if it fits in
/// 32 bits, else out of range. Anything `>= max` is already namespace-side
/// and must not be shifted again.
fn to_namespace(id: u32, max: u32) -> VolmanResult<u32> {
    if id == 0 {
        return Ok(max);
    }
    if id >= max {
        return Err(VolmanError::IdentifierOutOfRange(id));
    }
    id.checked_add(max)
        .ok_or(VolmanError::IdentifierOutOfRange(id))
}

/// `ToHost(max) == 0`; for `id > max`, `id - max`. Anything `< max` is
/// already host-side and cannot be un-shifted.
fn to_host(id: u32, max: u32) -> VolmanResult<u32> {
    if id < max {
        return Err(VolmanError::IdentifierOutOfRange(id));
    }
    Ok(id - max)
}
