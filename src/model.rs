//! Volume data model (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Opaque, printable identifier, unique within the Registry.
pub type Handle = String;

/// A volume's privilege flavor. Observable only through on-disk ownership;
/// file modes (including setuid/setgid bits) are preserved verbatim across
/// all operations regardless of flavor (spec invariant 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Flavor {
    Privileged,
    Unprivileged,
}

/// How a volume's storage was constructed. Immutable once set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    Empty,
    Cow { parent: Handle },
}

/// A volume's lifecycle status, tracked so poisoned volumes reject further
/// operations until destroyed (spec §5, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Active,
    Poisoned,
}

/// A Volume record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub handle: Handle,
    pub path: PathBuf,
    pub flavor: Flavor,
    pub parent: Option<Handle>,
    pub strategy: Strategy,
    pub status: Status,
    pub created_at: DateTime<Utc>,
}

impl Volume {
    pub fn new_empty(handle: Handle, path: PathBuf, flavor: Flavor) -> Self {
        Self {
            handle,
            path,
            flavor,
            parent: None,
            strategy: Strategy::Empty,
            status: Status::Active,
            created_at: Utc::now(),
        }
    }

    pub fn new_cow(handle: Handle, path: PathBuf, flavor: Flavor, parent: Handle) -> Self {
        Self {
            handle,
            path,
            flavor,
            parent: Some(parent.clone()),
            strategy: Strategy::Cow { parent },
            status: Status::Active,
            created_at: Utc::now(),
        }
    }

    pub fn is_poisoned(&self) -> bool {
        matches!(self.status, Status::Poisoned)
    }
}
