//! Error types for the volume manager core.

use thiserror::Error;

pub type VolmanResult<T> = Result<T, VolmanError>;

/// All errors the core can return.
///
/// Registry-level errors are fully recoverable by the caller. Input errors
/// abort the one operation. Infrastructure errors may additionally poison
/// the volume involved (see `VolmanError::PoisonedVolume`).
#[derive(Debug, Error)]
pub enum VolmanError {
    #[error("handle already exists: {0}")]
    HandleExists(String),

    #[error("volume not found: {0}")]
    NotFound(String),

    #[error("volume {0} has children and cannot be destroyed")]
    HasChildren(String),

    #[error("volume {0} is in use")]
    InUse(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("identifier out of range: {0}")]
    IdentifierOutOfRange(u32),

    #[error("malformed stream: {0}")]
    MalformedStream(String),

    #[error("backend failure: {0}")]
    BackendFailure(String),

    #[error("codec failure: {0}")]
    CodecFailure(String),

    #[error("parent volume missing: {0}")]
    ParentMissing(String),

    #[error("parent volume {0} is poisoned and cannot be cloned from")]
    PoisonedParent(String),

    #[error("volume {0} is poisoned and can only be destroyed")]
    PoisonedVolume(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}
