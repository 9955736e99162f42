//! Crate-wide error type.

use std::time::Duration;

use thiserror::Error as ThisError;

use super::page_id::{PageId, VolumeId};

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// All possible errors produced by foliodb.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("volume {0} is corrupt: {1}")]
    CorruptVolume(String, String),

    #[error("journal is corrupt: {0}")]
    CorruptJournal(String),

    #[error("page {1:?} of volume {0:?} is corrupt")]
    CorruptPage(VolumeId, PageId),

    #[error("transaction rolled back: {0}")]
    Rollback(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("engine is closed")]
    EngineClosed,

    #[error("tree {0:?} not found")]
    TreeNotFound(String),

    #[error("volume {0:?} is full")]
    VolumeFull(String),

    #[error("no buffer frame available")]
    BufferUnavailable,

    #[error("unknown split/join policy {0:?}")]
    UnknownPolicy(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("missing configuration key {0:?}")]
    MissingConfiguration(String),

    #[error("invalid configuration for {0:?}: {1}")]
    InvalidConfiguration(String, String),

    #[error("fatal error: {0}")]
    Fatal(String),
}

impl Error {
    /// Whether this error is transient and worth retrying later
    /// (e.g. a bounded pin wait or eviction spin that simply didn't
    /// find a frame in time).
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::BufferUnavailable)
    }
}
