//! Storage engine module providing the revisioned key space of the metastorage.
//!
//! The storage module keeps, for every key, an append-only history of
//! `(revision, value-or-tombstone)` entries. The model ensures:
//!
//! - Every applied batch is stamped with exactly one, strictly increasing revision
//! - Point-in-time reads at any revision at or above the compaction watermark
//! - Tombstones are retained until compaction trims them
//! - Compaction only ever removes history strictly below the watermark
//!
//! Reads below the watermark fail with [`StorageError::Compacted`], which carries the
//! current watermark so callers can retry without an extra round trip.

pub mod compaction;
pub mod revision;
pub mod store;

pub use compaction::{CompactionError, CompactionManager, CompactionMode, Compactor};
pub use revision::{Entry, KeyHistory, Revision};
pub use store::{BatchOutcome, RevisionStore, StoreState, StoreView};

use thiserror::Error;

/// Error category surfaced to callers.
///
/// Callers branch on [`ErrorCode::Compaction`] to refresh their revision and retry,
/// instead of treating the failure as fatal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The requested revision was removed by compaction.
    Compaction,
    /// The key has no live entry at the requested revision.
    NotFound,
    /// The request itself was invalid (for example a revision from the future).
    InvalidArgument,
    /// Internal consistency failure.
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Compaction => "COMPACTION_ERR",
            ErrorCode::NotFound => "NOT_FOUND_ERR",
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT_ERR",
            ErrorCode::Internal => "INTERNAL_ERR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage engine errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Revision {requested} has been compacted, retry at or above watermark {watermark}")]
    Compacted { requested: Revision, watermark: Revision },

    #[error("Key {} not found at revision {revision}", String::from_utf8_lossy(key))]
    NotFound { key: Vec<u8>, revision: Revision },

    #[error("Revision {requested} is ahead of the latest applied revision {latest}")]
    FutureRevision { requested: Revision, latest: Revision },

    #[error("History of key {} would be rewritten: last revision {last}, attempted {attempted}", String::from_utf8_lossy(key))]
    HistoryRewrite {
        key: Vec<u8>,
        last: Revision,
        attempted: Revision,
    },

    #[error("Batch revision {attempted} does not follow store revision {current}")]
    RevisionGap { current: Revision, attempted: Revision },

    #[error("Snapshot error: {0}")]
    Snapshot(String),
}

impl StorageError {
    /// Returns the error category carried by this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            StorageError::Compacted { .. } => ErrorCode::Compaction,
            StorageError::NotFound { .. } => ErrorCode::NotFound,
            StorageError::FutureRevision { .. } => ErrorCode::InvalidArgument,
            StorageError::HistoryRewrite { .. }
            | StorageError::RevisionGap { .. }
            | StorageError::Snapshot(_) => ErrorCode::Internal,
        }
    }

    /// Returns the watermark to retry against, if this is a compaction error.
    pub fn retry_watermark(&self) -> Option<Revision> {
        match self {
            StorageError::Compacted { watermark, .. } => Some(*watermark),
            _ => None,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
