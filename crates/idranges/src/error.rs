//! Error types for range algebra, shared sets and the allocator.
//!
//! This module defines the central [`Error`] enum. Errors fall into two
//! groups:
//!
//! - **Transient** backend failures ([`Error::VersionConflict`],
//!   [`Error::BackendUnavailable`]) are retried by the allocator up to its
//!   attempt budget. See [`Error::is_transient`].
//! - Everything else indicates a logic error or unusable state and is
//!   surfaced to the caller immediately.

use crate::Range;

/// A result type defaulting to this crate's [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Unified error type for `idranges`.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// A consuming operation was attempted on a read-only range or set.
    #[error("range is read only")]
    ReadOnly,

    /// A take was attempted on a range or set with no IDs remaining.
    #[error("no IDs remaining")]
    Empty,

    /// A batch of zero IDs was requested.
    #[error("ID count must be greater than 0")]
    InvalidCount,

    /// Two sets with different categories were combined.
    #[error("category mismatch: expected '{expected}', found '{found}'")]
    CategoryMismatch { expected: String, found: String },

    /// A pushed range intersects a range already held by the set.
    #[error("pushed range {pushed} overlaps existing range {existing} in category '{category}'")]
    Overlap {
        pushed: Range,
        existing: Range,
        category: String,
    },

    /// A conditional write or delete was rejected because the record changed
    /// since it was read.
    #[error("version conflict for category '{category}'")]
    VersionConflict { category: String },

    /// The backend could not be reached or refused the operation.
    #[error("backend unavailable: {reason}")]
    BackendUnavailable { reason: String },

    /// Stored state could not be decoded as a range set.
    #[error("malformed state: {reason}")]
    MalformedState { reason: String },

    /// The backend holds no state for a category that must already exist.
    #[error("no state stored for category '{category}'")]
    MissingState { category: String },

    /// Withdrawing a batch failed after exhausting every attempt.
    #[error("failed to take IDs for category '{category}': {last}")]
    AllocationFailed {
        category: String,
        #[source]
        last: Box<Error>,
    },

    /// Returning a batch failed after exhausting every attempt.
    #[error("failed to push IDs for category '{category}': {last}")]
    PushFailed {
        category: String,
        #[source]
        last: Box<Error>,
    },

    /// No batch is cached for the category.
    #[error("no cached batch for category '{category}'")]
    NoCachedBatch { category: String },

    /// The cached batch is read only and cannot be returned.
    #[error("cached batch for category '{category}' is read only")]
    ReadOnlyBatch { category: String },

    /// The cached batch has nothing left to return.
    #[error("cached batch for category '{category}' is empty")]
    EmptyBatch { category: String },

    /// Internal channel send/receive failure between tasks.
    #[error("channel error: {context}")]
    ChannelError { context: String },

    /// The owning task has stopped and no longer accepts requests.
    #[error("service is shutting down")]
    ServiceShutdown,

    /// The configuration is unusable.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl Error {
    /// Returns `true` for backend failures that a fresh read-modify-write
    /// cycle may resolve.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::VersionConflict { .. } | Self::BackendUnavailable { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedState {
            reason: err.to_string(),
        }
    }
}
