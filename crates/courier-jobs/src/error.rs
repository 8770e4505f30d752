//! Error types for the dispatcher.

use thiserror::Error;

use crate::JobKind;

/// Errors raised by a [`JobStore`](crate::JobStore) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The backing store cannot be reached.
    #[error("job store is unavailable")]
    Unavailable,
}

/// Errors that can occur in dispatcher operations.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Persistence failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A job kind has no registered handler.
    #[error("no handler registered for job kind: {0}")]
    MissingHandler(JobKind),

    /// The dispatcher's worker has stopped and no longer admits jobs.
    #[error("dispatcher has shut down")]
    ShutDown,
}

/// A string that is not a valid job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid job id: {0:?}")]
pub struct InvalidJobId(pub String);

/// A string that does not name a known job kind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown job kind: {0:?}")]
pub struct UnknownJobKind(pub String);
