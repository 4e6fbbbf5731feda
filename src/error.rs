//! # Stage: Error Taxonomy
//!
//! ## Responsibility
//! Crate-level error types.  Every fallible public operation returns
//! [`Result<T>`], whose error is one of three families:
//!
//! - [`StorageError`]: knowledge-base connectivity, query, or serialization
//!   failure.  Surfaced to interactive callers; background workers log it
//!   and keep going.
//! - [`ValidationError`]: malformed cause, pattern, or configuration.
//!   Returned synchronously.
//! - [`RejectedTask`]: the scan-on-demand pool refused a task.
//!
//! Failing to start a worker runtime is reported as [`Error::Runtime`].
//!
//! Pattern timeouts are not errors; they are scanner outcomes
//! (see `scan::reader::ScanState`).

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Rejected(#[from] RejectedTask),

    #[error("failed to start {what}: {source}")]
    Runtime {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// StorageError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{backend} connection failed: {message}")]
    Connection { backend: &'static str, message: String },

    #[error("{backend} query failed: {message}")]
    Query { backend: &'static str, message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failure cause not found: {0}")]
    NotFound(String),

    #[error("build not found: {0}")]
    BuildNotFound(String),

    #[error("schema migration v{version} failed: {message}")]
    MigrationFailed { version: u32, message: String },
}

impl StorageError {
    pub(crate) fn query(backend: &'static str, e: impl std::fmt::Display) -> Self {
        StorageError::Query {
            backend,
            message: e.to_string(),
        }
    }

    pub(crate) fn connection(backend: &'static str, e: impl std::fmt::Display) -> Self {
        StorageError::Connection {
            backend,
            message: e.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// ValidationError
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("failure cause name must not be empty")]
    EmptyName,

    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

// ---------------------------------------------------------------------------
// RejectedTask
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RejectedTask {
    #[error("scan pool saturated ({workers} workers busy, {queued} tasks queued)")]
    Saturated { workers: usize, queued: usize },

    #[error("scan pool is shut down")]
    ShutDown,
}
