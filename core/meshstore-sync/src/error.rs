//! Error types for the sync layer.

use meshstore_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network error (connect, bind, or resolve).
    #[error("network error: {0}")]
    Network(String),

    /// I/O error on an open connection.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error (invalid or out-of-place message).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Background task failed to complete.
    #[error("task failed: {0}")]
    Task(String),

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Connection closed.
    #[error("connection closed")]
    Closed,
}
