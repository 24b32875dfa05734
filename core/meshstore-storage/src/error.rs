//! Error types for the storage layer.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Object not found.
    #[error("object not found: {0}")]
    NotFound(String),

    /// Data that cannot be stored or replicated.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// The engine is already borrowed by the current call stack.
    #[error("store is busy")]
    Busy,

    /// IO error (file system).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
