//! Storage error types.

use motorlog_types::ChangeId;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur while reading or writing on-device state.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("pending change not found: {0}")]
    NotFound(ChangeId),

    #[error("invalid change: {0}")]
    InvalidChange(String),

    #[error("storage lock poisoned")]
    LockPoisoned,
}
