//! Synchronizer error types.

use crate::api_client::RejectionDetail;
use motorlog_storage::StorageError;
use thiserror::Error;

/// Result type for synchronizer operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced to callers of the synchronizer.
///
/// Per-change outcomes of a drain never show up here; they are recorded on
/// the change itself.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("mutation rejected: {0}")]
    Rejected(RejectionDetail),

    #[error("sync coordinator is not running")]
    NotRunning,

    #[error("invalid configuration: {0}")]
    Config(String),
}
