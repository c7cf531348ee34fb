//! Storage error types.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("storage operation timed out: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 error: {0}")]
    S3(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid continuation token: {0}")]
    InvalidContinuationToken(String),

    #[error("listing not resumable: this backend does not support continuation tokens")]
    ListingNotResumable,
}

impl StorageError {
    /// Map an I/O error for `key`, surfacing not-found, permission and timeout kinds.
    pub fn from_io(err: std::io::Error, key: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
            std::io::ErrorKind::PermissionDenied => {
                StorageError::PermissionDenied(format!("{key}: {err}"))
            }
            std::io::ErrorKind::TimedOut => StorageError::Timeout(format!("{key}: {err}")),
            _ => StorageError::Io(err),
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
