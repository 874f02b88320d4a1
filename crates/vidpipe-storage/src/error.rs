//! Storage error types.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to configure storage client: {0}")]
    ConfigError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Failed to initiate multipart upload: {0}")]
    InitiateFailed(String),

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Failed to complete multipart upload: {0}")]
    CompleteFailed(String),

    #[error("Failed to abort multipart upload: {0}")]
    AbortFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("AWS SDK error: {0}")]
    AwsSdk(String),
}

impl StorageError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn initiate_failed(msg: impl Into<String>) -> Self {
        Self::InitiateFailed(msg.into())
    }

    pub fn upload_failed(msg: impl Into<String>) -> Self {
        Self::UploadFailed(msg.into())
    }

    pub fn complete_failed(msg: impl Into<String>) -> Self {
        Self::CompleteFailed(msg.into())
    }

    pub fn abort_failed(msg: impl Into<String>) -> Self {
        Self::AbortFailed(msg.into())
    }
}
