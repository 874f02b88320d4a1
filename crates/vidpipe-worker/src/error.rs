//! Worker error types.

use std::path::PathBuf;

use thiserror::Error;
use vidpipe_media::MediaError;
use vidpipe_storage::StorageError;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("Input file missing: {0}")]
    MissingInput(PathBuf),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] vidpipe_queue::QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn job_failed(msg: impl Into<String>) -> Self {
        Self::JobFailed(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Failures another attempt cannot fix. These skip straight to the dead-letter queue.
    pub fn is_permanent_failure(&self) -> bool {
        matches!(
            self,
            WorkerError::MissingInput(_)
                | WorkerError::Media(MediaError::InvalidVideo(_))
                | WorkerError::Media(MediaError::FileNotFound(_))
                | WorkerError::Storage(StorageError::InvalidInput(_))
        )
    }

    /// Pipeline stage the error came from, when known.
    pub fn stage(&self) -> Option<&str> {
        match self {
            WorkerError::Media(e) => e.stage(),
            WorkerError::Storage(_) => Some("upload"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_failures() {
        assert!(WorkerError::MissingInput(PathBuf::from("a.mp4")).is_permanent_failure());
        assert!(WorkerError::Storage(StorageError::invalid_input("empty")).is_permanent_failure());
        assert!(!WorkerError::Storage(StorageError::upload_failed("503")).is_permanent_failure());
        assert!(!WorkerError::Media(MediaError::external_tool("transcode", Some(1), "x"))
            .is_permanent_failure());
    }

    #[test]
    fn test_stage() {
        let err = WorkerError::Media(MediaError::external_tool("split", Some(1), ""));
        assert_eq!(err.stage(), Some("split"));
        assert_eq!(WorkerError::Storage(StorageError::upload_failed("x")).stage(), Some("upload"));
        assert_eq!(WorkerError::job_failed("x").stage(), None);
    }
}
