//! Error types for media operations.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors that can occur during media processing.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("FFmpeg not found in PATH")]
    FfmpegNotFound,

    #[error("FFprobe not found in PATH")]
    FfprobeNotFound,

    /// An external tool exited with a non-zero status.
    #[error("{stage} failed (exit code {}): {diagnostics}", display_exit_code(.exit_code))]
    ExternalTool {
        stage: String,
        exit_code: Option<i32>,
        diagnostics: String,
    },

    #[error("Split produced no segments in {0}")]
    NoSegments(PathBuf),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid video file: {0}")]
    InvalidVideo(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn display_exit_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string())
}

impl MediaError {
    /// Create an external tool failure.
    pub fn external_tool(
        stage: impl Into<String>,
        exit_code: Option<i32>,
        diagnostics: impl Into<String>,
    ) -> Self {
        Self::ExternalTool {
            stage: stage.into(),
            exit_code,
            diagnostics: diagnostics.into(),
        }
    }

    /// Create a resource error (work dir missing, unwritable, ...).
    pub fn resource(message: impl Into<String>) -> Self {
        Self::Resource(message.into())
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Stage label for tool failures, if any.
    pub fn stage(&self) -> Option<&str> {
        match self {
            MediaError::ExternalTool { stage, .. } => Some(stage),
            _ => None,
        }
    }
}
