//! Object storage for vidpipe artifacts.
//!
//! Provides the S3-compatible client, the multipart upload protocol and
//! deterministic object keys.

pub mod client;
pub mod error;
pub mod keys;
pub mod multipart;

pub use client::{S3Client, S3Config};
pub use error::{StorageError, StorageResult};
pub use keys::{object_key, sanitize_file_name};
pub use multipart::{
    CompletedPartRecord, MultipartStore, MultipartUploader, UploadSession, UploadSummary,
    UploaderConfig,
};
