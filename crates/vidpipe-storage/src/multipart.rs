//! Chunked multipart upload with guaranteed completion or abort.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::error::{StorageError, StorageResult};

/// Default part size (10 MiB).
pub const DEFAULT_PART_SIZE: usize = 10 * 1024 * 1024;

/// Smallest part size S3 accepts for all but the last part.
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// One acknowledged part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPartRecord {
    pub part_number: i32,
    pub e_tag: String,
}

/// An open multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    pub parts: Vec<CompletedPartRecord>,
}

impl UploadSession {
    pub fn new(upload_id: impl Into<String>, bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            upload_id: upload_id.into(),
            bucket: bucket.into(),
            key: key.into(),
            parts: Vec::new(),
        }
    }

    /// Parts in ascending part-number order, as the completion call needs them.
    pub fn sorted_parts(&self) -> Vec<CompletedPartRecord> {
        let mut parts = self.parts.clone();
        parts.sort_by_key(|p| p.part_number);
        parts
    }
}

/// The multipart subset of an S3-compatible API.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MultipartStore: Send + Sync {
    /// Open an upload and return its id.
    async fn initiate(&self, bucket: &str, key: &str, content_type: &str) -> StorageResult<String>;

    /// Upload one part and return its e-tag.
    async fn upload_part(
        &self,
        session: &UploadSession,
        part_number: i32,
        body: Vec<u8>,
    ) -> StorageResult<String>;

    /// Finalize with `session.sorted_parts()`.
    async fn complete(&self, session: &UploadSession) -> StorageResult<()>;

    async fn abort(&self, session: &UploadSession) -> StorageResult<()>;
}

/// Uploader settings.
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    pub part_size: usize,
    /// Key prefix for job artifacts
    pub key_prefix: String,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            key_prefix: "files".to_string(),
        }
    }
}

impl UploaderConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let part_size = std::env::var("UPLOAD_PART_SIZE_BYTES")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_PART_SIZE);

        if part_size < MIN_PART_SIZE {
            warn!(
                "UPLOAD_PART_SIZE_BYTES={} is below the S3 minimum of {} bytes",
                part_size, MIN_PART_SIZE
            );
        }

        Self {
            part_size,
            key_prefix: std::env::var("STORAGE_KEY_PREFIX").unwrap_or_else(|_| "files".to_string()),
        }
    }
}

/// What a finished upload produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    pub parts: usize,
    pub bytes: u64,
}

/// Uploads local files through a [`MultipartStore`].
#[derive(Clone)]
pub struct MultipartUploader {
    store: Arc<dyn MultipartStore>,
    config: UploaderConfig,
}

impl MultipartUploader {
    pub fn new(store: Arc<dyn MultipartStore>, config: UploaderConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.config
    }

    /// Upload `local_path` to `bucket/key`.
    ///
    /// Reads one part at a time. On any failure after the session is opened the session is
    /// aborted before the error is returned.
    pub async fn upload(
        &self,
        local_path: impl AsRef<Path>,
        bucket: &str,
        key: &str,
    ) -> StorageResult<UploadSummary> {
        let local_path = local_path.as_ref();
        let size = tokio::fs::metadata(local_path).await?.len();
        if size == 0 {
            return Err(StorageError::invalid_input(format!(
                "{} is empty",
                local_path.display()
            )));
        }

        let started = Instant::now();
        let upload_id = self
            .store
            .initiate(bucket, key, content_type_for(local_path))
            .await?;
        let mut session = UploadSession::new(upload_id, bucket, key);
        debug!(key = key, upload_id = %session.upload_id, "Opened multipart upload");

        let result = match self.send_parts(local_path, &mut session).await {
            Ok(bytes) => self.store.complete(&session).await.map(|_| bytes),
            Err(e) => Err(e),
        };

        match result {
            Ok(bytes) => {
                metrics::counter!("vidpipe_upload_bytes_total").increment(bytes);
                metrics::histogram!("vidpipe_upload_duration_seconds")
                    .record(started.elapsed().as_secs_f64());
                info!(
                    key = key,
                    parts = session.parts.len(),
                    bytes = bytes,
                    "Uploaded {} in {:.1}s",
                    local_path.display(),
                    started.elapsed().as_secs_f64()
                );
                Ok(UploadSummary {
                    bucket: session.bucket.clone(),
                    key: session.key.clone(),
                    upload_id: session.upload_id.clone(),
                    parts: session.parts.len(),
                    bytes,
                })
            }
            Err(e) => {
                if let Err(abort_err) = self.store.abort(&session).await {
                    warn!(
                        key = key,
                        upload_id = %session.upload_id,
                        "Abort after failed upload also failed: {}",
                        abort_err
                    );
                } else {
                    debug!(key = key, upload_id = %session.upload_id, "Aborted multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn send_parts(&self, local_path: &Path, session: &mut UploadSession) -> StorageResult<u64> {
        let mut file = File::open(local_path).await?;
        let part_size = self.config.part_size.max(1);
        let mut total = 0u64;
        let mut part_number = 1i32;

        loop {
            let mut buf = Vec::with_capacity(part_size);
            (&mut file).take(part_size as u64).read_to_end(&mut buf).await?;
            if buf.is_empty() {
                break;
            }

            let len = buf.len() as u64;
            let e_tag = self.store.upload_part(session, part_number, buf).await?;
            session.parts.push(CompletedPartRecord { part_number, e_tag });

            total += len;
            part_number += 1;
        }

        if session.parts.is_empty() {
            return Err(StorageError::invalid_input(format!(
                "{} had no readable content",
                local_path.display()
            )));
        }

        Ok(total)
    }
}

/// Content type from the file extension.
pub fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        _ => "application/octet-stream",
    }
}
