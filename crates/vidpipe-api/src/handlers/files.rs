//! File upload handler.

use std::io;
use std::path::{Path, PathBuf};

use axum::extract::multipart::Field;
use axum::extract::{Multipart, State};
use axum::Json;
use chrono::Utc;
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio_util::io::StreamReader;
use tracing::{info, warn};

use vidpipe_models::{JobId, UploadedFile};
use vidpipe_storage::sanitize_file_name;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Multipart field carrying the upload.
pub const FILE_FIELD: &str = "file";

/// Accepted container extensions, compared case-insensitively.
const ALLOWED_EXTENSIONS: [&str; 2] = ["mp4", "mov"];

/// Name collisions tolerated before giving up on a unique name.
const MAX_NAME_ATTEMPTS: i64 = 16;

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub message: String,
    pub job_id: JobId,
}

/// File as written to the upload directory.
#[derive(Debug)]
struct StoredUpload {
    path: PathBuf,
    original_name: String,
    size: u64,
}

/// `POST /api/v1/files`
///
/// Streams the `file` field to the upload directory and enqueues an upload job for it.
pub async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<UploadResponse>> {
    let mut stored = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        stored = Some(store_field(&state, field).await?);
        break;
    }

    let stored = stored.ok_or_else(|| ApiError::validation("File is required"))?;
    let file = UploadedFile::new(&stored.path, stored.original_name.clone(), stored.size);

    match state.dispatcher.enqueue_file(file).await {
        Ok(job_id) => {
            info!(
                job_id = %job_id,
                bytes = stored.size,
                "Accepted upload {}", stored.path.display()
            );
            Ok(Json(UploadResponse {
                message: "File accepted for processing".to_string(),
                job_id,
            }))
        }
        Err(e) => {
            discard(&stored.path).await;
            Err(e.into())
        }
    }
}

async fn store_field(state: &AppState, field: Field<'_>) -> ApiResult<StoredUpload> {
    let original_name = field
        .file_name()
        .map(str::to_string)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ApiError::validation("File is required"))?;
    validate_extension(&original_name)?;

    let upload_dir = &state.config.upload_dir;
    tokio::fs::create_dir_all(upload_dir).await?;
    let (path, file) = create_unique(upload_dir, &original_name).await?;

    let limit = state.config.max_upload_bytes();
    let written = match write_limited(field, file, limit).await {
        Ok(written) => written,
        Err(e) => {
            discard(&path).await;
            return Err(ApiError::bad_request(format!("Upload interrupted: {}", e)));
        }
    };

    if written > limit {
        discard(&path).await;
        return Err(ApiError::validation(format!(
            "File exceeds the {} MB limit",
            state.config.max_upload_mb
        )));
    }
    if written == 0 {
        discard(&path).await;
        return Err(ApiError::validation("File is empty"));
    }

    Ok(StoredUpload {
        path,
        original_name,
        size: written,
    })
}

/// Copy at most `limit + 1` bytes so an oversized body is detected without reading all of it.
async fn write_limited(field: Field<'_>, file: File, limit: u64) -> io::Result<u64> {
    let body = field.map_err(|e| io::Error::new(io::ErrorKind::Other, e));
    let reader = StreamReader::new(body);
    tokio::pin!(reader);

    let mut limited = reader.take(limit.saturating_add(1));
    let mut writer = BufWriter::new(file);
    let written = tokio::io::copy(&mut limited, &mut writer).await?;
    writer.flush().await?;

    Ok(written)
}

fn validate_extension(original_name: &str) -> ApiResult<()> {
    let extension = Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();

    if ALLOWED_EXTENSIONS
        .iter()
        .any(|allowed| extension.eq_ignore_ascii_case(allowed))
    {
        Ok(())
    } else {
        Err(ApiError::validation(format!(
            "Validation failed (expected type is /(mov|mp4)$/i), got {}",
            original_name
        )))
    }
}

/// `<stem>-<millis><.ext>` from a client-supplied name.
pub fn unique_file_name(original_name: &str, millis: i64) -> String {
    let safe = sanitize_file_name(original_name);
    let path = Path::new(&safe);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file");

    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}-{}.{}", stem, millis, ext),
        None => format!("{}-{}", stem, millis),
    }
}

async fn create_unique(dir: &Path, original_name: &str) -> io::Result<(PathBuf, File)> {
    let millis = Utc::now().timestamp_millis();

    for offset in 0..MAX_NAME_ATTEMPTS {
        let path = dir.join(unique_file_name(original_name, millis + offset));
        match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }

    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free name for {} in {}", original_name, dir.display()),
    ))
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove rejected upload {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_file_name() {
        assert_eq!(unique_file_name("holiday.mp4", 1700000000000), "holiday-1700000000000.mp4");
        assert_eq!(unique_file_name("../../etc/clip.MOV", 5), "clip-5.MOV");
        assert_eq!(unique_file_name("my clip.mp4", 5), "my_clip-5.mp4");
        assert_eq!(unique_file_name("noext", 5), "noext-5");
    }

    #[test]
    fn test_validate_extension() {
        assert!(validate_extension("a.mp4").is_ok());
        assert!(validate_extension("a.MOV").is_ok());
        assert!(matches!(validate_extension("a.avi"), Err(ApiError::Validation(_))));
        assert!(matches!(validate_extension("mp4"), Err(ApiError::Validation(_))));
    }

    #[tokio::test]
    async fn test_create_unique_skips_taken_names() {
        let dir = tempfile::TempDir::new().unwrap();
        let (first, _) = create_unique(dir.path(), "a.mp4").await.unwrap();
        let (second, _) = create_unique(dir.path(), "a.mp4").await.unwrap();
        assert_ne!(first, second);
        assert!(first.exists() && second.exists());
    }
}
