//! Filesystem helpers shared by the workspace and pipeline.

use std::path::Path;
use tokio::fs;

use crate::error::{MediaError, MediaResult};

/// Move a file from `src` to `dst`, falling back to copy+delete across devices.
pub async fn move_file(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> MediaResult<()> {
    let src = src.as_ref();
    let dst = dst.as_ref();

    if let Some(parent) = dst.parent() {
        if !parent.as_os_str().is_empty() && !fs::try_exists(parent).await.unwrap_or(false) {
            fs::create_dir_all(parent).await?;
        }
    }

    match fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device_error(&e) => {
            tracing::debug!(
                "Cross-device rename, copying instead: {} -> {}",
                src.display(),
                dst.display()
            );
            copy_and_delete(src, dst).await
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(MediaError::FileNotFound(src.to_path_buf()))
        }
        Err(e) => Err(MediaError::from(e)),
    }
}

/// EXDEV (cross-device link) on Linux/macOS.
fn is_cross_device_error(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(18)
}

async fn copy_and_delete(src: &Path, dst: &Path) -> MediaResult<()> {
    // Stage next to dst so the final rename stays on one filesystem
    let tmp_dst = dst.with_extension("partial");

    if let Err(e) = fs::copy(src, &tmp_dst).await {
        let _ = fs::remove_file(&tmp_dst).await;
        return Err(e.into());
    }

    if let Err(e) = fs::rename(&tmp_dst, dst).await {
        let _ = fs::remove_file(&tmp_dst).await;
        return Err(e.into());
    }

    if let Err(e) = fs::remove_file(src).await {
        tracing::warn!(
            "Failed to remove source after cross-device move: {}: {}",
            src.display(),
            e
        );
    }

    Ok(())
}

/// Create `dir` if needed and prove it accepts writes.
pub async fn ensure_writable_dir(dir: impl AsRef<Path>) -> MediaResult<()> {
    let dir = dir.as_ref();

    fs::create_dir_all(dir).await.map_err(|e| {
        MediaError::resource(format!("cannot create {}: {}", dir.display(), e))
    })?;

    let probe = dir.join(format!(".write-probe-{}", vidpipe_models::new_identifier()));
    fs::write(&probe, b"ok").await.map_err(|e| {
        MediaError::resource(format!("{} is not writable: {}", dir.display(), e))
    })?;
    let _ = fs::remove_file(&probe).await;

    Ok(())
}
