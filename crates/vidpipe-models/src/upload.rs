//! Descriptor of a file the boundary layer has already written to disk.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Locally persisted upload, as carried in the queue payload.
///
/// Field names follow the wire format `{path, originalName, size, destinationDir}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    /// Path of the stored file on the worker-visible filesystem
    pub path: String,
    /// File name supplied by the client
    pub original_name: String,
    /// Size in bytes
    pub size: u64,
    /// Directory the file was written into
    pub destination_dir: String,
}

impl UploadedFile {
    pub fn new(
        path: impl AsRef<Path>,
        original_name: impl Into<String>,
        size: u64,
    ) -> Self {
        let path = path.as_ref();
        let destination_dir = path
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();

        Self {
            path: path.to_string_lossy().to_string(),
            original_name: original_name.into(),
            size,
            destination_dir,
        }
    }

    /// Local input path.
    pub fn local_path(&self) -> PathBuf {
        let path = PathBuf::from(&self.path);
        if path.is_absolute() || self.destination_dir.is_empty() || path.starts_with(&self.destination_dir) {
            path
        } else {
            Path::new(&self.destination_dir).join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let file = UploadedFile::new("/data/uploads/clip.mp4", "clip.mp4", 42);
        let json = serde_json::to_value(&file).unwrap();

        assert_eq!(json["path"], "/data/uploads/clip.mp4");
        assert_eq!(json["originalName"], "clip.mp4");
        assert_eq!(json["size"], 42);
        assert_eq!(json["destinationDir"], "/data/uploads");
    }

    #[test]
    fn test_local_path_joins_relative_name() {
        let file = UploadedFile {
            path: "clip.mp4".to_string(),
            original_name: "clip.mp4".to_string(),
            size: 1,
            destination_dir: "./uploads".to_string(),
        };
        assert_eq!(file.local_path(), PathBuf::from("./uploads/clip.mp4"));
    }

    #[test]
    fn test_local_path_keeps_full_path() {
        let file = UploadedFile::new("uploads/clip.mp4", "clip.mp4", 1);
        assert_eq!(file.local_path(), PathBuf::from("uploads/clip.mp4"));
    }
}
