//! Per-job scratch directories with guaranteed cleanup.
//!
//! Every job execution gets its own directory tree:
//!
//! ```text
//! <base_dir>/<job_id>-<identifier>/
//!     raw/          split output
//!     processed/    transcoded segments
//!     concat.txt    concat manifest (multi-segment only)
//!     output.mp4    final artifact
//! ```
//!
//! The identifier suffix is fresh per attempt, so two deliveries of the same job never share
//! a tree. [`WorkspaceGuard`] removes the tree on `release()` or, failing that, on drop.

use std::fs;
use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{MediaError, MediaResult};
use crate::fs_utils::ensure_writable_dir;

pub const RAW_DIR: &str = "raw";
pub const PROCESSED_DIR: &str = "processed";
pub const MANIFEST_FILE: &str = "concat.txt";
pub const OUTPUT_FILE: &str = "output.mp4";

/// Directory layout owned by one job execution.
#[derive(Debug, Clone)]
pub struct ProcessingWorkspace {
    job_id: String,
    root_dir: PathBuf,
    raw_segments_dir: PathBuf,
    processed_segments_dir: PathBuf,
    manifest_path: PathBuf,
    final_output_path: PathBuf,
}

/// Outcome of a best-effort removal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Files and directories removed
    pub removed: usize,
    /// Entries that could not be removed
    pub failed: usize,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

impl ProcessingWorkspace {
    /// Allocate a fresh workspace under `base_dir`.
    pub async fn create(base_dir: impl AsRef<Path>, job_id: &str) -> MediaResult<WorkspaceGuard> {
        let base_dir = base_dir.as_ref();
        ensure_writable_dir(base_dir).await?;

        let root_dir = base_dir.join(format!("{}-{}", job_id, vidpipe_models::new_identifier()));
        let workspace = Self::at(job_id, root_dir);

        // Hold the guard before creating subdirectories so a partial tree is still removed
        let guard = WorkspaceGuard::new(workspace);

        for dir in [&guard.raw_segments_dir, &guard.processed_segments_dir] {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                MediaError::resource(format!("cannot create {}: {}", dir.display(), e))
            })?;
        }

        debug!(job_id = job_id, "Created workspace {}", guard.root_dir.display());
        Ok(guard)
    }

    fn at(job_id: &str, root_dir: PathBuf) -> Self {
        Self {
            job_id: job_id.to_string(),
            raw_segments_dir: root_dir.join(RAW_DIR),
            processed_segments_dir: root_dir.join(PROCESSED_DIR),
            manifest_path: root_dir.join(MANIFEST_FILE),
            final_output_path: root_dir.join(OUTPUT_FILE),
            root_dir,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn raw_segments_dir(&self) -> &Path {
        &self.raw_segments_dir
    }

    pub fn processed_segments_dir(&self) -> &Path {
        &self.processed_segments_dir
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    pub fn final_output_path(&self) -> &Path {
        &self.final_output_path
    }

    /// Recursively delete the workspace. Never fails; see the report.
    pub async fn destroy(&self) -> CleanupReport {
        let root = self.root_dir.clone();
        match tokio::task::spawn_blocking(move || remove_tree(&root)).await {
            Ok(report) => report,
            Err(e) => {
                warn!(job_id = %self.job_id, "Workspace cleanup task failed: {}", e);
                CleanupReport {
                    removed: 0,
                    failed: 1,
                }
            }
        }
    }

    fn destroy_blocking(&self) -> CleanupReport {
        remove_tree(&self.root_dir)
    }
}

/// Scoped ownership of a [`ProcessingWorkspace`].
#[derive(Debug)]
pub struct WorkspaceGuard {
    workspace: ProcessingWorkspace,
    released: bool,
}

impl WorkspaceGuard {
    fn new(workspace: ProcessingWorkspace) -> Self {
        Self {
            workspace,
            released: false,
        }
    }

    /// Destroy the workspace now. Calling it again is a no-op.
    pub async fn release(&mut self) -> CleanupReport {
        if self.released {
            return CleanupReport::default();
        }
        self.released = true;

        let report = self.workspace.destroy().await;
        log_report(&self.workspace, &report);
        report
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Deref for WorkspaceGuard {
    type Target = ProcessingWorkspace;

    fn deref(&self) -> &Self::Target {
        &self.workspace
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let report = self.workspace.destroy_blocking();
        log_report(&self.workspace, &report);
    }
}

fn log_report(workspace: &ProcessingWorkspace, report: &CleanupReport) {
    if report.is_clean() {
        debug!(
            job_id = %workspace.job_id,
            removed = report.removed,
            "Workspace removed"
        );
    } else {
        warn!(
            job_id = %workspace.job_id,
            removed = report.removed,
            failed = report.failed,
            "Workspace only partially removed: {}",
            workspace.root_dir.display()
        );
    }
}

/// Delete everything under `root`, attempting every entry.
fn remove_tree(root: &Path) -> CleanupReport {
    let mut report = CleanupReport::default();

    match fs::symlink_metadata(root) {
        Ok(meta) if !meta.is_dir() => {
            record(&mut report, root, fs::remove_file(root));
            return report;
        }
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return report,
        Err(e) => {
            warn!("Cannot inspect {}: {}", root.display(), e);
            report.failed += 1;
            return report;
        }
    }

    // Parents are discovered before their children, so reverse order is bottom-up
    let mut dirs = vec![root.to_path_buf()];
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot list {}: {}", dir.display(), e);
                report.failed += 1;
                continue;
            }
        };

        sweep_entries(&mut report, &dir, entries, &mut dirs, &mut pending);
    }

    for dir in dirs.iter().rev() {
        record(&mut report, dir, fs::remove_dir(dir));
    }

    report
}

/// Remove the files among `entries` and queue the subdirectories. Unreadable entries count as
/// failures.
fn sweep_entries<I>(
    report: &mut CleanupReport,
    dir: &Path,
    entries: I,
    dirs: &mut Vec<PathBuf>,
    pending: &mut Vec<PathBuf>,
) where
    I: IntoIterator<Item = io::Result<fs::DirEntry>>,
{
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Cannot read an entry of {}: {}", dir.display(), e);
                report.failed += 1;
                continue;
            }
        };

        let path = entry.path();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if is_dir {
            dirs.push(path.clone());
            pending.push(path);
        } else {
            record(report, &path, fs::remove_file(&path));
        }
    }
}

fn record(report: &mut CleanupReport, path: &Path, result: io::Result<()>) {
    match result {
        Ok(()) => report.removed += 1,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!("Failed to remove {}: {}", path.display(), e);
            report.failed += 1;
        }
    }
}

/// Delete a single file, logging instead of failing. Returns whether it was removed.
pub async fn remove_file_best_effort(path: impl AsRef<Path>) -> bool {
    let path = path.as_ref();
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!("Failed to remove {}: {}", path.display(), e);
            false
        }
    }
}
