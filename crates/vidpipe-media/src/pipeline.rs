//! Split, transcode and reassemble one input inside a workspace.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{info, warn};

use crate::error::{MediaError, MediaResult};
use crate::fs_utils::move_file;
use crate::profile::PipelineConfig;
use crate::segments::{Segment, SegmentSet};
use crate::transcoder::Transcoder;
use crate::workspace::{remove_file_best_effort, ProcessingWorkspace};

/// Where a pipeline run currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineStage {
    Splitting,
    /// `index` is 1-based
    Transcoding { index: usize, total: usize },
    Concatenating,
    Done,
    Failed { reason: String },
}

impl PipelineStage {
    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            PipelineStage::Splitting => "split",
            PipelineStage::Transcoding { .. } => "transcode",
            PipelineStage::Concatenating => "concat",
            PipelineStage::Done => "done",
            PipelineStage::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStage::Done | PipelineStage::Failed { .. })
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStage::Transcoding { index, total } => {
                write!(f, "transcode {}/{}", index, total)
            }
            PipelineStage::Failed { reason } => write!(f, "failed: {}", reason),
            other => f.write_str(other.label()),
        }
    }
}

/// Callback invoked on every stage transition.
pub type StageObserver<'a> = dyn Fn(&PipelineStage) + Send + Sync + 'a;

/// Result of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutput {
    pub output_path: PathBuf,
    pub segment_count: usize,
}

/// Segment-based transcoding pipeline.
#[derive(Clone)]
pub struct TranscodePipeline {
    transcoder: Arc<dyn Transcoder>,
    config: PipelineConfig,
}

impl TranscodePipeline {
    pub fn new(transcoder: Arc<dyn Transcoder>, config: PipelineConfig) -> Self {
        Self { transcoder, config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run without observing stage transitions.
    pub async fn run(&self, input: &Path, workspace: &ProcessingWorkspace) -> MediaResult<PipelineOutput> {
        self.run_observed(input, workspace, &|_: &PipelineStage| {}).await
    }

    /// Produce `workspace.final_output_path()` from `input`.
    pub async fn run_observed(
        &self,
        input: &Path,
        workspace: &ProcessingWorkspace,
        observer: &StageObserver<'_>,
    ) -> MediaResult<PipelineOutput> {
        let result = self.execute(input, workspace, observer).await;

        let terminal = match &result {
            Ok(_) => PipelineStage::Done,
            Err(e) => PipelineStage::Failed {
                reason: e.to_string(),
            },
        };
        enter(workspace, observer, terminal);

        result
    }

    async fn execute(
        &self,
        input: &Path,
        workspace: &ProcessingWorkspace,
        observer: &StageObserver<'_>,
    ) -> MediaResult<PipelineOutput> {
        self.log_probe(input, workspace).await;

        enter(workspace, observer, PipelineStage::Splitting);
        let raw = self
            .transcoder
            .split(input, workspace.raw_segments_dir(), self.config.segment_secs)
            .await?;
        if raw.is_empty() {
            return Err(MediaError::NoSegments(workspace.raw_segments_dir().to_path_buf()));
        }

        let processed = self.transcode_all(&raw, workspace, observer).await?;

        enter(workspace, observer, PipelineStage::Concatenating);
        self.concatenate(&processed, workspace).await?;

        Ok(PipelineOutput {
            output_path: workspace.final_output_path().to_path_buf(),
            segment_count: processed.len(),
        })
    }

    async fn log_probe(&self, input: &Path, workspace: &ProcessingWorkspace) {
        match self.transcoder.probe(input).await {
            Ok(Some(info)) => info!(
                job_id = %workspace.job_id(),
                duration_secs = info.duration,
                height = info.height,
                expected_segments = self.config.expected_segments(info.duration),
                "Probed input"
            ),
            Ok(None) => {}
            Err(e) => warn!(job_id = %workspace.job_id(), "Could not probe input, continuing: {}", e),
        }
    }

    async fn transcode_all(
        &self,
        raw: &SegmentSet,
        workspace: &ProcessingWorkspace,
        observer: &StageObserver<'_>,
    ) -> MediaResult<SegmentSet> {
        let total = raw.len();
        let profile = &self.config.encoding;
        let processed_dir = workspace.processed_segments_dir();

        if self.config.max_parallel_segments <= 1 {
            let mut processed = Vec::with_capacity(total);
            for (i, segment) in raw.iter().enumerate() {
                enter(workspace, observer, PipelineStage::Transcoding { index: i + 1, total });
                let output = processed_dir.join(segment.file_name());
                processed.push(self.transcoder.transcode(segment, &output, profile).await?);
            }
            return Ok(SegmentSet::from_segments(processed));
        }

        // Completion order is arbitrary; from_segments restores ordinal order
        let tasks: Vec<_> = raw
            .iter()
            .enumerate()
            .map(|(i, segment)| async move {
                enter(workspace, observer, PipelineStage::Transcoding { index: i + 1, total });
                let output = processed_dir.join(segment.file_name());
                self.transcoder.transcode(segment, &output, profile).await
            })
            .collect();
        let processed: Vec<Segment> = stream::iter(tasks)
            .buffer_unordered(self.config.max_parallel_segments)
            .try_collect()
            .await?;

        Ok(SegmentSet::from_segments(processed))
    }

    async fn concatenate(&self, processed: &SegmentSet, workspace: &ProcessingWorkspace) -> MediaResult<()> {
        let output = workspace.final_output_path();

        if let Some(only) = processed.single() {
            return move_file(&only.path, output).await;
        }

        let manifest = workspace.manifest_path();
        let result: MediaResult<()> = async {
            tokio::fs::write(manifest, build_manifest(processed).await?).await?;
            self.transcoder.concat(manifest, output).await
        }
        .await;

        remove_file_best_effort(manifest).await;
        result
    }
}

fn enter(workspace: &ProcessingWorkspace, observer: &StageObserver<'_>, stage: PipelineStage) {
    info!(job_id = %workspace.job_id(), stage = %stage, "Pipeline stage");
    observer(&stage);
}

/// Concat demuxer manifest, one `file '<abs path>'` line per segment in ordinal order.
async fn build_manifest(segments: &SegmentSet) -> MediaResult<String> {
    let mut manifest = String::new();
    for segment in segments {
        let path = tokio::fs::canonicalize(&segment.path).await?;
        manifest.push_str(&manifest_line(&path));
        manifest.push('\n');
    }
    Ok(manifest)
}

fn manifest_line(path: &Path) -> String {
    // Inside single quotes a quote is written as '\''
    let escaped = path.to_string_lossy().replace('\'', r"'\''");
    format!("file '{}'", escaped)
}
