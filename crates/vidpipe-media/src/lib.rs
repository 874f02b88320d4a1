//! Segment-based FFmpeg transcoding for vidpipe.
//!
//! This crate provides:
//! - Type-safe FFmpeg command building with captured diagnostics
//! - Per-job scratch workspaces that clean up after themselves
//! - The split / transcode / concat pipeline behind a `Transcoder` seam

pub mod command;
pub mod error;
pub mod fs_utils;
pub mod pipeline;
pub mod probe;
pub mod profile;
pub mod segments;
pub mod transcoder;
pub mod workspace;

pub use command::{check_ffmpeg, check_ffprobe, FfmpegCommand, FfmpegRunner};
pub use error::{MediaError, MediaResult};
pub use fs_utils::{ensure_writable_dir, move_file};
pub use pipeline::{PipelineOutput, PipelineStage, StageObserver, TranscodePipeline};
pub use probe::{probe_video, VideoInfo};
pub use profile::{EncodingProfile, PipelineConfig};
pub use segments::{Segment, SegmentSet};
pub use transcoder::{FfmpegTranscoder, Transcoder};
pub use workspace::{remove_file_best_effort, CleanupReport, ProcessingWorkspace, WorkspaceGuard};
