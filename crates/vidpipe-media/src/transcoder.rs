//! The transcoder capability and its FFmpeg-backed implementation.

use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};
use crate::probe::{probe_video, VideoInfo};
use crate::profile::EncodingProfile;
use crate::segments::{Segment, SegmentSet, SEGMENT_PATTERN};

/// Operations the pipeline needs from an external transcoder.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Cut `input` into `segment_secs` pieces under `raw_dir` without re-encoding.
    async fn split(&self, input: &Path, raw_dir: &Path, segment_secs: u32) -> MediaResult<SegmentSet>;

    /// Re-encode one segment to `output`.
    async fn transcode(
        &self,
        segment: &Segment,
        output: &Path,
        profile: &EncodingProfile,
    ) -> MediaResult<Segment>;

    /// Join the files listed in a concat manifest into `output`.
    async fn concat(&self, manifest: &Path, output: &Path) -> MediaResult<()>;

    /// Inspect the input. Used for logging only.
    async fn probe(&self, _input: &Path) -> MediaResult<Option<VideoInfo>> {
        Ok(None)
    }
}

/// [`Transcoder`] backed by the `ffmpeg` and `ffprobe` binaries.
#[derive(Debug, Clone, Default)]
pub struct FfmpegTranscoder {
    runner: FfmpegRunner,
}

impl FfmpegTranscoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout_secs: Option<u64>) -> Self {
        let runner = match timeout_secs {
            Some(secs) => FfmpegRunner::new().with_timeout(secs),
            None => FfmpegRunner::new(),
        };
        Self { runner }
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn split(&self, input: &Path, raw_dir: &Path, segment_secs: u32) -> MediaResult<SegmentSet> {
        let cmd = FfmpegCommand::new(input, raw_dir.join(SEGMENT_PATTERN))
            .stream_copy()
            .segment(segment_secs);

        self.runner.run("split", &cmd).await?;

        let segments = SegmentSet::scan(raw_dir).await?;
        if segments.is_empty() {
            return Err(MediaError::NoSegments(raw_dir.to_path_buf()));
        }

        debug!("Split {} into {} segments", input.display(), segments.len());
        Ok(segments)
    }

    async fn transcode(
        &self,
        segment: &Segment,
        output: &Path,
        profile: &EncodingProfile,
    ) -> MediaResult<Segment> {
        let cmd = profile.apply(FfmpegCommand::new(&segment.path, output));
        let ordinal = segment.ordinal;

        self.runner
            .run_with_progress("transcode", &cmd, move |progress| {
                if progress.is_complete {
                    trace!(ordinal, speed = progress.speed, "Segment encoded");
                }
            })
            .await?;

        Ok(Segment::new(segment.ordinal, output))
    }

    async fn concat(&self, manifest: &Path, output: &Path) -> MediaResult<()> {
        let cmd = FfmpegCommand::new(manifest, output)
            .concat_manifest()
            .stream_copy();

        self.runner.run("concat", &cmd).await
    }

    async fn probe(&self, input: &Path) -> MediaResult<Option<VideoInfo>> {
        probe_video(input).await.map(Some)
    }
}
