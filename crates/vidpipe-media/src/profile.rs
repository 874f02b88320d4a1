//! Pipeline and encoding configuration.

use crate::command::FfmpegCommand;

/// Target encoding for every processed segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingProfile {
    /// Output height; width follows the aspect ratio
    pub target_height: u32,
    pub video_codec: String,
    pub preset: String,
    pub crf: u8,
    pub h264_profile: String,
    pub h264_level: String,
    pub maxrate: String,
    pub bufsize: String,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub faststart: bool,
}

impl Default for EncodingProfile {
    fn default() -> Self {
        Self {
            target_height: 720,
            video_codec: "libx264".to_string(),
            preset: "veryfast".to_string(),
            crf: 28,
            h264_profile: "baseline".to_string(),
            h264_level: "3.1".to_string(),
            maxrate: "1M".to_string(),
            bufsize: "2M".to_string(),
            audio_codec: "aac".to_string(),
            audio_bitrate: "128k".to_string(),
            faststart: true,
        }
    }
}

impl EncodingProfile {
    /// Create profile from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            target_height: std::env::var("PIPELINE_TARGET_HEIGHT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.target_height),
            crf: std::env::var("PIPELINE_CRF")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.crf),
            preset: std::env::var("PIPELINE_PRESET").unwrap_or(defaults.preset),
            maxrate: std::env::var("PIPELINE_MAXRATE").unwrap_or(defaults.maxrate),
            bufsize: std::env::var("PIPELINE_BUFSIZE").unwrap_or(defaults.bufsize),
            audio_bitrate: std::env::var("PIPELINE_AUDIO_BITRATE").unwrap_or(defaults.audio_bitrate),
            ..defaults
        }
    }

    /// Append the encoding arguments to `cmd`.
    pub fn apply(&self, cmd: FfmpegCommand) -> FfmpegCommand {
        let cmd = cmd
            .video_filter(format!("scale=-2:{}", self.target_height))
            .video_codec(&self.video_codec)
            .preset(&self.preset)
            .crf(self.crf)
            .h264_profile(&self.h264_profile, &self.h264_level)
            .rate_limit(&self.maxrate, &self.bufsize)
            .audio_codec(&self.audio_codec)
            .audio_bitrate(&self.audio_bitrate);

        if self.faststart {
            cmd.faststart()
        } else {
            cmd
        }
    }
}

/// Settings for the split / transcode / concat pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Segment length for the split stage
    pub segment_secs: u32,
    pub encoding: EncodingProfile,
    /// Segments transcoded at once; 1 means strictly sequential
    pub max_parallel_segments: usize,
    /// Per-invocation FFmpeg timeout
    pub ffmpeg_timeout_secs: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            segment_secs: 240,
            encoding: EncodingProfile::default(),
            max_parallel_segments: 1,
            ffmpeg_timeout_secs: None,
        }
    }
}

impl PipelineConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            segment_secs: std::env::var("PIPELINE_SEGMENT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(240),
            encoding: EncodingProfile::from_env(),
            max_parallel_segments: std::env::var("PIPELINE_PARALLEL_SEGMENTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1)
                .max(1),
            ffmpeg_timeout_secs: std::env::var("FFMPEG_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok()),
        }
    }

    /// Number of segments a `duration_secs` input splits into.
    pub fn expected_segments(&self, duration_secs: f64) -> usize {
        if duration_secs <= 0.0 {
            return 0;
        }
        (duration_secs / self.segment_secs as f64).ceil() as usize
    }
}
