//! FFmpeg command builder and runner.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::{MediaError, MediaResult};

/// Upper bound on the stderr tail attached to tool errors.
pub const DIAGNOSTIC_TAIL_BYTES: usize = 4096;

/// Keys emitted by `-progress pipe:2`; these lines are not diagnostics.
const PROGRESS_KEYS: &[&str] = &[
    "frame",
    "fps",
    "bitrate",
    "total_size",
    "out_time_us",
    "out_time_ms",
    "out_time",
    "dup_frames",
    "drop_frames",
    "speed",
    "progress",
];

/// Builder for FFmpeg commands.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    input: PathBuf,
    output: PathBuf,
    /// Arguments placed before -i
    input_args: Vec<String>,
    /// Arguments placed after -i
    output_args: Vec<String>,
    overwrite: bool,
    log_level: String,
}

impl FfmpegCommand {
    /// Create a new FFmpeg command.
    pub fn new(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Self {
        Self {
            input: input.as_ref().to_path_buf(),
            output: output.as_ref().to_path_buf(),
            input_args: Vec::new(),
            output_args: Vec::new(),
            overwrite: true,
            log_level: "error".to_string(),
        }
    }

    /// Add input arguments (before -i).
    pub fn input_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add an output argument (after -i).
    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    /// Add multiple output arguments.
    pub fn output_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Copy every stream without re-encoding.
    pub fn stream_copy(self) -> Self {
        self.output_args(["-c", "copy"])
    }

    /// Cut into fixed-length mp4 segments. The output path must be a `%03d` pattern.
    pub fn segment(self, segment_secs: u32) -> Self {
        self.output_args(["-map", "0", "-f", "segment", "-segment_time"])
            .output_arg(segment_secs.to_string())
            .output_args(["-reset_timestamps", "1", "-segment_format", "mp4"])
    }

    /// Read the input as a concat demuxer manifest.
    pub fn concat_manifest(self) -> Self {
        self.input_args(["-f", "concat", "-safe", "0"])
    }

    /// Set video filter.
    pub fn video_filter(self, filter: impl Into<String>) -> Self {
        self.output_arg("-vf").output_arg(filter)
    }

    /// Set video codec.
    pub fn video_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:v").output_arg(codec)
    }

    /// Set audio codec.
    pub fn audio_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:a").output_arg(codec)
    }

    /// Set CRF (quality).
    pub fn crf(self, crf: u8) -> Self {
        self.output_arg("-crf").output_arg(crf.to_string())
    }

    /// Set preset.
    pub fn preset(self, preset: impl Into<String>) -> Self {
        self.output_arg("-preset").output_arg(preset)
    }

    /// Set H.264 profile and level.
    pub fn h264_profile(self, profile: impl Into<String>, level: impl Into<String>) -> Self {
        self.output_arg("-profile:v")
            .output_arg(profile)
            .output_arg("-level")
            .output_arg(level)
    }

    /// Cap the video bitrate.
    pub fn rate_limit(self, maxrate: impl Into<String>, bufsize: impl Into<String>) -> Self {
        self.output_arg("-maxrate")
            .output_arg(maxrate)
            .output_arg("-bufsize")
            .output_arg(bufsize)
    }

    /// Set audio bitrate.
    pub fn audio_bitrate(self, bitrate: impl Into<String>) -> Self {
        self.output_arg("-b:a").output_arg(bitrate)
    }

    /// Move the moov atom to the front for progressive playback.
    pub fn faststart(self) -> Self {
        self.output_args(["-movflags", "+faststart"])
    }

    /// Set log level.
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Build the command arguments.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if self.overwrite {
            args.push("-y".to_string());
        }

        args.push("-v".to_string());
        args.push(self.log_level.clone());

        args.push("-progress".to_string());
        args.push("pipe:2".to_string());

        args.extend(self.input_args.clone());

        args.push("-i".to_string());
        args.push(self.input.to_string_lossy().to_string());

        args.extend(self.output_args.clone());

        args.push(self.output.to_string_lossy().to_string());

        args
    }
}

/// Progress snapshot parsed from `-progress pipe:2`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FfmpegProgress {
    /// Output time in milliseconds
    pub out_time_ms: i64,
    /// Encoding speed (1.5 = 1.5x realtime)
    pub speed: f64,
    pub is_complete: bool,
}

/// Bounded tail of stderr lines.
#[derive(Debug, Default)]
pub struct DiagnosticTail {
    lines: VecDeque<String>,
    bytes: usize,
    max_bytes: usize,
    truncated: bool,
}

impl DiagnosticTail {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            ..Default::default()
        }
    }

    pub fn push(&mut self, line: &str) {
        let line = line.trim_end();
        if line.is_empty() {
            return;
        }

        self.bytes += line.len() + 1;
        self.lines.push_back(line.to_string());

        while self.bytes > self.max_bytes && self.lines.len() > 1 {
            if let Some(dropped) = self.lines.pop_front() {
                self.bytes -= dropped.len() + 1;
                self.truncated = true;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Render the retained lines, oldest first.
    pub fn render(&self) -> String {
        let body = self.lines.iter().cloned().collect::<Vec<_>>().join("\n");
        let body = if body.len() > self.max_bytes {
            let mut start = body.len() - self.max_bytes;
            while !body.is_char_boundary(start) {
                start += 1;
            }
            body[start..].to_string()
        } else {
            body
        };

        if self.truncated {
            format!("...\n{}", body)
        } else {
            body
        }
    }
}

/// Runner for FFmpeg commands with stderr capture and timeout.
#[derive(Debug, Clone, Default)]
pub struct FfmpegRunner {
    timeout_secs: Option<u64>,
}

impl FfmpegRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill the process if it runs longer than `secs`.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Run an FFmpeg command; `stage` labels errors and metrics.
    pub async fn run(&self, stage: &str, cmd: &FfmpegCommand) -> MediaResult<()> {
        self.run_with_progress(stage, cmd, |_| {}).await
    }

    /// Run an FFmpeg command with progress callback.
    pub async fn run_with_progress<F>(
        &self,
        stage: &str,
        cmd: &FfmpegCommand,
        progress_callback: F,
    ) -> MediaResult<()>
    where
        F: Fn(FfmpegProgress) + Send + 'static,
    {
        check_ffmpeg()?;

        let args = cmd.build_args();
        debug!(stage = stage, "Running FFmpeg: ffmpeg {}", args.join(" "));

        let started = Instant::now();
        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| MediaError::internal("ffmpeg stderr was not captured"))?;
        let stderr_handle = tokio::spawn(collect_stderr(stderr, progress_callback));

        let result = self.wait_for_completion(&mut child).await;
        let tail = stderr_handle.await.unwrap_or_default();

        metrics::histogram!("vidpipe_ffmpeg_duration_seconds", "stage" => stage.to_string())
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(status) if status.success() => {
                if !tail.is_empty() {
                    debug!(stage = stage, "FFmpeg stderr on success: {}", tail.render());
                }
                Ok(())
            }
            Ok(status) => {
                metrics::counter!("vidpipe_ffmpeg_failures_total", "stage" => stage.to_string())
                    .increment(1);
                Err(MediaError::external_tool(stage, status.code(), tail.render()))
            }
            Err(e) => Err(e),
        }
    }

    async fn wait_for_completion(&self, child: &mut Child) -> MediaResult<std::process::ExitStatus> {
        let Some(timeout_secs) = self.timeout_secs else {
            return Ok(child.wait().await?);
        };

        match tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait()).await {
            Ok(status) => Ok(status?),
            Err(_) => {
                warn!("FFmpeg timed out after {} seconds, killing process", timeout_secs);
                let _ = child.kill().await;
                Err(MediaError::Timeout(timeout_secs))
            }
        }
    }
}

enum LineKind {
    /// A progress key; carries a snapshot at the end of each block
    Progress(Option<FfmpegProgress>),
    Diagnostic,
}

/// Read ffmpeg's stderr to the end, feeding progress blocks to `progress_callback` and keeping
/// the diagnostic lines. Lines that are not valid UTF-8 are decoded lossily.
async fn collect_stderr<R, F>(stderr: R, progress_callback: F) -> DiagnosticTail
where
    R: AsyncRead + Unpin,
    F: Fn(FfmpegProgress),
{
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    let mut current = FfmpegProgress::default();
    let mut tail = DiagnosticTail::new(DIAGNOSTIC_TAIL_BYTES);

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Stopped reading ffmpeg stderr: {}", e);
                break;
            }
        }

        let line = String::from_utf8_lossy(&buf);
        match parse_progress_line(&line, &mut current) {
            LineKind::Progress(Some(snapshot)) => progress_callback(snapshot),
            LineKind::Progress(None) => {}
            LineKind::Diagnostic => tail.push(&line),
        }
    }

    tail
}

fn parse_progress_line(line: &str, current: &mut FfmpegProgress) -> LineKind {
    let Some((key, value)) = line.trim().split_once('=') else {
        return LineKind::Diagnostic;
    };

    if !PROGRESS_KEYS.contains(&key) && !key.starts_with("stream_") {
        return LineKind::Diagnostic;
    }

    match key {
        "out_time_us" => {
            if let Ok(us) = value.parse::<i64>() {
                current.out_time_ms = us / 1000;
            }
        }
        "speed" => {
            if let Some(speed) = value.strip_suffix('x').and_then(|s| s.trim().parse().ok()) {
                current.speed = speed;
            }
        }
        "progress" => {
            current.is_complete = value == "end";
            return LineKind::Progress(Some(current.clone()));
        }
        _ => {}
    }

    LineKind::Progress(None)
}

/// Check if FFmpeg is available.
pub fn check_ffmpeg() -> MediaResult<PathBuf> {
    which::which("ffmpeg").map_err(|_| MediaError::FfmpegNotFound)
}

/// Check if FFprobe is available.
pub fn check_ffprobe() -> MediaResult<PathBuf> {
    which::which("ffprobe").map_err(|_| MediaError::FfprobeNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_args() {
        let args = FfmpegCommand::new("in.mp4", "raw/chunk-%03d.mp4")
            .stream_copy()
            .segment(240)
            .build_args();

        let joined = args.join(" ");
        assert!(joined.contains(
            "-i in.mp4 -c copy -map 0 -f segment -segment_time 240 -reset_timestamps 1 -segment_format mp4 raw/chunk-%03d.mp4"
        ));
        assert_eq!(args.first().map(String::as_str), Some("-y"));
    }

    #[test]
    fn test_concat_args_precede_input() {
        let args = FfmpegCommand::new("concat.txt", "output.mp4")
            .concat_manifest()
            .stream_copy()
            .build_args();

        let input_pos = args.iter().position(|a| a == "-i").unwrap();
        let concat_pos = args.iter().position(|a| a == "concat").unwrap();
        assert!(concat_pos < input_pos);
        assert!(args.join(" ").ends_with("-i concat.txt -c copy output.mp4"));
    }

    #[test]
    fn test_progress_lines_are_not_diagnostics() {
        let mut progress = FfmpegProgress::default();

        assert!(matches!(
            parse_progress_line("out_time_us=5000000", &mut progress),
            LineKind::Progress(None)
        ));
        assert_eq!(progress.out_time_ms, 5000);

        parse_progress_line("speed=1.5x", &mut progress);
        assert!((progress.speed - 1.5).abs() < 0.01);

        match parse_progress_line("progress=end", &mut progress) {
            LineKind::Progress(Some(snapshot)) => assert!(snapshot.is_complete),
            _ => panic!("expected a progress snapshot"),
        }

        assert!(matches!(
            parse_progress_line("stream_0_0_q=28.0", &mut progress),
            LineKind::Progress(None)
        ));
        assert!(matches!(
            parse_progress_line("[mov,mp4] moov atom not found", &mut progress),
            LineKind::Diagnostic
        ));
        assert!(matches!(
            parse_progress_line("Option key=value not found", &mut progress),
            LineKind::Diagnostic
        ));
    }

    #[test]
    fn test_diagnostic_tail_keeps_latest_lines() {
        let mut tail = DiagnosticTail::new(32);
        for i in 0..20 {
            tail.push(&format!("line {}", i));
        }

        let rendered = tail.render();
        assert!(rendered.starts_with("...\n"));
        assert!(rendered.ends_with("line 19"));
        assert!(!rendered.contains("line 0\n"));
        assert!(rendered.len() <= 32 + 4);
    }

    #[test]
    fn test_diagnostic_tail_single_long_line() {
        let mut tail = DiagnosticTail::new(8);
        tail.push("abcdefghijklmnop");
        assert_eq!(tail.render(), "ijklmnop");
    }

    #[tokio::test]
    async fn test_collect_stderr_survives_invalid_utf8() {
        let stderr: &[u8] = b"[mp4 @ 0x1] tag \xff\xfe unknown\n\
out_time_us=2000000\n\
progress=continue\n\
Error while decoding stream #0:0\n\
progress=end\n";
        let snapshots = std::sync::Mutex::new(Vec::new());

        let tail = collect_stderr(stderr, |p| snapshots.lock().unwrap().push(p)).await;

        let snapshots = snapshots.into_inner().unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].out_time_ms, 2000);
        assert!(snapshots[1].is_complete);

        let rendered = tail.render();
        assert!(rendered.contains("tag \u{fffd}\u{fffd} unknown"));
        assert!(rendered.contains("Error while decoding stream #0:0"));
    }
}
