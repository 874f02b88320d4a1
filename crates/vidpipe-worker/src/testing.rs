//! Fakes for the transcoder and storage seams.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use vidpipe_media::segments::segment_file_name;
use vidpipe_media::{EncodingProfile, MediaError, MediaResult, Segment, SegmentSet, Transcoder};
use vidpipe_storage::{MultipartStore, StorageError, StorageResult, UploadSession};

/// Writes `bytes_per_segment` bytes per segment instead of running ffmpeg.
pub struct FakeTranscoder {
    segments: u32,
    bytes_per_segment: usize,
    fail_transcode_at: Option<u32>,
    panic_transcode_at: Option<u32>,
    pub splits: AtomicUsize,
}

impl FakeTranscoder {
    pub fn new(segments: u32, bytes_per_segment: usize) -> Self {
        Self {
            segments,
            bytes_per_segment,
            fail_transcode_at: None,
            panic_transcode_at: None,
            splits: AtomicUsize::new(0),
        }
    }

    pub fn failing_at(mut self, ordinal: u32) -> Self {
        self.fail_transcode_at = Some(ordinal);
        self
    }

    pub fn panicking_at(mut self, ordinal: u32) -> Self {
        self.panic_transcode_at = Some(ordinal);
        self
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn split(&self, _input: &Path, raw_dir: &Path, _segment_secs: u32) -> MediaResult<SegmentSet> {
        self.splits.fetch_add(1, Ordering::SeqCst);
        for ordinal in 0..self.segments {
            tokio::fs::write(raw_dir.join(segment_file_name(ordinal)), b"raw").await?;
        }
        SegmentSet::scan(raw_dir).await
    }

    async fn transcode(
        &self,
        segment: &Segment,
        output: &Path,
        _profile: &EncodingProfile,
    ) -> MediaResult<Segment> {
        if self.panic_transcode_at == Some(segment.ordinal) {
            panic!("transcoder crashed on segment {}", segment.ordinal);
        }
        if self.fail_transcode_at == Some(segment.ordinal) {
            return Err(MediaError::external_tool("transcode", Some(1), "Invalid data found"));
        }
        tokio::fs::write(output, vec![segment.ordinal as u8; self.bytes_per_segment]).await?;
        Ok(Segment::new(segment.ordinal, output))
    }

    async fn concat(&self, manifest: &Path, output: &Path) -> MediaResult<()> {
        let listing = tokio::fs::read_to_string(manifest).await?;
        let mut joined = Vec::new();
        for line in listing.lines() {
            let path = line
                .trim()
                .strip_prefix("file '")
                .and_then(|rest| rest.strip_suffix('\''))
                .ok_or_else(|| MediaError::external_tool("concat", Some(1), line.to_string()))?;
            joined.extend(tokio::fs::read(path).await?);
        }
        tokio::fs::write(output, joined).await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StoreState {
    initiated: usize,
    parts: Vec<i32>,
    completed: Vec<String>,
    aborted: usize,
    fail_part: Option<i32>,
}

/// In-memory [`MultipartStore`] that records every call.
#[derive(Debug, Default)]
pub struct RecordingStore {
    state: Mutex<StoreState>,
}

impl RecordingStore {
    pub fn fail_part(&self, part_number: i32) {
        self.state.lock().unwrap().fail_part = Some(part_number);
    }

    pub fn initiated(&self) -> usize {
        self.state.lock().unwrap().initiated
    }

    pub fn aborted(&self) -> usize {
        self.state.lock().unwrap().aborted
    }

    pub fn part_numbers(&self) -> Vec<i32> {
        self.state.lock().unwrap().parts.clone()
    }

    pub fn completed_keys(&self) -> Vec<String> {
        self.state.lock().unwrap().completed.clone()
    }

    /// Sessions neither completed nor aborted.
    pub fn open_sessions(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.initiated - state.completed.len() - state.aborted
    }
}

#[async_trait]
impl MultipartStore for RecordingStore {
    async fn initiate(&self, _bucket: &str, key: &str, _content_type: &str) -> StorageResult<String> {
        let mut state = self.state.lock().unwrap();
        state.initiated += 1;
        Ok(format!("upload-{}-{}", state.initiated, key))
    }

    async fn upload_part(
        &self,
        _session: &UploadSession,
        part_number: i32,
        _body: Vec<u8>,
    ) -> StorageResult<String> {
        let mut state = self.state.lock().unwrap();
        if state.fail_part == Some(part_number) {
            return Err(StorageError::upload_failed(format!("part {} rejected", part_number)));
        }
        state.parts.push(part_number);
        Ok(format!("etag-{}", part_number))
    }

    async fn complete(&self, session: &UploadSession) -> StorageResult<()> {
        self.state.lock().unwrap().completed.push(session.key.clone());
        Ok(())
    }

    async fn abort(&self, _session: &UploadSession) -> StorageResult<()> {
        self.state.lock().unwrap().aborted += 1;
        Ok(())
    }
}
