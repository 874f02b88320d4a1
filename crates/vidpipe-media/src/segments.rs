//! Ordered segment collections.
//!
//! Segment order always comes from the ordinal embedded in the file name; directory
//! listing order is never trusted.

use std::path::{Path, PathBuf};

use crate::error::MediaResult;

/// Output pattern handed to the segment muxer.
pub const SEGMENT_PATTERN: &str = "chunk-%03d.mp4";

const SEGMENT_PREFIX: &str = "chunk-";
const SEGMENT_SUFFIX: &str = ".mp4";

/// File name for the segment with `ordinal`, matching [`SEGMENT_PATTERN`].
pub fn segment_file_name(ordinal: u32) -> String {
    format!("{}{:03}{}", SEGMENT_PREFIX, ordinal, SEGMENT_SUFFIX)
}

/// Parse the ordinal out of a `chunk-NNN.mp4` name.
pub fn parse_segment_ordinal(file_name: &str) -> Option<u32> {
    let digits = file_name
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?;

    if digits.len() < 3 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    digits.parse().ok()
}

/// One segment file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub ordinal: u32,
    pub path: PathBuf,
}

impl Segment {
    pub fn new(ordinal: u32, path: impl Into<PathBuf>) -> Self {
        Self {
            ordinal,
            path: path.into(),
        }
    }

    pub fn file_name(&self) -> String {
        segment_file_name(self.ordinal)
    }
}

/// Segments sorted by ordinal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentSet {
    segments: Vec<Segment>,
}

impl SegmentSet {
    /// Build from segments in any order.
    pub fn from_segments(mut segments: Vec<Segment>) -> Self {
        segments.sort_by_key(|s| s.ordinal);
        Self { segments }
    }

    /// Collect every `chunk-NNN.mp4` file in `dir`. Other entries are ignored.
    pub async fn scan(dir: impl AsRef<Path>) -> MediaResult<Self> {
        let mut entries = tokio::fs::read_dir(dir.as_ref()).await?;
        let mut segments = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name();
            if let Some(ordinal) = name.to_str().and_then(parse_segment_ordinal) {
                segments.push(Segment::new(ordinal, entry.path()));
            }
        }

        Ok(Self::from_segments(segments))
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Segment> {
        self.segments.iter()
    }

    pub fn ordinals(&self) -> Vec<u32> {
        self.segments.iter().map(|s| s.ordinal).collect()
    }

    /// The only segment, if there is exactly one.
    pub fn single(&self) -> Option<&Segment> {
        match self.segments.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }
}

impl IntoIterator for SegmentSet {
    type Item = Segment;
    type IntoIter = std::vec::IntoIter<Segment>;

    fn into_iter(self) -> Self::IntoIter {
        self.segments.into_iter()
    }
}

impl<'a> IntoIterator for &'a SegmentSet {
    type Item = &'a Segment;
    type IntoIter = std::slice::Iter<'a, Segment>;

    fn into_iter(self) -> Self::IntoIter {
        self.segments.iter()
    }
}
