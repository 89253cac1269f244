//! Audiobook transcripts
//!
//! A transcript is a JSON array of `{start, end, text}` segments with times in
//! seconds from the start of the whole book. It is the bridge between an ABS
//! timestamp and a position in the ebook.

pub mod transcriber;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::fuzzy;

pub use transcriber::{AudioFile, Transcriber};

/// Characters gathered around a timestamp for text matching
const TEXT_WINDOW_CHARS: usize = 400;

/// Minimum fuzzy score for a segment to count as found
const MATCH_THRESHOLD: f64 = 80.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TranscriptError {
    #[error("Failed to read transcript {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid transcript {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Transcription failed: {0}")]
    Transcribe(String),

    #[error("No transcription command configured")]
    NotConfigured,
}

/// Both layouts seen on disk: a bare segment list, or an object that carries
/// the duration explicitly
#[derive(Deserialize)]
#[serde(untagged)]
enum TranscriptFile {
    Segments(Vec<Segment>),
    Object {
        #[serde(default)]
        duration: f64,
        #[serde(default)]
        segments: Vec<Segment>,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    pub segments: Vec<Segment>,
    duration: f64,
}

impl Transcript {
    pub fn from_segments(segments: Vec<Segment>) -> Self {
        let duration = segments.last().map(|s| s.end).unwrap_or(0.0);
        Self { segments, duration }
    }

    pub fn load(path: &Path) -> Result<Self, TranscriptError> {
        let content = std::fs::read_to_string(path).map_err(|source| TranscriptError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let file: TranscriptFile =
            serde_json::from_str(&content).map_err(|source| TranscriptError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(match file {
            TranscriptFile::Segments(segments) => Self::from_segments(segments),
            TranscriptFile::Object { duration, segments } => Self { segments, duration },
        })
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// ABS seconds as a 0..1 fraction of the book, `None` without a duration
    pub fn to_percentage(&self, seconds: f64) -> Option<f64> {
        if self.duration > 0.0 {
            Some((seconds / self.duration).clamp(0.0, 1.0))
        } else {
            None
        }
    }

    fn segment_index_at(&self, timestamp: f64) -> Option<usize> {
        if let Some(i) = self
            .segments
            .iter()
            .position(|s| s.start <= timestamp && timestamp <= s.end)
        {
            return Some(i);
        }

        self.segments
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let dist = (timestamp - s.start).abs().min((timestamp - s.end).abs());
                (i, dist)
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)
    }

    /// Text spoken around `timestamp`: the segment at (or nearest to) that time,
    /// widened left then right until it holds enough characters
    pub fn text_at_time(&self, timestamp: f64) -> Option<String> {
        let target = self.segment_index_at(timestamp)?;

        let mut first = target;
        let mut last = target;
        let mut len = self.segments[target].text.len();

        while len < TEXT_WINDOW_CHARS {
            let mut added = false;
            if first > 0 {
                first -= 1;
                len += self.segments[first].text.len();
                added = true;
            }
            if len >= TEXT_WINDOW_CHARS {
                break;
            }
            if last + 1 < self.segments.len() {
                last += 1;
                len += self.segments[last].text.len();
                added = true;
            }
            if !added {
                break;
            }
        }

        Some(
            self.segments[first..=last]
                .iter()
                .map(|s| s.text.as_str())
                .collect::<Vec<_>>()
                .join(" "),
        )
    }

    /// Start time of the segment that best matches part of `search_text`
    pub fn find_time_for_text(&self, search_text: &str) -> Option<f64> {
        let mut best: Option<(f64, f64)> = None;
        for segment in &self.segments {
            let score = fuzzy::partial_ratio(&segment.text, search_text);
            if best.map_or(true, |(s, _)| score > s) {
                best = Some((score, segment.start));
            }
        }

        best.filter(|(score, _)| *score > MATCH_THRESHOLD)
            .map(|(_, start)| start)
    }
}
