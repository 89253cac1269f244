//! Persisted records shared by the daemon and the web server

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle of a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingStatus {
    /// Waiting for transcription
    Pending,
    /// Transcription job running
    Processing,
    /// Synced every cycle
    Active,
    /// Job failed; requeued from the web UI
    FailedRetryLater,
    /// Marked by an older release when a job died mid-sync
    Crashed,
}

/// One audiobook linked to one ebook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    pub abs_id: String,
    #[serde(default)]
    pub abs_title: String,
    pub kosync_doc_id: String,
    pub ebook_filename: String,
    #[serde(default)]
    pub transcript_file: Option<String>,
    pub status: MappingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardcover_book_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardcover_edition_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardcover_pages: Option<i64>,
}

impl Mapping {
    pub fn new_pending(
        abs_id: impl Into<String>,
        abs_title: impl Into<String>,
        kosync_doc_id: impl Into<String>,
        ebook_filename: impl Into<String>,
    ) -> Self {
        Self {
            abs_id: abs_id.into(),
            abs_title: abs_title.into(),
            kosync_doc_id: kosync_doc_id.into(),
            ebook_filename: ebook_filename.into(),
            transcript_file: None,
            status: MappingStatus::Pending,
            hardcover_book_id: None,
            hardcover_edition_id: None,
            hardcover_pages: None,
        }
    }
}

/// `mapping_db.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingDb {
    #[serde(default)]
    pub mappings: Vec<Mapping>,
}

impl MappingDb {
    pub fn find(&self, abs_id: &str) -> Option<&Mapping> {
        self.mappings.iter().find(|m| m.abs_id == abs_id)
    }

    pub fn find_mut(&mut self, abs_id: &str) -> Option<&mut Mapping> {
        self.mappings.iter_mut().find(|m| m.abs_id == abs_id)
    }

    pub fn mapped_ids(&self) -> Vec<String> {
        self.mappings.iter().map(|m| m.abs_id.clone()).collect()
    }

    pub fn count_by_status(&self) -> HashMap<MappingStatus, usize> {
        let mut counts = HashMap::new();
        for m in &self.mappings {
            *counts.entry(m.status).or_insert(0) += 1;
        }
        counts
    }
}

/// Last observed (or written) position of a mapping on every service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookState {
    #[serde(default)]
    pub abs_ts: f64,
    #[serde(default)]
    pub abs_pct: f64,
    #[serde(default)]
    pub kosync_pct: f64,
    #[serde(default)]
    pub storyteller_pct: f64,
    #[serde(default)]
    pub last_updated: f64,
}

/// `last_state.json`, keyed by ABS item id
pub type SyncStateDb = HashMap<String, BookState>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionState {
    Pending,
    Dismissed,
    Accepted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// Where a discovered book was being read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceType {
    Abs,
    Storyteller,
}

impl SourceType {
    pub fn key_prefix(&self) -> &'static str {
        match self {
            SourceType::Abs => "ABS",
            SourceType::Storyteller => "STORYTELLER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Ebook,
    Audiobook,
}

/// A proposed mapping found by discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub state: SuggestionState,
    pub timestamp: f64,
    pub confidence: Confidence,
    pub score: f64,
    pub source_type: SourceType,
    pub source_title: String,
    pub source_id: String,
    pub match_type: MatchType,
    pub match_title: String,
    #[serde(default)]
    pub match_id: Option<String>,
    #[serde(default)]
    pub match_filename: Option<String>,
    /// Ebook of a Storyteller-sourced suggestion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_filename: Option<String>,
}

impl Suggestion {
    /// Resolve to `(abs_id, abs_title, ebook_filename)` for a new mapping
    pub fn mapping_parts(&self) -> Option<(String, String, String)> {
        match self.match_type {
            MatchType::Ebook => Some((
                self.source_id.clone(),
                self.source_title.clone(),
                self.match_filename.clone()?,
            )),
            MatchType::Audiobook => Some((
                self.match_id.clone()?,
                self.match_title.clone(),
                self.source_filename.clone()?,
            )),
        }
    }
}

/// `suggestions.json`, keyed by `SOURCE:id`
pub type SuggestionDb = HashMap<String, Suggestion>;

pub fn suggestion_key(source: SourceType, source_id: &str) -> String {
    format!("{}:{}", source.key_prefix(), source_id)
}

pub fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_db_reads_legacy_json() {
        let json = r#"{
            "mappings": [
                {
                    "abs_id": "li_1",
                    "abs_title": "Dune",
                    "kosync_doc_id": "abc123",
                    "ebook_filename": "Dune.epub",
                    "transcript_file": "/data/transcripts/li_1.json",
                    "status": "failed_retry_later",
                    "hardcover_book_id": 42
                }
            ]
        }"#;

        let db: MappingDb = serde_json::from_str(json).unwrap();
        let m = db.find("li_1").unwrap();
        assert_eq!(m.status, MappingStatus::FailedRetryLater);
        assert_eq!(m.hardcover_book_id, Some(42));
        assert_eq!(m.hardcover_pages, None);
    }

    #[test]
    fn test_suggestion_key_and_parts() {
        assert_eq!(suggestion_key(SourceType::Storyteller, "u-1"), "STORYTELLER:u-1");

        let s = Suggestion {
            state: SuggestionState::Pending,
            timestamp: 0.0,
            confidence: Confidence::High,
            score: 95.0,
            source_type: SourceType::Storyteller,
            source_title: "Dune".to_string(),
            source_id: "u-1".to_string(),
            match_type: MatchType::Audiobook,
            match_title: "Dune".to_string(),
            match_id: Some("li_9".to_string()),
            match_filename: None,
            source_filename: Some("Dune.epub".to_string()),
        };
        assert_eq!(
            s.mapping_parts(),
            Some(("li_9".to_string(), "Dune".to_string(), "Dune.epub".to_string()))
        );
    }
}
