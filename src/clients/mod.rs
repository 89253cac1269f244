//! Remote progress services
//!
//! Every service the sync engine talks to sits behind a trait so the engine
//! can run against in-memory fakes:
//! - `AudiobookService`: Audiobookshelf (seconds into the audiobook)
//! - `EbookSyncService`: KOSync (fraction plus KOReader XPointer)
//! - `StorytellerService`: Storyteller REST API or its SQLite database
//! - `HardcoverService`: Hardcover reading tracker

pub mod abs;
pub mod hardcover;
pub mod kosync;
pub mod storyteller;

use serde_json::Value;

use crate::transcript::AudioFile;

pub use abs::AbsClient;
pub use hardcover::HardcoverClient;
pub use kosync::{partial_md5, KoSyncClient};

/// Errors from any remote service
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl ClientError {
    pub(crate) fn http(response: &reqwest::Response) -> Self {
        ClientError::Http {
            status: response.status().as_u16(),
            url: response.url().to_string(),
        }
    }
}

/// An audiobook as listed by Audiobookshelf
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct AudiobookItem {
    pub id: String,
    pub title: String,
    pub author: Option<String>,
    pub isbn: Option<String>,
}

impl AudiobookItem {
    /// From an ABS library item; `None` without an id
    pub fn from_library_item(item: &Value) -> Option<Self> {
        let id = item.get("id")?.as_str()?.to_string();
        let metadata = item.pointer("/media/metadata");
        let text = |key: &str| {
            metadata
                .and_then(|m| m.get(key))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let title = text("title")
            .or_else(|| item.get("name").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| "Unknown".to_string());

        Some(Self {
            id,
            title,
            author: text("authorName"),
            isbn: text("isbn"),
        })
    }
}

#[async_trait::async_trait]
pub trait AudiobookService: Send + Sync {
    async fn check_connection(&self) -> Result<(), ClientError>;

    /// Every audiobook in every library
    async fn get_all_audiobooks(&self) -> Result<Vec<AudiobookItem>, ClientError>;

    /// Items the user has started listening to
    async fn get_in_progress(&self) -> Result<Vec<AudiobookItem>, ClientError>;

    async fn get_item_details(&self, item_id: &str) -> Result<AudiobookItem, ClientError>;

    async fn get_audio_files(&self, item_id: &str) -> Result<Vec<AudioFile>, ClientError>;

    /// Seconds listened; 0 when nothing is recorded
    async fn get_progress(&self, item_id: &str) -> Result<f64, ClientError>;

    async fn update_progress(&self, item_id: &str, seconds: f64) -> Result<(), ClientError>;
}

#[async_trait::async_trait]
pub trait EbookSyncService: Send + Sync {
    async fn check_connection(&self) -> Result<(), ClientError>;

    /// 0..1; 0 when the document has never been synced
    async fn get_progress(&self, doc_id: &str) -> Result<f64, ClientError>;

    async fn update_progress(
        &self,
        doc_id: &str,
        percentage: f64,
        xpointer: Option<&str>,
    ) -> Result<(), ClientError>;
}

/// Current Storyteller position of a book
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StorytellerPosition {
    pub percentage: f64,
    /// Milliseconds since the epoch
    pub timestamp: Option<i64>,
    /// Spine document of the locator (SQLite backend only)
    pub href: Option<String>,
    /// Element id within `href` (SQLite backend only)
    pub fragment: Option<String>,
}

/// A Storyteller book read recently
#[derive(Debug, Clone, PartialEq)]
pub struct StorytellerActivity {
    pub id: String,
    pub title: String,
    pub progress: f64,
}

#[async_trait::async_trait]
pub trait StorytellerService: Send + Sync {
    /// `"api"` or `"sqlite"`
    fn backend(&self) -> &'static str;

    async fn check_connection(&self) -> Result<(), ClientError>;

    /// `None` when the book is unknown or has no position yet
    async fn get_progress(
        &self,
        ebook_filename: &str,
    ) -> Result<Option<StorytellerPosition>, ClientError>;

    /// `false` when the book is unknown
    async fn update_progress(&self, ebook_filename: &str, percentage: f64)
        -> Result<bool, ClientError>;

    async fn get_recent_activity(
        &self,
        hours: u64,
        min_progress: f64,
    ) -> Result<Vec<StorytellerActivity>, ClientError>;
}

/// A Hardcover book (and the edition used for page counts)
#[derive(Debug, Clone, PartialEq)]
pub struct HardcoverMatch {
    pub book_id: i64,
    pub edition_id: Option<i64>,
    pub pages: Option<i64>,
    pub title: String,
}

/// Hardcover `status_id` values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingStatus {
    Reading = 2,
    Read = 3,
}

#[async_trait::async_trait]
pub trait HardcoverService: Send + Sync {
    /// Returns the Hardcover user id
    async fn check_connection(&self) -> Result<i64, ClientError>;

    /// ISBN lookup first, then a title/author search
    async fn find_book(
        &self,
        isbn: Option<&str>,
        title: &str,
        author: Option<&str>,
    ) -> Result<Option<HardcoverMatch>, ClientError>;

    async fn update_status(
        &self,
        book_id: i64,
        status: ReadingStatus,
        edition_id: Option<i64>,
    ) -> Result<(), ClientError>;

    /// Set the page of the user's latest read. `false` when the book is not on
    /// the user's shelf.
    async fn update_progress(
        &self,
        book_id: i64,
        page: i64,
        edition_id: Option<i64>,
    ) -> Result<bool, ClientError>;
}
