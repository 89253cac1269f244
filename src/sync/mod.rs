//! Progress synchronization
//!
//! - `engine`: the periodic three-way sync of every active mapping
//! - `jobs`: transcription of newly added mappings
//! - `discovery`: mapping suggestions for books read but not yet linked

pub mod discovery;
pub mod engine;
pub mod jobs;

use std::sync::Arc;
use tracing::{info, warn};

use crate::clients::{
    AudiobookService, ClientError, EbookSyncService, HardcoverMatch, HardcoverService,
    ReadingStatus, StorytellerService,
};
use crate::ebook::EbookError;
use crate::models::{Mapping, MappingDb};
use crate::store::{JsonStore, StoreError};
use crate::transcript::TranscriptError;

pub use discovery::SuggestionManager;
pub use engine::{CycleReport, Leader, SyncEngine};
pub use jobs::JobRunner;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Transcript(#[from] TranscriptError),

    #[error(transparent)]
    Ebook(#[from] EbookError),

    #[error("No audio files for {0}")]
    NoAudioFiles(String),

    #[error("No transcript for {0}")]
    MissingTranscript(String),
}

/// Remote services shared by the daemon's cycles
#[derive(Clone)]
pub struct Services {
    pub abs: Arc<dyn AudiobookService>,
    pub kosync: Arc<dyn EbookSyncService>,
    pub storyteller: Option<Arc<dyn StorytellerService>>,
    pub hardcover: Option<Arc<dyn HardcoverService>>,
}

impl Services {
    /// Look the mapping's audiobook up on Hardcover and mark it as being read.
    /// Returns the match so the caller can persist it.
    pub async fn automatch_hardcover(
        &self,
        mapping: &Mapping,
    ) -> Result<Option<HardcoverMatch>, SyncError> {
        let Some(hardcover) = &self.hardcover else {
            return Ok(None);
        };

        let item = self.abs.get_item_details(&mapping.abs_id).await?;
        let found = hardcover
            .find_book(item.isbn.as_deref(), &item.title, item.author.as_deref())
            .await?;

        match &found {
            Some(m) => {
                info!(abs_id = %mapping.abs_id, book_id = m.book_id, title = %m.title, "Matched on Hardcover");
                hardcover
                    .update_status(m.book_id, ReadingStatus::Reading, m.edition_id)
                    .await?;
            }
            None => info!(abs_id = %mapping.abs_id, title = %item.title, "No Hardcover match"),
        }
        Ok(found)
    }

    /// Push a 0..1 position to Hardcover as a page number
    pub async fn sync_hardcover(&self, mapping: &Mapping, percentage: f64) -> Result<(), SyncError> {
        let (Some(hardcover), Some(book_id)) = (&self.hardcover, mapping.hardcover_book_id) else {
            return Ok(());
        };

        let page = (mapping.hardcover_pages.unwrap_or(0) as f64 * percentage) as i64;
        let on_shelf = hardcover
            .update_progress(book_id, page, mapping.hardcover_edition_id)
            .await?;
        if !on_shelf {
            warn!(abs_id = %mapping.abs_id, book_id, "Book is not on the Hardcover shelf");
            return Ok(());
        }

        if percentage > 0.99 {
            hardcover
                .update_status(book_id, ReadingStatus::Read, mapping.hardcover_edition_id)
                .await?;
        }
        Ok(())
    }
}

/// Reload the mapping database and apply `update` to one mapping.
///
/// The web server edits the same file, so changes are made against a fresh
/// copy rather than a snapshot taken at the start of a cycle. Returns `false`
/// when the mapping no longer exists.
pub(crate) fn update_mapping<F>(
    store: &JsonStore<MappingDb>,
    abs_id: &str,
    update: F,
) -> Result<bool, StoreError>
where
    F: FnOnce(&mut Mapping),
{
    let mut db = store.load_or_default()?;
    let Some(mapping) = db.find_mut(abs_id) else {
        return Ok(false);
    };
    update(mapping);
    store.save(&db)?;
    Ok(true)
}

pub(crate) fn record_hardcover_match(
    store: &JsonStore<MappingDb>,
    abs_id: &str,
    found: &HardcoverMatch,
) -> Result<bool, StoreError> {
    update_mapping(store, abs_id, |m| {
        m.hardcover_book_id = Some(found.book_id);
        m.hardcover_edition_id = found.edition_id;
        m.hardcover_pages = found.pages;
    })
}
