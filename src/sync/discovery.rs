//! Mapping suggestions
//!
//! Looks for books being read on one side only:
//! - ABS audiobooks in progress with a matching EPUB in the library
//! - Storyteller books read recently with a matching ABS audiobook
//!
//! Findings land in `suggestions.json` for the web UI to accept or dismiss.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Services, SyncError};
use crate::clients::AudiobookItem;
use crate::ebook::EbookParser;
use crate::fuzzy;
use crate::models::{
    now_secs, suggestion_key, Confidence, MatchType, SourceType, Suggestion, SuggestionDb,
    SuggestionState,
};
use crate::store::JsonStore;

const AUDIOBOOK_CACHE_MAX_AGE: Duration = Duration::from_secs(3600);
const MATCH_THRESHOLD: f64 = 80.0;
const HIGH_CONFIDENCE: f64 = 92.0;
/// Storyteller titles need a closer EPUB match because the filename is the key
const EBOOK_FILENAME_THRESHOLD: f64 = 90.0;
const STALE_AFTER_SECS: f64 = 7.0 * 86_400.0;
const RECENT_ACTIVITY_HOURS: u64 = 24;
const RECENT_MIN_PROGRESS: f64 = 0.01;

/// `None` when the score is too low to suggest
pub fn confidence(score: f64) -> Option<Confidence> {
    if score > HIGH_CONFIDENCE {
        Some(Confidence::High)
    } else if score > MATCH_THRESHOLD {
        Some(Confidence::Medium)
    } else {
        None
    }
}

/// Remove pending and dismissed suggestions older than seven days
pub fn purge_stale(db: &mut SuggestionDb, now: f64) -> usize {
    let before = db.len();
    db.retain(|_, s| s.state == SuggestionState::Accepted || now - s.timestamp <= STALE_AFTER_SECS);
    before - db.len()
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Highest-scoring candidate above `threshold`; the first one wins a tie
fn best_match<'a, T>(
    title: &str,
    candidates: impl IntoIterator<Item = (&'a str, T)>,
    threshold: f64,
) -> Option<(T, f64)> {
    let mut best: Option<(T, f64)> = None;
    for (name, item) in candidates {
        let score = fuzzy::token_sort_ratio(title, name);
        if best.as_ref().map_or(true, |(_, s)| score > *s) {
            best = Some((item, score));
        }
    }
    best.filter(|(_, score)| *score > threshold)
}

#[derive(Default)]
struct AudiobookCache {
    items: Vec<AudiobookItem>,
    fetched_at: Option<Instant>,
}

pub struct SuggestionManager {
    services: Services,
    ebooks: Arc<EbookParser>,
    store: JsonStore<SuggestionDb>,
    audiobooks: Mutex<AudiobookCache>,
}

impl SuggestionManager {
    pub fn new(services: Services, ebooks: Arc<EbookParser>, store: JsonStore<SuggestionDb>) -> Self {
        Self {
            services,
            ebooks,
            store,
            audiobooks: Mutex::new(AudiobookCache::default()),
        }
    }

    /// One discovery pass. Returns the number of new suggestions.
    pub async fn run_discovery_cycle(&self, mapped_ids: &HashSet<String>) -> Result<usize, SyncError> {
        debug!(mapped = mapped_ids.len(), "Discovery starting");
        let mut db = self.store.load_or_default()?;
        let epubs: Vec<(String, String)> = self
            .ebooks
            .list_epubs()
            .iter()
            .map(|p| (file_stem(p), file_name(p)))
            .collect();

        let mut found = self.discover_from_abs(&mut db, mapped_ids, &epubs).await;
        found += self.discover_from_storyteller(&mut db, mapped_ids, &epubs).await;

        let purged = purge_stale(&mut db, now_secs());
        if found > 0 || purged > 0 {
            self.store.save(&db)?;
        }
        if found > 0 {
            info!(new = found, "Generated suggestions");
        }
        if purged > 0 {
            info!(removed = purged, "Cleaned up stale suggestions");
        }
        Ok(found)
    }

    async fn discover_from_abs(
        &self,
        db: &mut SuggestionDb,
        mapped_ids: &HashSet<String>,
        epubs: &[(String, String)],
    ) -> usize {
        let in_progress = match self.services.abs.get_in_progress().await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "Could not list in-progress audiobooks");
                return 0;
            }
        };

        let mut found = 0;
        for item in in_progress {
            if mapped_ids.contains(&item.id) {
                continue;
            }
            let key = suggestion_key(SourceType::Abs, &item.id);
            if db.contains_key(&key) {
                continue;
            }

            let candidates = epubs.iter().map(|(stem, name)| (stem.as_str(), name));
            let Some((filename, score)) = best_match(&item.title, candidates, MATCH_THRESHOLD) else {
                continue;
            };
            let Some(confidence) = confidence(score) else {
                continue;
            };

            debug!(title = %item.title, filename = %filename, score, "Audiobook matches ebook");
            db.insert(
                key,
                Suggestion {
                    state: SuggestionState::Pending,
                    timestamp: now_secs(),
                    confidence,
                    score,
                    source_type: SourceType::Abs,
                    source_title: item.title.clone(),
                    source_id: item.id.clone(),
                    match_type: MatchType::Ebook,
                    match_title: filename.clone(),
                    match_id: None,
                    match_filename: Some(filename.clone()),
                    source_filename: None,
                },
            );
            found += 1;
        }
        found
    }

    async fn discover_from_storyteller(
        &self,
        db: &mut SuggestionDb,
        mapped_ids: &HashSet<String>,
        epubs: &[(String, String)],
    ) -> usize {
        let Some(storyteller) = &self.services.storyteller else {
            return 0;
        };

        let recent = match storyteller
            .get_recent_activity(RECENT_ACTIVITY_HOURS, RECENT_MIN_PROGRESS)
            .await
        {
            Ok(recent) => recent,
            Err(e) => {
                warn!(error = %e, "Could not read Storyteller activity");
                return 0;
            }
        };
        if recent.is_empty() {
            return 0;
        }

        let audiobooks = self.audiobooks().await;
        let mut found = 0;
        for activity in recent {
            let candidates = audiobooks.iter().map(|ab| (ab.title.as_str(), ab));
            let Some((audiobook, score)) = best_match(&activity.title, candidates, MATCH_THRESHOLD)
            else {
                continue;
            };
            if mapped_ids.contains(&audiobook.id) {
                continue;
            }
            let key = suggestion_key(SourceType::Storyteller, &activity.id);
            if db.contains_key(&key) {
                continue;
            }
            let Some(confidence) = confidence(score) else {
                continue;
            };

            let ebook = epubs
                .iter()
                .find(|(stem, _)| fuzzy::token_sort_ratio(&activity.title, stem) > EBOOK_FILENAME_THRESHOLD)
                .map(|(_, name)| name.clone());
            let Some(ebook) = ebook else {
                warn!(title = %activity.title, "No ebook file for Storyteller book");
                continue;
            };

            db.insert(
                key,
                Suggestion {
                    state: SuggestionState::Pending,
                    timestamp: now_secs(),
                    confidence,
                    score,
                    source_type: SourceType::Storyteller,
                    source_title: activity.title.clone(),
                    source_id: activity.id.clone(),
                    match_type: MatchType::Audiobook,
                    match_title: audiobook.title.clone(),
                    match_id: Some(audiobook.id.clone()),
                    match_filename: None,
                    source_filename: Some(ebook),
                },
            );
            found += 1;
        }
        found
    }

    /// All ABS audiobooks, refreshed at most hourly
    async fn audiobooks(&self) -> Vec<AudiobookItem> {
        let mut cache = self.audiobooks.lock().await;
        let stale = cache
            .fetched_at
            .map_or(true, |t| t.elapsed() > AUDIOBOOK_CACHE_MAX_AGE);

        if stale || cache.items.is_empty() {
            info!("Refreshing audiobook cache for discovery");
            match self.services.abs.get_all_audiobooks().await {
                Ok(items) => {
                    cache.items = items;
                    cache.fetched_at = Some(Instant::now());
                }
                Err(e) => warn!(error = %e, "Could not refresh audiobook cache"),
            }
        }
        cache.items.clone()
    }
}
