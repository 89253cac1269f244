//! Three-way progress sync
//!
//! Each cycle, for every active mapping:
//! 1. Read ABS seconds, KOSync fraction and Storyteller fraction
//! 2. Compare against the last recorded state; stop if nothing moved
//! 3. Pick the leader (furthest progress; ties go KOSync, Storyteller, ABS)
//! 4. Translate the leader's position through the ebook text and the
//!    transcript and write it to the other services, never pulling a service
//!    back by more than the regression threshold
//! 5. Push the result to Hardcover and record what each service now holds

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{record_hardcover_match, Services, SyncError};
use crate::clients::StorytellerPosition;
use crate::config::SyncThresholds;
use crate::ebook::{Book, EbookParser};
use crate::models::{now_secs, BookState, Mapping, MappingDb, MappingStatus, SyncStateDb};
use crate::store::JsonStore;
use crate::transcript::Transcript;

/// Progress below this is not worth reporting to Hardcover
const HARDCOVER_MIN_PROGRESS: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leader {
    KoSync,
    Storyteller,
    Abs,
}

impl fmt::Display for Leader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leader::KoSync => write!(f, "KOSYNC"),
            Leader::Storyteller => write!(f, "STORYTELLER"),
            Leader::Abs => write!(f, "ABS"),
        }
    }
}

/// Furthest position wins; on a tie the earlier of KOSync, Storyteller, ABS.
/// Services without a usable position (`None`) do not take part.
pub fn select_leader(kosync: f64, storyteller: Option<f64>, abs: Option<f64>) -> (Leader, f64) {
    let mut leader = (Leader::KoSync, kosync);
    for candidate in [
        storyteller.map(|p| (Leader::Storyteller, p)),
        abs.map(|p| (Leader::Abs, p)),
    ]
    .into_iter()
    .flatten()
    {
        if candidate.1 > leader.1 {
            leader = candidate;
        }
    }
    leader
}

/// Counts for one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub synced: usize,
    pub unchanged: usize,
    /// Leader moved but its position could not be translated
    pub unmatched: usize,
    /// Read failures; retried next cycle
    pub skipped: usize,
}

enum Outcome {
    Synced,
    Unchanged,
    Unmatched,
}

struct Observed {
    abs_ts: f64,
    abs_pct: Option<f64>,
    kosync: f64,
    storyteller: Option<StorytellerPosition>,
}

/// What each service holds once a cycle's writes are done. A blocked write
/// leaves the observed value; a failed one records the intended value so the
/// next cycle sees the difference and tries again.
struct Applied {
    abs_ts: f64,
    kosync_pct: f64,
    storyteller_pct: Option<f64>,
    /// Position pushed to Hardcover
    progress: f64,
}

impl Applied {
    fn observed(seen: &Observed, progress: f64) -> Self {
        Self {
            abs_ts: seen.abs_ts,
            kosync_pct: seen.kosync,
            storyteller_pct: seen.storyteller.as_ref().map(|p| p.percentage),
            progress,
        }
    }
}

pub struct SyncEngine {
    services: Services,
    ebooks: Arc<EbookParser>,
    thresholds: SyncThresholds,
    mappings: JsonStore<MappingDb>,
    state: JsonStore<SyncStateDb>,
}

impl SyncEngine {
    pub fn new(
        services: Services,
        ebooks: Arc<EbookParser>,
        thresholds: SyncThresholds,
        mappings: JsonStore<MappingDb>,
        state: JsonStore<SyncStateDb>,
    ) -> Self {
        Self {
            services,
            ebooks,
            thresholds,
            mappings,
            state,
        }
    }

    pub async fn sync_cycle(&self) -> Result<CycleReport, SyncError> {
        debug!("Sync cycle starting");
        let db = self.mappings.load_or_default()?;
        let mut state = self.state.load_or_default()?;
        let mut report = CycleReport::default();

        for mapping in db.mappings.iter().filter(|m| m.status == MappingStatus::Active) {
            match self.sync_mapping(mapping, &mut state).await {
                Ok(Outcome::Synced) => report.synced += 1,
                Ok(Outcome::Unchanged) => report.unchanged += 1,
                Ok(Outcome::Unmatched) => report.unmatched += 1,
                Err(e) => {
                    warn!(abs_id = %mapping.abs_id, title = %mapping.abs_title, error = %e, "Skipping mapping this cycle");
                    report.skipped += 1;
                    continue;
                }
            }
            self.state.save(&state)?;
        }

        debug!(?report, "Sync cycle finished");
        Ok(report)
    }

    fn load_transcript(&self, mapping: &Mapping) -> Result<Transcript, SyncError> {
        let path = mapping
            .transcript_file
            .as_deref()
            .ok_or_else(|| SyncError::MissingTranscript(mapping.abs_id.clone()))?;
        Ok(Transcript::load(Path::new(path))?)
    }

    async fn observe(&self, mapping: &Mapping, transcript: &Transcript) -> Result<Observed, SyncError> {
        let abs_ts = self.services.abs.get_progress(&mapping.abs_id).await?;
        let kosync = self.services.kosync.get_progress(&mapping.kosync_doc_id).await?;
        let storyteller = match &self.services.storyteller {
            Some(st) => st.get_progress(&mapping.ebook_filename).await?,
            None => None,
        };

        Ok(Observed {
            abs_ts,
            abs_pct: transcript.to_percentage(abs_ts),
            kosync,
            storyteller,
        })
    }

    /// Whether an ebook position moved far enough to count
    fn ebook_changed(&self, new: f64, old: f64, total_chars: usize) -> bool {
        let delta = (new - old).abs();
        delta > self.thresholds.progress_fraction
            || (total_chars > 0 && delta * total_chars as f64 > self.thresholds.chars)
    }

    /// `true` (and logged) when writing `new` would pull a service back
    /// further than allowed
    fn blocks_regression(&self, mapping: &Mapping, target: Leader, current: Option<f64>, new: f64) -> bool {
        match current {
            Some(current) if current - new > self.thresholds.regression_fraction => {
                warn!(
                    title = %mapping.abs_title,
                    target = %target,
                    current,
                    new,
                    "Blocked regression"
                );
                true
            }
            _ => false,
        }
    }

    async fn sync_mapping(&self, mapping: &Mapping, state: &mut SyncStateDb) -> Result<Outcome, SyncError> {
        let transcript = self.load_transcript(mapping)?;
        let book = self.ebooks.load(&mapping.ebook_filename)?;
        let seen = self.observe(mapping, &transcript).await?;

        let prev = state.get(&mapping.abs_id).cloned().unwrap_or_default();
        let st_pct = seen.storyteller.as_ref().map(|p| p.percentage);

        let abs_changed = (seen.abs_ts - prev.abs_ts).abs() > self.thresholds.abs_seconds;
        let ko_changed = self.ebook_changed(seen.kosync, prev.kosync_pct, book.total_chars());
        let st_changed = st_pct.map_or(false, |p| {
            self.ebook_changed(p, prev.storyteller_pct, book.total_chars())
        });

        if !(abs_changed || ko_changed || st_changed) {
            state.insert(
                mapping.abs_id.clone(),
                BookState {
                    abs_ts: seen.abs_ts,
                    abs_pct: seen.abs_pct.unwrap_or(0.0),
                    kosync_pct: seen.kosync,
                    storyteller_pct: st_pct.unwrap_or(0.0),
                    last_updated: prev.last_updated,
                },
            );
            return Ok(Outcome::Unchanged);
        }

        let (leader, leader_pct) = select_leader(seen.kosync, st_pct, seen.abs_pct);
        info!(title = %mapping.abs_title, leader = %leader, progress = leader_pct, "Leader selected");

        let result = match leader {
            Leader::Abs => self.propagate_from_abs(mapping, &seen, &book, &transcript).await,
            Leader::KoSync => self.propagate_from_kosync(mapping, &seen, &book, &transcript).await,
            Leader::Storyteller => {
                self.propagate_from_storyteller(mapping, &seen, &book, &transcript)
                    .await
            }
        };

        let (applied, outcome) = match result {
            Some(applied) => (applied, Outcome::Synced),
            None => {
                warn!(title = %mapping.abs_title, leader = %leader, "Could not locate leader position");
                (Applied::observed(&seen, leader_pct), Outcome::Unmatched)
            }
        };

        if matches!(outcome, Outcome::Synced) && applied.progress > HARDCOVER_MIN_PROGRESS {
            self.update_hardcover(mapping, applied.progress).await;
        }

        state.insert(
            mapping.abs_id.clone(),
            BookState {
                abs_ts: applied.abs_ts,
                abs_pct: transcript.to_percentage(applied.abs_ts).unwrap_or(0.0),
                kosync_pct: applied.kosync_pct,
                storyteller_pct: applied.storyteller_pct.unwrap_or(0.0),
                last_updated: now_secs(),
            },
        );
        Ok(outcome)
    }

    /// Audio position -> ebook
    async fn propagate_from_abs(
        &self,
        mapping: &Mapping,
        seen: &Observed,
        book: &Book,
        transcript: &Transcript,
    ) -> Option<Applied> {
        let text = transcript.text_at_time(seen.abs_ts)?;
        let location = book.find_text_location(&text, seen.abs_pct)?;
        let pct = location.percentage;

        let mut applied = Applied::observed(seen, pct);
        if self
            .write_kosync(mapping, seen, pct, location.xpointer.as_deref())
            .await
        {
            applied.kosync_pct = pct;
        }
        if self.write_storyteller(mapping, seen, pct).await {
            applied.storyteller_pct = Some(pct);
        }
        Some(applied)
    }

    /// Ebook position -> audio
    async fn propagate_from_kosync(
        &self,
        mapping: &Mapping,
        seen: &Observed,
        book: &Book,
        transcript: &Transcript,
    ) -> Option<Applied> {
        let text = book.text_at_percentage(seen.kosync)?;
        let ts = transcript.find_time_for_text(&text)?;

        let mut applied = Applied::observed(seen, seen.kosync);
        if self.write_abs(mapping, seen, transcript, ts).await {
            applied.abs_ts = ts;
        }
        if self.write_storyteller(mapping, seen, seen.kosync).await {
            applied.storyteller_pct = Some(seen.kosync);
        }
        Some(applied)
    }

    /// Storyteller position -> audio and KOSync
    async fn propagate_from_storyteller(
        &self,
        mapping: &Mapping,
        seen: &Observed,
        book: &Book,
        transcript: &Transcript,
    ) -> Option<Applied> {
        let position = seen.storyteller.as_ref()?;
        let pct = position.percentage;

        let text = self
            .fragment_text(mapping, position)
            .or_else(|| book.text_at_percentage(pct))?;
        let ts = transcript.find_time_for_text(&text)?;

        let mut applied = Applied::observed(seen, pct);
        if self.write_abs(mapping, seen, transcript, ts).await {
            applied.abs_ts = ts;
        }

        let xpointer = book
            .find_text_location(&text, Some(pct))
            .and_then(|l| l.xpointer);
        if self.write_kosync(mapping, seen, pct, xpointer.as_deref()).await {
            applied.kosync_pct = pct;
        }
        Some(applied)
    }

    /// Text of the element Storyteller's locator points at, when it has one
    fn fragment_text(&self, mapping: &Mapping, position: &StorytellerPosition) -> Option<String> {
        let (href, fragment) = (position.href.as_deref()?, position.fragment.as_deref()?);
        match self
            .ebooks
            .text_for_fragment(&mapping.ebook_filename, href, fragment)
        {
            Ok(text) => text,
            Err(e) => {
                debug!(title = %mapping.abs_title, error = %e, "Fragment lookup failed");
                None
            }
        }
    }

    // The write helpers return `false` when the write was held back and the
    // service keeps its observed position.

    async fn write_abs(&self, mapping: &Mapping, seen: &Observed, transcript: &Transcript, ts: f64) -> bool {
        let new_pct = transcript.to_percentage(ts).unwrap_or(0.0);
        if self.blocks_regression(mapping, Leader::Abs, seen.abs_pct, new_pct) {
            return false;
        }
        if let Err(e) = self.services.abs.update_progress(&mapping.abs_id, ts).await {
            warn!(title = %mapping.abs_title, error = %e, "Audiobookshelf update failed");
        }
        true
    }

    async fn write_kosync(&self, mapping: &Mapping, seen: &Observed, pct: f64, xpointer: Option<&str>) -> bool {
        if self.blocks_regression(mapping, Leader::KoSync, Some(seen.kosync), pct) {
            return false;
        }
        if let Err(e) = self
            .services
            .kosync
            .update_progress(&mapping.kosync_doc_id, pct, xpointer)
            .await
        {
            warn!(title = %mapping.abs_title, error = %e, "KOSync update failed");
        }
        true
    }

    async fn write_storyteller(&self, mapping: &Mapping, seen: &Observed, pct: f64) -> bool {
        let Some(storyteller) = &self.services.storyteller else {
            return false;
        };
        let current = seen.storyteller.as_ref().map(|p| p.percentage);
        if current.is_none() {
            // Book unknown to Storyteller
            return false;
        }
        if self.blocks_regression(mapping, Leader::Storyteller, current, pct) {
            return false;
        }
        if let Err(e) = storyteller.update_progress(&mapping.ebook_filename, pct).await {
            warn!(title = %mapping.abs_title, error = %e, "Storyteller update failed");
        }
        true
    }

    async fn update_hardcover(&self, mapping: &Mapping, pct: f64) {
        if self.services.hardcover.is_none() {
            return;
        }

        let mut mapping = mapping.clone();
        if mapping.hardcover_book_id.is_none() {
            match self.services.automatch_hardcover(&mapping).await {
                Ok(Some(found)) => {
                    if let Err(e) = record_hardcover_match(&self.mappings, &mapping.abs_id, &found) {
                        warn!(abs_id = %mapping.abs_id, error = %e, "Failed to save Hardcover match");
                    }
                    mapping.hardcover_book_id = Some(found.book_id);
                    mapping.hardcover_edition_id = found.edition_id;
                    mapping.hardcover_pages = found.pages;
                }
                Ok(None) => return,
                Err(e) => {
                    warn!(abs_id = %mapping.abs_id, error = %e, "Hardcover match failed");
                    return;
                }
            }
        }

        if let Err(e) = self.services.sync_hardcover(&mapping, pct).await {
            warn!(abs_id = %mapping.abs_id, error = %e, "Hardcover progress update failed");
        }
    }
}
