//! Transcription jobs for newly added mappings
//!
//! `pending` -> `processing` -> `active`, or `failed_retry_later` on any
//! error. The status is saved before the job starts so the web UI shows it.

use std::sync::Arc;
use tracing::{error, info, warn};

use super::{record_hardcover_match, update_mapping, Services, SyncError};
use crate::ebook::EbookParser;
use crate::models::{Mapping, MappingDb, MappingStatus};
use crate::store::{JsonStore, StoreError};
use crate::transcript::Transcriber;

/// Recover from a restart: `crashed` mappings go back to `active` and jobs
/// cut off mid-run go back to `pending`. Returns how many were reset.
pub fn cleanup_stale_jobs(store: &JsonStore<MappingDb>) -> Result<usize, StoreError> {
    let mut db = store.load_or_default()?;
    let mut reset = 0;

    for mapping in &mut db.mappings {
        let next = match mapping.status {
            MappingStatus::Crashed => MappingStatus::Active,
            MappingStatus::Processing => MappingStatus::Pending,
            _ => continue,
        };
        info!(abs_id = %mapping.abs_id, from = ?mapping.status, to = ?next, "Resetting stale job");
        mapping.status = next;
        reset += 1;
    }

    if reset > 0 {
        store.save(&db)?;
    }
    Ok(reset)
}

pub struct JobRunner {
    services: Services,
    ebooks: Arc<EbookParser>,
    transcriber: Transcriber,
    mappings: JsonStore<MappingDb>,
}

impl JobRunner {
    pub fn new(
        services: Services,
        ebooks: Arc<EbookParser>,
        transcriber: Transcriber,
        mappings: JsonStore<MappingDb>,
    ) -> Self {
        Self {
            services,
            ebooks,
            transcriber,
            mappings,
        }
    }

    /// Run every pending job, one at a time. Returns how many became active.
    pub async fn check_pending_jobs(&self) -> Result<usize, SyncError> {
        let pending: Vec<Mapping> = self
            .mappings
            .load_or_default()?
            .mappings
            .into_iter()
            .filter(|m| m.status == MappingStatus::Pending)
            .collect();

        let mut activated = 0;
        for mapping in pending {
            info!(abs_id = %mapping.abs_id, title = %mapping.abs_title, "Starting job");
            if !update_mapping(&self.mappings, &mapping.abs_id, |m| {
                m.status = MappingStatus::Processing
            })? {
                continue;
            }

            match self.run_job(&mapping).await {
                Ok(transcript) => {
                    update_mapping(&self.mappings, &mapping.abs_id, |m| {
                        m.transcript_file = Some(transcript.clone());
                        m.status = MappingStatus::Active;
                    })?;
                    info!(abs_id = %mapping.abs_id, title = %mapping.abs_title, "Job complete");
                    activated += 1;
                    self.try_hardcover(&mapping).await;
                }
                Err(e) => {
                    error!(abs_id = %mapping.abs_id, title = %mapping.abs_title, error = %e, "Job failed");
                    update_mapping(&self.mappings, &mapping.abs_id, |m| {
                        m.status = MappingStatus::FailedRetryLater
                    })?;
                }
            }
        }

        Ok(activated)
    }

    /// Transcribe the audiobook and make sure the ebook parses
    async fn run_job(&self, mapping: &Mapping) -> Result<String, SyncError> {
        let audio_files = self.services.abs.get_audio_files(&mapping.abs_id).await?;
        if audio_files.is_empty() {
            return Err(SyncError::NoAudioFiles(mapping.abs_id.clone()));
        }

        let transcript = self
            .transcriber
            .process_audio(&mapping.abs_id, &audio_files)
            .await?;
        self.ebooks.load(&mapping.ebook_filename)?;

        Ok(transcript.to_string_lossy().into_owned())
    }

    async fn try_hardcover(&self, mapping: &Mapping) {
        match self.services.automatch_hardcover(mapping).await {
            Ok(Some(found)) => {
                if let Err(e) = record_hardcover_match(&self.mappings, &mapping.abs_id, &found) {
                    warn!(abs_id = %mapping.abs_id, error = %e, "Failed to save Hardcover match");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(abs_id = %mapping.abs_id, error = %e, "Hardcover match failed"),
        }
    }
}
