//! Sync daemon
//!
//! Startup:
//! 1. Connectivity checks (logged, never fatal)
//! 2. Reset jobs interrupted by a restart
//! 3. One sync cycle and one discovery cycle right away
//!
//! Then the sync, job and discovery timers run until shutdown. Cycles never
//! overlap; shutdown interrupts whichever one is running.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::clients::{
    storyteller, AbsClient, HardcoverClient, HardcoverService, KoSyncClient,
};
use crate::config::Config;
use crate::ebook::EbookParser;
use crate::models::MappingDb;
use crate::store::JsonStore;
use crate::sync::{jobs, JobRunner, Services, SuggestionManager, SyncEngine};
use crate::transcript::Transcriber;

/// Connect to every configured service
pub async fn build_services(config: &Config) -> Services {
    Services {
        abs: Arc::new(AbsClient::new(&config.abs)),
        kosync: Arc::new(KoSyncClient::new(&config.kosync)),
        storyteller: storyteller::connect(&config.storyteller).await,
        hardcover: HardcoverClient::new(&config.hardcover)
            .map(|c| Arc::new(c) as Arc<dyn HardcoverService>),
    }
}

/// Check every service once. Returns `true` when all of them answered.
pub async fn connectivity_checks(services: &Services) -> bool {
    info!("Running connectivity checks");
    let mut ok = true;

    if let Err(e) = services.abs.check_connection().await {
        error!(error = %e, "Audiobookshelf check failed");
        ok = false;
    }
    if let Err(e) = services.kosync.check_connection().await {
        error!(error = %e, "KOSync check failed");
        ok = false;
    }
    match &services.storyteller {
        Some(st) => {
            if let Err(e) = st.check_connection().await {
                error!(backend = st.backend(), error = %e, "Storyteller check failed");
                ok = false;
            }
        }
        None => info!("Storyteller disabled"),
    }
    if let Some(hardcover) = &services.hardcover {
        if let Err(e) = hardcover.check_connection().await {
            warn!(error = %e, "Hardcover token failed");
            ok = false;
        }
    }

    ok
}

#[derive(Debug, Clone, Copy)]
enum Task {
    Sync,
    Jobs,
    Discovery,
}

pub struct Daemon {
    services: Services,
    engine: SyncEngine,
    jobs: JobRunner,
    discovery: SuggestionManager,
    mappings: JsonStore<MappingDb>,
    sync_period: Duration,
    job_interval: Duration,
    discovery_interval: Duration,
}

impl Daemon {
    pub fn new(config: &Config, services: Services) -> Self {
        let paths = &config.paths;
        let mappings = JsonStore::new(paths.mapping_db());
        let ebooks = Arc::new(EbookParser::new(&paths.books_dir));

        let engine = SyncEngine::new(
            services.clone(),
            ebooks.clone(),
            config.sync.thresholds(),
            mappings.clone(),
            JsonStore::new(paths.state_file()),
        );
        let jobs = JobRunner::new(
            services.clone(),
            ebooks.clone(),
            Transcriber::new(&paths.data_dir, config.transcribe.clone()),
            mappings.clone(),
        );
        let discovery = SuggestionManager::new(
            services.clone(),
            ebooks,
            JsonStore::new(paths.suggestions_file()),
        );

        Self {
            services,
            engine,
            jobs,
            discovery,
            mappings,
            sync_period: config.sync.sync_period(),
            job_interval: config.sync.job_interval(),
            discovery_interval: config.sync.discovery_interval(),
        }
    }

    /// Run until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        info!(
            sync_period_secs = self.sync_period.as_secs(),
            storyteller = self.services.storyteller.as_ref().map(|s| s.backend()).unwrap_or("disabled"),
            hardcover = self.services.hardcover.is_some(),
            "Sync daemon starting"
        );

        connectivity_checks(&self.services).await;

        let reset = jobs::cleanup_stale_jobs(&self.mappings)?;
        if reset > 0 {
            info!(reset, "Reset interrupted jobs");
        }

        for task in [Task::Sync, Task::Discovery] {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Sync daemon shutting down");
                    return Ok(());
                }
                _ = self.run_task(task) => {}
            }
        }

        let start = Instant::now();
        let mut sync_tick = interval_at(start + self.sync_period, self.sync_period);
        let mut job_tick = interval_at(start + self.job_interval, self.job_interval);
        let mut discovery_tick = interval_at(start + self.discovery_interval, self.discovery_interval);
        for tick in [&mut sync_tick, &mut job_tick, &mut discovery_tick] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        info!("Sync daemon started");
        loop {
            let task = tokio::select! {
                _ = &mut shutdown => break,
                _ = sync_tick.tick() => Task::Sync,
                _ = job_tick.tick() => Task::Jobs,
                _ = discovery_tick.tick() => Task::Discovery,
            };

            tokio::select! {
                _ = &mut shutdown => {
                    info!(?task, "Shutdown interrupted running cycle");
                    break;
                }
                _ = self.run_task(task) => {}
            }
        }

        info!("Sync daemon shutting down");
        Ok(())
    }

    async fn run_task(&self, task: Task) {
        match task {
            Task::Sync => match self.engine.sync_cycle().await {
                Ok(report) if report.synced > 0 || report.skipped > 0 => {
                    info!(synced = report.synced, unchanged = report.unchanged, unmatched = report.unmatched, skipped = report.skipped, "Sync cycle complete");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Sync cycle failed"),
            },
            Task::Jobs => match self.jobs.check_pending_jobs().await {
                Ok(0) => {}
                Ok(activated) => info!(activated, "Jobs complete"),
                Err(e) => error!(error = %e, "Job check failed"),
            },
            Task::Discovery => {
                info!("Discovery cycle starting");
                let mapped: HashSet<String> = match self.mappings.load_or_default() {
                    Ok(db) => db.mapped_ids().into_iter().collect(),
                    Err(e) => {
                        error!(error = %e, "Cannot read mappings for discovery");
                        return;
                    }
                };
                match self.discovery.run_discovery_cycle(&mapped).await {
                    Ok(found) => info!(new_suggestions = found, "Discovery cycle complete"),
                    Err(e) => error!(error = %e, "Discovery cycle failed"),
                }
            }
        }
    }
}
