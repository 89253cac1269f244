//! Sync engine and discovery integration tests
//!
//! Remote services are in-memory fakes; the ebook is a real EPUB and the
//! transcript a real JSON file, both in a temp directory:
//! - leader selection and propagation in each direction
//! - regression protection
//! - change detection and skipped mappings
//! - discovery suggestions

mod common;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use abs_kosync::clients::{
    AudiobookItem, AudiobookService, ClientError, EbookSyncService, HardcoverMatch,
    HardcoverService, ReadingStatus, StorytellerActivity, StorytellerPosition, StorytellerService,
};
use abs_kosync::config::{SyncConfig, SyncThresholds};
use abs_kosync::ebook::EbookParser;
use abs_kosync::models::{
    BookState, Mapping, MappingDb, MappingStatus, SourceType, SuggestionDb, SuggestionState,
    SyncStateDb,
};
use abs_kosync::store::JsonStore;
use abs_kosync::sync::{Services, SuggestionManager, SyncEngine};
use abs_kosync::transcript::AudioFile;
use tempfile::TempDir;

// =============================================================================
// Fakes
// =============================================================================

#[derive(Default)]
struct FakeAbs {
    seconds: Mutex<f64>,
    updates: Mutex<Vec<(String, f64)>>,
    in_progress: Vec<AudiobookItem>,
}

#[async_trait::async_trait]
impl AudiobookService for FakeAbs {
    async fn check_connection(&self) -> Result<(), ClientError> {
        Ok(())
    }

    async fn get_all_audiobooks(&self) -> Result<Vec<AudiobookItem>, ClientError> {
        Ok(self.in_progress.clone())
    }

    async fn get_in_progress(&self) -> Result<Vec<AudiobookItem>, ClientError> {
        Ok(self.in_progress.clone())
    }

    async fn get_item_details(&self, item_id: &str) -> Result<AudiobookItem, ClientError> {
        Ok(AudiobookItem {
            id: item_id.to_string(),
            title: "1984".to_string(),
            author: None,
            isbn: None,
        })
    }

    async fn get_audio_files(&self, _item_id: &str) -> Result<Vec<AudioFile>, ClientError> {
        Ok(Vec::new())
    }

    async fn get_progress(&self, _item_id: &str) -> Result<f64, ClientError> {
        Ok(*self.seconds.lock().unwrap())
    }

    async fn update_progress(&self, item_id: &str, seconds: f64) -> Result<(), ClientError> {
        self.updates.lock().unwrap().push((item_id.to_string(), seconds));
        *self.seconds.lock().unwrap() = seconds;
        Ok(())
    }
}

#[derive(Default)]
struct FakeKoSync {
    percentage: Mutex<f64>,
    fail_reads: bool,
    updates: Mutex<Vec<(String, f64, Option<String>)>>,
}

#[async_trait::async_trait]
impl EbookSyncService for FakeKoSync {
    async fn check_connection(&self) -> Result<(), ClientError> {
        Ok(())
    }

    async fn get_progress(&self, _doc_id: &str) -> Result<f64, ClientError> {
        if self.fail_reads {
            return Err(ClientError::Network("connection refused".to_string()));
        }
        Ok(*self.percentage.lock().unwrap())
    }

    async fn update_progress(
        &self,
        doc_id: &str,
        percentage: f64,
        xpointer: Option<&str>,
    ) -> Result<(), ClientError> {
        self.updates
            .lock()
            .unwrap()
            .push((doc_id.to_string(), percentage, xpointer.map(str::to_string)));
        Ok(())
    }
}

#[derive(Default)]
struct FakeStoryteller {
    position: Mutex<Option<StorytellerPosition>>,
    recent: Vec<StorytellerActivity>,
    updates: Mutex<Vec<(String, f64)>>,
}

#[async_trait::async_trait]
impl StorytellerService for FakeStoryteller {
    fn backend(&self) -> &'static str {
        "fake"
    }

    async fn check_connection(&self) -> Result<(), ClientError> {
        Ok(())
    }

    async fn get_progress(&self, _ebook: &str) -> Result<Option<StorytellerPosition>, ClientError> {
        Ok(self.position.lock().unwrap().clone())
    }

    async fn update_progress(&self, ebook: &str, percentage: f64) -> Result<bool, ClientError> {
        self.updates.lock().unwrap().push((ebook.to_string(), percentage));
        Ok(true)
    }

    async fn get_recent_activity(
        &self,
        _hours: u64,
        _min_progress: f64,
    ) -> Result<Vec<StorytellerActivity>, ClientError> {
        Ok(self.recent.clone())
    }
}

#[derive(Default)]
struct FakeHardcover {
    progress: Mutex<Vec<(i64, i64)>>,
}

#[async_trait::async_trait]
impl HardcoverService for FakeHardcover {
    async fn check_connection(&self) -> Result<i64, ClientError> {
        Ok(1)
    }

    async fn find_book(
        &self,
        _isbn: Option<&str>,
        _title: &str,
        _author: Option<&str>,
    ) -> Result<Option<HardcoverMatch>, ClientError> {
        Ok(None)
    }

    async fn update_status(
        &self,
        _book_id: i64,
        _status: ReadingStatus,
        _edition_id: Option<i64>,
    ) -> Result<(), ClientError> {
        Ok(())
    }

    async fn update_progress(
        &self,
        book_id: i64,
        page: i64,
        _edition_id: Option<i64>,
    ) -> Result<bool, ClientError> {
        self.progress.lock().unwrap().push((book_id, page));
        Ok(true)
    }
}

// =============================================================================
// Fixture
// =============================================================================

struct Fixture {
    _dir: TempDir,
    books_dir: PathBuf,
    mappings: JsonStore<MappingDb>,
    state: JsonStore<SyncStateDb>,
    suggestions: JsonStore<SuggestionDb>,
}

impl Fixture {
    /// One active mapping `li_1` -> `1984.epub` with a ready transcript
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let books_dir = dir.path().join("books");
        let data_dir = dir.path().join("data");
        std::fs::create_dir_all(&books_dir).unwrap();
        std::fs::create_dir_all(data_dir.join("transcripts")).unwrap();

        common::write_epub(&books_dir, "1984.epub", &common::sample_chapters());
        let transcript = data_dir.join("transcripts").join("li_1.json");
        std::fs::write(&transcript, common::sample_transcript_json()).unwrap();

        let mut mapping = Mapping::new_pending("li_1", "1984", "doc-1984", "1984.epub");
        mapping.status = MappingStatus::Active;
        mapping.transcript_file = Some(transcript.to_string_lossy().into_owned());
        mapping.hardcover_book_id = Some(7);
        mapping.hardcover_pages = Some(300);

        let mappings = JsonStore::new(data_dir.join("mapping_db.json"));
        mappings.save(&MappingDb { mappings: vec![mapping] }).unwrap();

        Self {
            books_dir,
            mappings,
            state: JsonStore::new(data_dir.join("last_state.json")),
            suggestions: JsonStore::new(data_dir.join("suggestions.json")),
            _dir: dir,
        }
    }

    fn engine(&self, services: Services) -> SyncEngine {
        self.engine_with(services, SyncConfig::default().thresholds())
    }

    fn engine_with(&self, services: Services, thresholds: SyncThresholds) -> SyncEngine {
        SyncEngine::new(
            services,
            Arc::new(EbookParser::new(&self.books_dir)),
            thresholds,
            self.mappings.clone(),
            self.state.clone(),
        )
    }

    /// Record `li_1` as last seen at `abs_ts` seconds and `kosync_pct`
    fn seed_state(&self, abs_ts: f64, kosync_pct: f64) {
        let mut state = SyncStateDb::new();
        state.insert(
            "li_1".to_string(),
            BookState {
                abs_ts,
                abs_pct: abs_ts / 110.0,
                kosync_pct,
                storyteller_pct: 0.0,
                last_updated: 123.0,
            },
        );
        self.state.save(&state).unwrap();
    }
}

fn services(
    abs: &Arc<FakeAbs>,
    kosync: &Arc<FakeKoSync>,
    storyteller: Option<&Arc<FakeStoryteller>>,
    hardcover: Option<&Arc<FakeHardcover>>,
) -> Services {
    Services {
        abs: abs.clone(),
        kosync: kosync.clone(),
        storyteller: storyteller.map(|s| s.clone() as Arc<dyn StorytellerService>),
        hardcover: hardcover.map(|h| h.clone() as Arc<dyn HardcoverService>),
    }
}

// =============================================================================
// Sync cycle
// =============================================================================

#[tokio::test]
async fn test_abs_leads_and_updates_ebooks() {
    let fx = Fixture::new();
    let abs = Arc::new(FakeAbs {
        seconds: Mutex::new(75.0),
        ..Default::default()
    });
    let kosync = Arc::new(FakeKoSync {
        percentage: Mutex::new(0.1),
        ..Default::default()
    });
    let storyteller = Arc::new(FakeStoryteller {
        position: Mutex::new(Some(StorytellerPosition {
            percentage: 0.1,
            ..Default::default()
        })),
        ..Default::default()
    });
    let hardcover = Arc::new(FakeHardcover::default());

    let engine = fx.engine(services(&abs, &kosync, Some(&storyteller), Some(&hardcover)));
    let report = engine.sync_cycle().await.unwrap();
    assert_eq!(report.synced, 1);

    // Audio was the leader, so it is left alone
    assert!(abs.updates.lock().unwrap().is_empty());

    let ko_updates = kosync.updates.lock().unwrap().clone();
    assert_eq!(ko_updates.len(), 1);
    let (doc, pct, xpointer) = &ko_updates[0];
    assert_eq!(doc, "doc-1984");
    assert!(*pct > 0.5 && *pct < 0.75, "unexpected ebook position {}", pct);
    assert!(xpointer.as_deref().unwrap().starts_with("/body/DocFragment[2]/"));

    let st_updates = storyteller.updates.lock().unwrap().clone();
    assert_eq!(st_updates.len(), 1);
    assert_eq!(st_updates[0].0, "1984.epub");
    assert!((st_updates[0].1 - pct).abs() < 1e-9);

    let hc = hardcover.progress.lock().unwrap().clone();
    assert_eq!(hc.len(), 1);
    assert_eq!(hc[0].0, 7);
    assert_eq!(hc[0].1, (300.0 * pct) as i64);

    let state = fx.state.load_or_default().unwrap();
    let recorded = &state["li_1"];
    assert_eq!(recorded.abs_ts, 75.0);
    assert!((recorded.kosync_pct - pct).abs() < 1e-9);
    assert!(recorded.last_updated > 0.0);
}

#[tokio::test]
async fn test_kosync_leads_and_moves_audio() {
    let fx = Fixture::new();
    let abs = Arc::new(FakeAbs {
        seconds: Mutex::new(5.0),
        ..Default::default()
    });
    let kosync = Arc::new(FakeKoSync {
        percentage: Mutex::new(0.66),
        ..Default::default()
    });

    let engine = fx.engine(services(&abs, &kosync, None, None));
    let report = engine.sync_cycle().await.unwrap();
    assert_eq!(report.synced, 1);

    assert!(kosync.updates.lock().unwrap().is_empty());
    let abs_updates = abs.updates.lock().unwrap().clone();
    assert_eq!(abs_updates.len(), 1);
    assert_eq!(abs_updates[0].0, "li_1");
    assert!(abs_updates[0].1 > 5.0 && abs_updates[0].1 < 110.0);

    let state = fx.state.load_or_default().unwrap();
    assert_eq!(state["li_1"].kosync_pct, 0.66);
    assert_eq!(state["li_1"].abs_ts, abs_updates[0].1);
}

#[tokio::test]
async fn test_large_backwards_jump_is_blocked() {
    let fx = Fixture::new();
    // Near the end of the audio, but the text around it maps well behind
    // where the ebook reader already is
    let abs = Arc::new(FakeAbs {
        seconds: Mutex::new(109.0),
        ..Default::default()
    });
    let kosync = Arc::new(FakeKoSync {
        percentage: Mutex::new(0.9),
        ..Default::default()
    });

    let engine = fx.engine(services(&abs, &kosync, None, None));
    let report = engine.sync_cycle().await.unwrap();

    assert_eq!(report.synced, 1);
    assert!(kosync.updates.lock().unwrap().is_empty());
    assert!(abs.updates.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_blocked_write_records_position_the_service_kept() {
    let fx = Fixture::new();
    let abs = Arc::new(FakeAbs {
        seconds: Mutex::new(109.0),
        ..Default::default()
    });
    let kosync = Arc::new(FakeKoSync {
        percentage: Mutex::new(0.9),
        ..Default::default()
    });
    let hardcover = Arc::new(FakeHardcover::default());

    let engine = fx.engine(services(&abs, &kosync, None, Some(&hardcover)));
    assert_eq!(engine.sync_cycle().await.unwrap().synced, 1);
    assert!(kosync.updates.lock().unwrap().is_empty());

    let recorded = fx.state.load_or_default().unwrap()["li_1"].clone();
    assert_eq!(recorded.kosync_pct, 0.9);
    assert_eq!(recorded.abs_ts, 109.0);

    // Nobody moved, so the next cycle neither retries the write nor
    // pushes Hardcover again
    let report = engine.sync_cycle().await.unwrap();
    assert_eq!(report.unchanged, 1);
    assert_eq!(report.synced, 0);
    assert!(kosync.updates.lock().unwrap().is_empty());
    assert_eq!(hardcover.progress.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_storyteller_leads_from_fragment() {
    let fx = Fixture::new();
    let abs = Arc::new(FakeAbs {
        seconds: Mutex::new(5.0),
        ..Default::default()
    });
    let kosync = Arc::new(FakeKoSync {
        percentage: Mutex::new(0.1),
        ..Default::default()
    });
    let storyteller = Arc::new(FakeStoryteller {
        position: Mutex::new(Some(StorytellerPosition {
            percentage: 0.85,
            href: Some("Text/ch1.xhtml".to_string()),
            fragment: Some("s9".to_string()),
            ..Default::default()
        })),
        ..Default::default()
    });

    let engine = fx.engine(services(&abs, &kosync, Some(&storyteller), None));
    let report = engine.sync_cycle().await.unwrap();
    assert_eq!(report.synced, 1);

    // "Behind him the voice from the telescreen..." is read at 70 s
    assert_eq!(abs.updates.lock().unwrap().clone(), vec![("li_1".to_string(), 70.0)]);

    let ko_updates = kosync.updates.lock().unwrap().clone();
    assert_eq!(ko_updates.len(), 1);
    assert_eq!(ko_updates[0].1, 0.85);
    assert_eq!(
        ko_updates[0].2.as_deref(),
        Some("/body/DocFragment[2]/body/p[2]/text().0")
    );

    assert!(storyteller.updates.lock().unwrap().is_empty());

    let recorded = &fx.state.load_or_default().unwrap()["li_1"];
    assert_eq!(recorded.abs_ts, 70.0);
    assert_eq!(recorded.kosync_pct, 0.85);
    assert_eq!(recorded.storyteller_pct, 0.85);
}

#[tokio::test]
async fn test_storyteller_leads_by_percentage_without_fragment() {
    let fx = Fixture::new();
    let abs = Arc::new(FakeAbs {
        seconds: Mutex::new(5.0),
        ..Default::default()
    });
    let kosync = Arc::new(FakeKoSync {
        percentage: Mutex::new(0.1),
        ..Default::default()
    });
    let storyteller = Arc::new(FakeStoryteller {
        position: Mutex::new(Some(StorytellerPosition {
            percentage: 0.85,
            href: Some("Text/ch1.xhtml".to_string()),
            fragment: Some("no-such-id".to_string()),
            ..Default::default()
        })),
        ..Default::default()
    });

    let engine = fx.engine(services(&abs, &kosync, Some(&storyteller), None));
    assert_eq!(engine.sync_cycle().await.unwrap().synced, 1);

    let abs_updates = abs.updates.lock().unwrap().clone();
    assert_eq!(abs_updates.len(), 1);
    assert!(abs_updates[0].1 > 5.0 && abs_updates[0].1 < 110.0);

    let ko_updates = kosync.updates.lock().unwrap().clone();
    assert_eq!(ko_updates.len(), 1);
    assert_eq!(ko_updates[0].1, 0.85);
}

#[tokio::test]
async fn test_no_movement_is_unchanged() {
    let fx = Fixture::new();
    let mut state = SyncStateDb::new();
    state.insert(
        "li_1".to_string(),
        BookState {
            abs_ts: 70.0,
            abs_pct: 70.0 / 110.0,
            kosync_pct: 0.6,
            storyteller_pct: 0.0,
            last_updated: 123.0,
        },
    );
    fx.state.save(&state).unwrap();

    // 5 s of audio and half a percent of text are below the thresholds
    let abs = Arc::new(FakeAbs {
        seconds: Mutex::new(75.0),
        ..Default::default()
    });
    let kosync = Arc::new(FakeKoSync {
        percentage: Mutex::new(0.605),
        ..Default::default()
    });

    let engine = fx.engine(services(&abs, &kosync, None, None));
    let report = engine.sync_cycle().await.unwrap();

    assert_eq!(report.unchanged, 1);
    assert_eq!(report.synced, 0);
    assert!(abs.updates.lock().unwrap().is_empty());
    assert!(kosync.updates.lock().unwrap().is_empty());

    let recorded = &fx.state.load_or_default().unwrap()["li_1"];
    assert_eq!(recorded.abs_ts, 75.0);
    assert_eq!(recorded.kosync_pct, 0.605);
    assert_eq!(recorded.last_updated, 123.0);
}

#[tokio::test]
async fn test_small_ebook_move_counts_by_characters() {
    let fx = Fixture::new();
    fx.seed_state(5.0, 0.60);

    // Half a percent of an 800 character book is about four characters
    let abs = Arc::new(FakeAbs {
        seconds: Mutex::new(5.0),
        ..Default::default()
    });
    let kosync = Arc::new(FakeKoSync {
        percentage: Mutex::new(0.605),
        ..Default::default()
    });

    let engine = fx.engine(services(&abs, &kosync, None, None));
    assert_eq!(engine.sync_cycle().await.unwrap().unchanged, 1);
    assert!(abs.updates.lock().unwrap().is_empty());

    fx.seed_state(5.0, 0.60);
    let thresholds = SyncConfig {
        delta_kosync_words: 0.5,
        ..Default::default()
    }
    .thresholds();
    let engine = fx.engine_with(services(&abs, &kosync, None, None), thresholds);
    let report = engine.sync_cycle().await.unwrap();

    assert_eq!(report.synced, 1);
    assert_eq!(abs.updates.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_read_failure_skips_mapping() {
    let fx = Fixture::new();
    let abs = Arc::new(FakeAbs {
        seconds: Mutex::new(75.0),
        ..Default::default()
    });
    let kosync = Arc::new(FakeKoSync {
        fail_reads: true,
        ..Default::default()
    });

    let engine = fx.engine(services(&abs, &kosync, None, None));
    let report = engine.sync_cycle().await.unwrap();

    assert_eq!(report.skipped, 1);
    assert!(abs.updates.lock().unwrap().is_empty());
    assert!(fx.state.load_or_default().unwrap().is_empty());
}

#[tokio::test]
async fn test_only_active_mappings_sync() {
    let fx = Fixture::new();
    let mut db = fx.mappings.load_or_default().unwrap();
    db.mappings[0].status = MappingStatus::Pending;
    fx.mappings.save(&db).unwrap();

    let abs = Arc::new(FakeAbs {
        seconds: Mutex::new(75.0),
        ..Default::default()
    });
    let kosync = Arc::new(FakeKoSync::default());

    let engine = fx.engine(services(&abs, &kosync, None, None));
    let report = engine.sync_cycle().await.unwrap();

    assert_eq!(report, Default::default());
    assert!(kosync.updates.lock().unwrap().is_empty());
}

// =============================================================================
// Discovery
// =============================================================================

#[tokio::test]
async fn test_discovery_suggests_matching_ebook() {
    let fx = Fixture::new();
    let abs = Arc::new(FakeAbs {
        in_progress: vec![
            AudiobookItem {
                id: "li_9".to_string(),
                title: "1984".to_string(),
                author: Some("George Orwell".to_string()),
                isbn: None,
            },
            AudiobookItem {
                id: "li_1".to_string(),
                title: "1984".to_string(),
                author: None,
                isbn: None,
            },
            AudiobookItem {
                id: "li_5".to_string(),
                title: "The Left Hand of Darkness".to_string(),
                author: None,
                isbn: None,
            },
        ],
        ..Default::default()
    });
    let kosync = Arc::new(FakeKoSync::default());

    let manager = SuggestionManager::new(
        services(&abs, &kosync, None, None),
        Arc::new(EbookParser::new(&fx.books_dir)),
        fx.suggestions.clone(),
    );

    let mapped: HashSet<String> = ["li_1".to_string()].into_iter().collect();
    assert_eq!(manager.run_discovery_cycle(&mapped).await.unwrap(), 1);

    let db = fx.suggestions.load_or_default().unwrap();
    assert_eq!(db.len(), 1);
    let s = &db["ABS:li_9"];
    assert_eq!(s.state, SuggestionState::Pending);
    assert_eq!(s.source_type, SourceType::Abs);
    assert_eq!(s.match_filename.as_deref(), Some("1984.epub"));

    // Known suggestions are not regenerated
    assert_eq!(manager.run_discovery_cycle(&mapped).await.unwrap(), 0);
}

#[tokio::test]
async fn test_discovery_from_storyteller_activity() {
    let fx = Fixture::new();
    let abs = Arc::new(FakeAbs {
        in_progress: vec![AudiobookItem {
            id: "li_9".to_string(),
            title: "1984".to_string(),
            author: None,
            isbn: None,
        }],
        ..Default::default()
    });
    let kosync = Arc::new(FakeKoSync::default());
    let storyteller = Arc::new(FakeStoryteller {
        recent: vec![StorytellerActivity {
            id: "st-uuid".to_string(),
            title: "1984".to_string(),
            progress: 0.3,
        }],
        ..Default::default()
    });

    let manager = SuggestionManager::new(
        services(&abs, &kosync, Some(&storyteller), None),
        Arc::new(EbookParser::new(&fx.books_dir)),
        fx.suggestions.clone(),
    );

    // li_9 already mapped so only Storyteller could suggest it, and it is skipped too
    let mapped: HashSet<String> = ["li_9".to_string()].into_iter().collect();
    assert_eq!(manager.run_discovery_cycle(&mapped).await.unwrap(), 0);

    let found = manager.run_discovery_cycle(&HashSet::new()).await.unwrap();
    assert_eq!(found, 2);
    let db = fx.suggestions.load_or_default().unwrap();
    let s = &db["STORYTELLER:st-uuid"];
    assert_eq!(s.match_id.as_deref(), Some("li_9"));
    assert_eq!(
        s.mapping_parts(),
        Some(("li_9".to_string(), "1984".to_string(), "1984.epub".to_string()))
    );
}
