//! Storyteller SQLite backend
//!
//! Storyteller resolves conflicting positions by timestamp and its apps push
//! cached positions back, so a write here must:
//! 1. carry a timestamp at least 10 s ahead of both now and the stored row
//! 2. drop the locator anchors that take precedence over `totalProgression`
//! 3. keep `href` and `type` so the chapter is still known

use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clients::{ClientError, StorytellerActivity, StorytellerPosition, StorytellerService};

/// How far past `max(now, stored)` a written timestamp lands
const LEAPFROG_MS: i64 = 10_000;

/// Changes smaller than this are not written
const MIN_PROGRESS_DELTA: f64 = 0.001;

/// Locator keys that override `totalProgression` when present
const OVERRIDING_ANCHORS: [&str; 4] = ["cssSelector", "fragments", "position", "progression"];

pub struct StorytellerDb {
    path: PathBuf,
    conn: Mutex<Connection>,
}

struct PositionRow {
    uuid: String,
    locator: Value,
    timestamp: i64,
}

fn db_err(e: rusqlite::Error) -> ClientError {
    ClientError::Database(e.to_string())
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Timestamp for a write that must beat every cached client position
pub fn leapfrog_timestamp(now_ms: i64, current_ms: i64) -> i64 {
    now_ms.max(current_ms) + LEAPFROG_MS
}

fn total_progression(locator: &Value) -> f64 {
    locator
        .pointer("/locations/totalProgression")
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}

/// Point a locator at `percentage`. Returns `false` (locator untouched) when
/// the change is too small to be worth writing.
pub fn rewrite_locator(locator: &mut Value, percentage: f64) -> bool {
    if (percentage - total_progression(locator)).abs() < MIN_PROGRESS_DELTA {
        return false;
    }

    if !locator.is_object() {
        *locator = Value::Object(Default::default());
    }
    let Some(root) = locator.as_object_mut() else {
        return false;
    };
    let locations = root
        .entry("locations")
        .or_insert_with(|| Value::Object(Default::default()));
    if !locations.is_object() {
        *locations = Value::Object(Default::default());
    }
    if let Some(locations) = locations.as_object_mut() {
        locations.insert("totalProgression".to_string(), Value::from(percentage));
        for key in OVERRIDING_ANCHORS {
            locations.remove(key);
        }
    }
    true
}

/// Split a locator href into document and element id
fn split_href(locator: &Value) -> (Option<String>, Option<String>) {
    let href = locator.get("href").and_then(Value::as_str).unwrap_or("");
    match href.split_once('#') {
        Some((doc, frag)) => (
            Some(doc.to_string()).filter(|s| !s.is_empty()),
            Some(frag.to_string()).filter(|s| !s.is_empty()),
        ),
        None => (Some(href.to_string()).filter(|s| !s.is_empty()), None),
    }
}

impl StorytellerDb {
    pub fn open(path: &Path) -> Result<Self, ClientError> {
        let conn = Connection::open(path).map_err(db_err)?;
        conn.busy_timeout(std::time::Duration::from_secs(10))
            .map_err(db_err)?;

        // Storyteller itself keeps the database open
        let mode: String = conn
            .query_row("PRAGMA journal_mode=WAL;", [], |row| row.get(0))
            .map_err(db_err)?;
        info!(path = %path.display(), journal_mode = %mode, leapfrog_ms = LEAPFROG_MS, "Opened Storyteller database");

        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, ClientError> {
        self.conn
            .lock()
            .map_err(|_| ClientError::Database("connection lock poisoned".to_string()))
    }

    fn book_uuid(conn: &Connection, ebook_filename: &str) -> Result<Option<String>, ClientError> {
        let stem = Path::new(ebook_filename)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        if stem.is_empty() {
            return Ok(None);
        }

        conn.query_row(
            "SELECT uuid FROM book WHERE title LIKE ?1 LIMIT 1",
            [format!("%{}%", stem)],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }

    fn latest_position(conn: &Connection, book_uuid: &str) -> Result<Option<PositionRow>, ClientError> {
        let row = conn
            .query_row(
                "SELECT uuid, locator, timestamp FROM position
                 WHERE book_uuid = ?1 ORDER BY timestamp DESC LIMIT 1",
                [book_uuid],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;

        Ok(row.map(|(uuid, locator, timestamp)| PositionRow {
            uuid,
            locator: locator
                .and_then(|l| serde_json::from_str(&l).ok())
                .unwrap_or(Value::Null),
            timestamp: timestamp.unwrap_or(0),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl StorytellerService for StorytellerDb {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn check_connection(&self) -> Result<(), ClientError> {
        let conn = self.lock()?;
        let books: i64 = conn
            .query_row("SELECT count(*) FROM book", [], |row| row.get(0))
            .map_err(db_err)?;
        let positions: i64 = conn
            .query_row("SELECT count(*) FROM position", [], |row| row.get(0))
            .map_err(db_err)?;
        info!(books, positions, "Connected to Storyteller database");
        Ok(())
    }

    async fn get_progress(
        &self,
        ebook_filename: &str,
    ) -> Result<Option<StorytellerPosition>, ClientError> {
        let conn = self.lock()?;
        let Some(book_uuid) = Self::book_uuid(&conn, ebook_filename)? else {
            return Ok(None);
        };
        let Some(row) = Self::latest_position(&conn, &book_uuid)? else {
            return Ok(None);
        };
        if row.locator.is_null() {
            return Ok(None);
        }

        let (href, fragment) = split_href(&row.locator);
        Ok(Some(StorytellerPosition {
            percentage: total_progression(&row.locator),
            timestamp: Some(row.timestamp),
            href,
            fragment,
        }))
    }

    async fn update_progress(
        &self,
        ebook_filename: &str,
        percentage: f64,
    ) -> Result<bool, ClientError> {
        let conn = self.lock()?;
        let Some(book_uuid) = Self::book_uuid(&conn, ebook_filename)? else {
            return Ok(false);
        };
        let Some(mut row) = Self::latest_position(&conn, &book_uuid)? else {
            warn!(ebook_filename, "No Storyteller position to update");
            return Ok(false);
        };

        if !rewrite_locator(&mut row.locator, percentage) {
            debug!(ebook_filename, percentage, "Storyteller already at position");
            return Ok(true);
        }

        let new_ts = leapfrog_timestamp(now_ms(), row.timestamp);
        let locator = serde_json::to_string(&row.locator)
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;

        conn.execute(
            "UPDATE position SET locator = ?1, timestamp = ?2 WHERE uuid = ?3",
            rusqlite::params![locator, new_ts, row.uuid],
        )
        .map_err(db_err)?;

        info!(
            ebook_filename,
            percentage,
            timestamp = new_ts,
            leap_ms = new_ts - row.timestamp,
            "Updated Storyteller position"
        );
        Ok(true)
    }

    async fn get_recent_activity(
        &self,
        hours: u64,
        min_progress: f64,
    ) -> Result<Vec<StorytellerActivity>, ClientError> {
        let cutoff = now_ms() - (hours as i64) * 3_600_000;
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare_cached(
                "SELECT b.uuid, b.title, p.locator
                 FROM book b JOIN position p ON b.uuid = p.book_uuid
                 WHERE p.timestamp > ?1 ORDER BY p.timestamp DESC",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map([cutoff], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })
            .map_err(db_err)?;

        let mut seen = std::collections::HashSet::new();
        let mut activity = Vec::new();
        for row in rows {
            let (uuid, title, locator) = row.map_err(db_err)?;
            if seen.contains(&uuid) {
                continue;
            }
            let Some(locator) = locator.and_then(|l| serde_json::from_str::<Value>(&l).ok()) else {
                continue;
            };
            let progress = total_progression(&locator);
            if progress >= min_progress {
                seen.insert(uuid.clone());
                activity.push(StorytellerActivity {
                    id: uuid,
                    title: title.unwrap_or_default(),
                    progress,
                });
            }
        }
        Ok(activity)
    }
}
