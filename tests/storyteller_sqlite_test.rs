//! Storyteller SQLite backend against a scratch database with Storyteller's tables

use rusqlite::Connection;
use serde_json::{json, Value};
use tempfile::TempDir;

use abs_kosync::clients::storyteller::StorytellerDb;
use abs_kosync::clients::StorytellerService;

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

/// `book` and `position` with the columns the backend reads
fn create_db(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("storyteller.db");
    let db = Connection::open(&path).unwrap();
    db.execute_batch(
        "CREATE TABLE book (
            uuid TEXT PRIMARY KEY,
            id INTEGER,
            title TEXT
        );
        CREATE TABLE position (
            uuid TEXT PRIMARY KEY,
            book_uuid TEXT NOT NULL,
            user_id TEXT,
            locator TEXT,
            timestamp INTEGER
        );",
    )
    .unwrap();
    path
}

fn insert_book(path: &std::path::Path, uuid: &str, title: &str) {
    let db = Connection::open(path).unwrap();
    db.execute("INSERT INTO book (uuid, id, title) VALUES (?1, 1, ?2)", [uuid, title])
        .unwrap();
}

fn insert_position(path: &std::path::Path, uuid: &str, book_uuid: &str, locator: &Value, ts: i64) {
    let db = Connection::open(path).unwrap();
    db.execute(
        "INSERT INTO position (uuid, book_uuid, user_id, locator, timestamp) VALUES (?1, ?2, 'u1', ?3, ?4)",
        rusqlite::params![uuid, book_uuid, locator.to_string(), ts],
    )
    .unwrap();
}

fn stored_position(path: &std::path::Path, uuid: &str) -> (Value, i64) {
    let db = Connection::open(path).unwrap();
    db.query_row(
        "SELECT locator, timestamp FROM position WHERE uuid = ?1",
        [uuid],
        |row| {
            let locator: String = row.get(0)?;
            Ok((serde_json::from_str(&locator).unwrap(), row.get(1)?))
        },
    )
    .unwrap()
}

#[tokio::test]
async fn test_reads_latest_position_with_fragment() {
    let dir = TempDir::new().unwrap();
    let path = create_db(&dir);
    insert_book(&path, "b-dune", "Dune");
    insert_position(
        &path,
        "p-old",
        "b-dune",
        &json!({"href": "ch1.xhtml", "locations": {"totalProgression": 0.1}}),
        1_000,
    );
    insert_position(
        &path,
        "p-new",
        "b-dune",
        &json!({"href": "OEBPS/ch4.xhtml#s20", "locations": {"totalProgression": 0.42}}),
        2_000,
    );

    let db = StorytellerDb::open(&path).unwrap();
    db.check_connection().await.unwrap();

    let position = db.get_progress("Dune.epub").await.unwrap().unwrap();
    assert_eq!(position.percentage, 0.42);
    assert_eq!(position.timestamp, Some(2_000));
    assert_eq!(position.href.as_deref(), Some("OEBPS/ch4.xhtml"));
    assert_eq!(position.fragment.as_deref(), Some("s20"));

    assert!(db.get_progress("Emma.epub").await.unwrap().is_none());
}

#[tokio::test]
async fn test_update_leapfrogs_future_timestamp() {
    let dir = TempDir::new().unwrap();
    let path = create_db(&dir);
    insert_book(&path, "b-dune", "Dune");

    // A client pushed a position stamped well into the future
    let future = now_ms() + 3_600_000;
    insert_position(
        &path,
        "p1",
        "b-dune",
        &json!({
            "href": "ch4.xhtml#s20",
            "type": "application/xhtml+xml",
            "locations": {"totalProgression": 0.2, "progression": 0.9, "cssSelector": "#s20"}
        }),
        future,
    );

    let db = StorytellerDb::open(&path).unwrap();
    assert!(db.update_progress("Dune.epub", 0.55).await.unwrap());

    let (locator, ts) = stored_position(&path, "p1");
    assert_eq!(ts, future + 10_000);
    assert_eq!(locator["locations"], json!({"totalProgression": 0.55}));
    assert_eq!(locator["href"], "ch4.xhtml#s20");
}

#[tokio::test]
async fn test_update_skips_tiny_change_and_unknown_book() {
    let dir = TempDir::new().unwrap();
    let path = create_db(&dir);
    insert_book(&path, "b-dune", "Dune");
    insert_position(
        &path,
        "p1",
        "b-dune",
        &json!({"locations": {"totalProgression": 0.5}}),
        5_000,
    );

    let db = StorytellerDb::open(&path).unwrap();
    assert!(db.update_progress("Dune.epub", 0.5004).await.unwrap());
    assert_eq!(stored_position(&path, "p1").1, 5_000);

    assert!(!db.update_progress("Neuromancer.epub", 0.5).await.unwrap());
}

#[tokio::test]
async fn test_recent_activity_filters_old_and_unstarted() {
    let dir = TempDir::new().unwrap();
    let path = create_db(&dir);
    insert_book(&path, "b-dune", "Dune");
    insert_book(&path, "b-emma", "Emma");
    insert_book(&path, "b-old", "Old Book");

    let now = now_ms();
    insert_position(&path, "p1", "b-dune", &json!({"locations": {"totalProgression": 0.3}}), now - 1_000);
    insert_position(&path, "p2", "b-dune", &json!({"locations": {"totalProgression": 0.2}}), now - 2_000);
    insert_position(&path, "p3", "b-emma", &json!({"locations": {"totalProgression": 0.0}}), now - 1_000);
    insert_position(
        &path,
        "p4",
        "b-old",
        &json!({"locations": {"totalProgression": 0.8}}),
        now - 48 * 3_600_000,
    );

    let db = StorytellerDb::open(&path).unwrap();
    let recent = db.get_recent_activity(24, 0.01).await.unwrap();

    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].id, "b-dune");
    assert_eq!(recent[0].title, "Dune");
    assert_eq!(recent[0].progress, 0.3);
}
