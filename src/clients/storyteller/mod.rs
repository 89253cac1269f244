//! Storyteller access
//!
//! Backend selection:
//! 1. REST API when URL, user and password are set and a token can be issued
//! 2. Direct SQLite access when the database file exists
//! 3. Otherwise Storyteller is disabled

pub mod api;
pub mod sqlite;

use regex::Regex;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

use super::StorytellerService;
use crate::config::StorytellerConfig;

pub use api::StorytellerApiClient;
pub use sqlite::StorytellerDb;

/// Pick the best available backend
pub async fn connect(config: &StorytellerConfig) -> Option<Arc<dyn StorytellerService>> {
    if let Some((url, user, password)) = config.api_credentials() {
        let client = StorytellerApiClient::new(url, user, password);
        match client.check_connection().await {
            Ok(()) => {
                info!(url, "Using Storyteller REST API");
                return Some(Arc::new(client));
            }
            Err(e) => warn!(error = %e, "Storyteller API authentication failed, trying SQLite"),
        }
    }

    if !config.db_path.exists() {
        info!(path = %config.db_path.display(), "Storyteller not configured");
        return None;
    }

    match StorytellerDb::open(&config.db_path) {
        Ok(db) => {
            info!(path = %config.db_path.display(), "Using Storyteller SQLite database");
            Some(Arc::new(db))
        }
        Err(e) => {
            warn!(error = %e, "Storyteller database unavailable");
            None
        }
    }
}

/// Lowercased filename stem without a trailing `(...)` or `[...]` tag
pub(crate) fn clean_stem(ebook_filename: &str) -> String {
    static TRAILING_TAG: OnceLock<Regex> = OnceLock::new();
    let re = TRAILING_TAG
        .get_or_init(|| Regex::new(r"\s*(\([^)]*\)|\[[^\]]*\])\s*$").expect("valid tag regex"));

    let stem = Path::new(ebook_filename)
        .file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    let once = re.replace(&stem, "").into_owned();
    re.replace(&once, "").trim().to_string()
}

/// Index of the title matching an ebook filename: exact, then containment
/// either way, then 70% word overlap
pub(crate) fn match_title<'a, I>(ebook_filename: &str, titles: I) -> Option<usize>
where
    I: IntoIterator<Item = &'a str>,
{
    let stem = clean_stem(ebook_filename);
    if stem.is_empty() {
        return None;
    }
    let titles: Vec<String> = titles.into_iter().map(str::to_lowercase).collect();

    if let Some(i) = titles.iter().position(|t| *t == stem) {
        return Some(i);
    }
    if let Some(i) = titles
        .iter()
        .position(|t| !t.is_empty() && (t.contains(&stem) || stem.contains(t.as_str())))
    {
        return Some(i);
    }

    let stem_words: std::collections::HashSet<&str> = stem.split_whitespace().collect();
    titles.iter().position(|t| {
        let words: std::collections::HashSet<&str> = t.split_whitespace().collect();
        let common = stem_words.intersection(&words).count();
        common > 0 && common as f64 >= stem_words.len().min(words.len()) as f64 * 0.7
    })
}
