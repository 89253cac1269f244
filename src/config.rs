//! Service configuration
//!
//! Loaded from an optional TOML file, then overridden by the environment
//! variables the container deployment has always used (`ABS_SERVER`,
//! `KOSYNC_KEY`, `SYNC_PERIOD_MINS`, ...).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub abs: AbsConfig,
    #[serde(default)]
    pub kosync: KoSyncConfig,
    #[serde(default)]
    pub storyteller: StorytellerConfig,
    #[serde(default)]
    pub hardcover: HardcoverConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub transcribe: TranscribeConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Mapping database, sync state, suggestions and transcripts
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Root of the EPUB library
    #[serde(default = "default_books_dir")]
    pub books_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            books_dir: default_books_dir(),
        }
    }
}

impl PathsConfig {
    pub fn mapping_db(&self) -> PathBuf {
        self.data_dir.join("mapping_db.json")
    }

    pub fn state_file(&self) -> PathBuf {
        self.data_dir.join("last_state.json")
    }

    pub fn suggestions_file(&self) -> PathBuf {
        self.data_dir.join("suggestions.json")
    }
}

/// Audiobookshelf server
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AbsConfig {
    #[serde(default)]
    pub server: String,

    /// API token (Bearer)
    #[serde(default)]
    pub api_key: Option<String>,
}

/// KOReader sync server
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KoSyncConfig {
    #[serde(default)]
    pub server: String,

    #[serde(default)]
    pub user: Option<String>,

    /// Plain password; hashed with MD5 before it goes on the wire
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorytellerConfig {
    #[serde(default)]
    pub api_url: Option<String>,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// SQLite database used when the REST API is not configured
    #[serde(default = "default_storyteller_db")]
    pub db_path: PathBuf,
}

impl Default for StorytellerConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            user: None,
            password: None,
            db_path: default_storyteller_db(),
        }
    }
}

impl StorytellerConfig {
    /// URL, user and password are all required for the REST API
    pub fn api_credentials(&self) -> Option<(&str, &str, &str)> {
        match (&self.api_url, &self.user, &self.password) {
            (Some(url), Some(user), Some(pass))
                if !url.is_empty() && !user.is_empty() && !pass.is_empty() =>
            {
                Some((url.as_str(), user.as_str(), pass.as_str()))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardcoverConfig {
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_hardcover_url")]
    pub api_url: String,
}

impl Default for HardcoverConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_url: default_hardcover_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Minutes between sync cycles
    #[serde(default = "default_sync_period")]
    pub period_mins: u64,

    /// ABS position change (seconds) that counts as movement
    #[serde(default = "default_delta_abs")]
    pub delta_abs_seconds: f64,

    /// KOSync/Storyteller change (percent of book) that counts as movement
    #[serde(default = "default_delta_kosync_percent")]
    pub delta_kosync_percent: f64,

    /// KOSync/Storyteller change (words) that counts as movement
    #[serde(default = "default_delta_kosync_words")]
    pub delta_kosync_words: f64,

    /// Largest backwards jump (percent) a write may make to a service
    #[serde(default = "default_regression_threshold")]
    pub regression_threshold_percent: f64,

    /// Seconds between pending job scans
    #[serde(default = "default_job_interval")]
    pub job_interval_secs: u64,

    /// Minutes between discovery cycles
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_mins: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            period_mins: default_sync_period(),
            delta_abs_seconds: default_delta_abs(),
            delta_kosync_percent: default_delta_kosync_percent(),
            delta_kosync_words: default_delta_kosync_words(),
            regression_threshold_percent: default_regression_threshold(),
            job_interval_secs: default_job_interval(),
            discovery_interval_mins: default_discovery_interval(),
        }
    }
}

/// Thresholds in the units the sync engine compares against
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncThresholds {
    pub abs_seconds: f64,
    /// Fraction of the book (0..1)
    pub progress_fraction: f64,
    /// Characters (five per word)
    pub chars: f64,
    /// Fraction of the book (0..1)
    pub regression_fraction: f64,
}

impl SyncConfig {
    pub fn thresholds(&self) -> SyncThresholds {
        SyncThresholds {
            abs_seconds: self.delta_abs_seconds,
            progress_fraction: self.delta_kosync_percent / 100.0,
            chars: self.delta_kosync_words * 5.0,
            regression_fraction: self.regression_threshold_percent / 100.0,
        }
    }

    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.period_mins.max(1) * 60)
    }

    pub fn job_interval(&self) -> Duration {
        Duration::from_secs(self.job_interval_secs.max(1))
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_mins.max(1) * 60)
    }
}

/// External speech-to-text. The command gets the audio file path appended and
/// must print a JSON array of `{start, end, text}` segments on stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscribeConfig {
    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default = "default_ffprobe")]
    pub ffprobe: String,
}

impl Default for TranscribeConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            ffprobe: default_ffprobe(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_web_port")]
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: default_web_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Pause between starting the daemon and starting the web server
    #[serde(default = "default_startup_delay")]
    pub startup_delay_secs: u64,

    /// How long children get to exit after SIGTERM before SIGKILL
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Overrides `<self> daemon`
    #[serde(default)]
    pub daemon_command: Option<Vec<String>>,

    /// Overrides `<self> web`
    #[serde(default)]
    pub web_command: Option<Vec<String>>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_delay_secs: default_startup_delay(),
            shutdown_grace_secs: default_shutdown_grace(),
            daemon_command: None,
            web_command: None,
        }
    }
}

// Defaults
fn default_data_dir() -> PathBuf { PathBuf::from("/data") }
fn default_books_dir() -> PathBuf { PathBuf::from("/books") }
fn default_storyteller_db() -> PathBuf { PathBuf::from("/storyteller_data/storyteller.db") }
fn default_hardcover_url() -> String { "https://api.hardcover.app/v1/graphql".to_string() }
fn default_sync_period() -> u64 { 5 }
fn default_delta_abs() -> f64 { 60.0 }
fn default_delta_kosync_percent() -> f64 { 1.0 }
fn default_delta_kosync_words() -> f64 { 400.0 }
fn default_regression_threshold() -> f64 { 5.0 }
fn default_job_interval() -> u64 { 60 }
fn default_discovery_interval() -> u64 { 15 }
fn default_ffprobe() -> String { "ffprobe".to_string() }
fn default_web_port() -> u16 { 5757 }
fn default_startup_delay() -> u64 { 5 }
fn default_shutdown_grace() -> u64 { 10 }

/// Values taken from the environment (or the command line) that win over the file
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ConfigOverrides {
    #[arg(long, env = "DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    #[arg(long, env = "BOOKS_DIR", global = true)]
    pub books_dir: Option<PathBuf>,

    #[arg(long, env = "ABS_SERVER", global = true)]
    pub abs_server: Option<String>,

    #[arg(long, env = "ABS_KEY", hide_env_values = true, global = true)]
    pub abs_key: Option<String>,

    #[arg(long, env = "KOSYNC_SERVER", global = true)]
    pub kosync_server: Option<String>,

    #[arg(long, env = "KOSYNC_USER", global = true)]
    pub kosync_user: Option<String>,

    #[arg(long, env = "KOSYNC_KEY", hide_env_values = true, global = true)]
    pub kosync_key: Option<String>,

    #[arg(long, env = "STORYTELLER_API_URL", global = true)]
    pub storyteller_api_url: Option<String>,

    #[arg(long, env = "STORYTELLER_USER", global = true)]
    pub storyteller_user: Option<String>,

    #[arg(long, env = "STORYTELLER_PASSWORD", hide_env_values = true, global = true)]
    pub storyteller_password: Option<String>,

    #[arg(long, env = "STORYTELLER_DB_PATH", global = true)]
    pub storyteller_db_path: Option<PathBuf>,

    #[arg(long, env = "HARDCOVER_TOKEN", hide_env_values = true, global = true)]
    pub hardcover_token: Option<String>,

    #[arg(long, env = "SYNC_PERIOD_MINS", global = true)]
    pub sync_period_mins: Option<u64>,

    #[arg(long, env = "SYNC_DELTA_ABS_SECONDS", global = true)]
    pub sync_delta_abs_seconds: Option<f64>,

    #[arg(long, env = "SYNC_DELTA_KOSYNC_PERCENT", global = true)]
    pub sync_delta_kosync_percent: Option<f64>,

    #[arg(long, env = "SYNC_DELTA_KOSYNC_WORDS", global = true)]
    pub sync_delta_kosync_words: Option<f64>,

    #[arg(long, env = "SYNC_REGRESSION_THRESHOLD", global = true)]
    pub sync_regression_threshold: Option<f64>,

    /// Transcription command line, split on whitespace
    #[arg(long, env = "TRANSCRIBE_COMMAND", global = true)]
    pub transcribe_command: Option<String>,

    #[arg(long, env = "WEB_PORT", global = true)]
    pub web_port: Option<u16>,
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("{0} is not configured")]
    Missing(&'static str),
}

impl Config {
    /// Load the config file, or defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_overrides(&mut self, o: ConfigOverrides) {
        if let Some(v) = o.data_dir { self.paths.data_dir = v; }
        if let Some(v) = o.books_dir { self.paths.books_dir = v; }
        if let Some(v) = o.abs_server { self.abs.server = v; }
        if let Some(v) = o.abs_key { self.abs.api_key = Some(v); }
        if let Some(v) = o.kosync_server { self.kosync.server = v; }
        if let Some(v) = o.kosync_user { self.kosync.user = Some(v); }
        if let Some(v) = o.kosync_key { self.kosync.key = Some(v); }
        if let Some(v) = o.storyteller_api_url { self.storyteller.api_url = Some(v); }
        if let Some(v) = o.storyteller_user { self.storyteller.user = Some(v); }
        if let Some(v) = o.storyteller_password { self.storyteller.password = Some(v); }
        if let Some(v) = o.storyteller_db_path { self.storyteller.db_path = v; }
        if let Some(v) = o.hardcover_token { self.hardcover.token = Some(v); }
        if let Some(v) = o.sync_period_mins { self.sync.period_mins = v; }
        if let Some(v) = o.sync_delta_abs_seconds { self.sync.delta_abs_seconds = v; }
        if let Some(v) = o.sync_delta_kosync_percent { self.sync.delta_kosync_percent = v; }
        if let Some(v) = o.sync_delta_kosync_words { self.sync.delta_kosync_words = v; }
        if let Some(v) = o.sync_regression_threshold { self.sync.regression_threshold_percent = v; }
        if let Some(v) = o.transcribe_command {
            self.transcribe.command = v.split_whitespace().map(str::to_string).collect();
        }
        if let Some(v) = o.web_port { self.web.port = v; }
    }

    /// The daemon cannot do anything without both progress servers
    pub fn validate_for_daemon(&self) -> Result<(), ConfigError> {
        if self.abs.server.trim().is_empty() {
            return Err(ConfigError::Missing("ABS_SERVER"));
        }
        if self.kosync.server.trim().is_empty() {
            return Err(ConfigError::Missing("KOSYNC_SERVER"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds_convert_units() {
        let sync = SyncConfig::default();
        let t = sync.thresholds();
        assert_eq!(t.abs_seconds, 60.0);
        assert!((t.progress_fraction - 0.01).abs() < 1e-12);
        assert_eq!(t.chars, 2000.0);
        assert!((t.regression_fraction - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_overrides_win_over_file() {
        let mut config: Config = toml::from_str(
            r#"
[abs]
server = "http://file-abs"

[sync]
period_mins = 10
"#,
        )
        .unwrap();

        config.apply_overrides(ConfigOverrides {
            abs_server: Some("http://env-abs".to_string()),
            transcribe_command: Some("whisper-json --model tiny".to_string()),
            ..Default::default()
        });

        assert_eq!(config.abs.server, "http://env-abs");
        assert_eq!(config.sync.period_mins, 10);
        assert_eq!(config.transcribe.command, vec!["whisper-json", "--model", "tiny"]);
        assert_eq!(config.web.port, 5757);
    }

    #[test]
    fn test_daemon_requires_servers() {
        let mut config = Config::default();
        assert!(matches!(
            config.validate_for_daemon(),
            Err(ConfigError::Missing("ABS_SERVER"))
        ));

        config.abs.server = "http://abs".to_string();
        config.kosync.server = "http://kosync".to_string();
        assert!(config.validate_for_daemon().is_ok());
    }

    #[test]
    fn test_storyteller_api_needs_all_credentials() {
        let mut st = StorytellerConfig {
            api_url: Some("http://st".to_string()),
            user: Some("reader".to_string()),
            ..Default::default()
        };
        assert!(st.api_credentials().is_none());

        st.password = Some("secret".to_string());
        assert_eq!(st.api_credentials(), Some(("http://st", "reader", "secret")));
    }
}
