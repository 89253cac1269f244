//! Config file loading integration tests

use std::time::Duration;

use abs_kosync::config::{Config, ConfigError};
use tempfile::TempDir;

#[test]
fn test_missing_file_gives_defaults() {
    let dir = TempDir::new().unwrap();
    let config = Config::load(&dir.path().join("absent.toml")).unwrap();

    assert_eq!(config.paths.data_dir.to_str(), Some("/data"));
    assert_eq!(config.paths.books_dir.to_str(), Some("/books"));
    assert_eq!(config.web.port, 5757);
    assert_eq!(config.sync.sync_period(), Duration::from_secs(300));
    assert_eq!(config.supervisor.startup_delay_secs, 5);
    assert!(config.supervisor.daemon_command.is_none());
    assert!(config.hardcover.token.is_none());
}

#[test]
fn test_full_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("abs-kosync.toml");
    std::fs::write(
        &path,
        r#"
[paths]
data_dir = "/srv/abs-kosync"
books_dir = "/srv/books"

[abs]
server = "http://abs.local"
api_key = "token"

[kosync]
server = "http://kosync.local"
user = "reader"
key = "secret"

[storyteller]
api_url = "http://storyteller.local"
user = "reader"
password = "pw"

[sync]
period_mins = 2
delta_kosync_words = 100
job_interval_secs = 30

[transcribe]
command = ["whisper-json", "--model", "small"]

[web]
port = 8080

[supervisor]
startup_delay_secs = 1
daemon_command = ["abs-kosync", "daemon"]
"#,
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.paths.mapping_db().to_str(), Some("/srv/abs-kosync/mapping_db.json"));
    assert_eq!(config.abs.api_key.as_deref(), Some("token"));
    assert_eq!(config.kosync.user.as_deref(), Some("reader"));
    assert!(config.storyteller.api_credentials().is_some());
    assert_eq!(config.sync.sync_period(), Duration::from_secs(120));
    assert_eq!(config.sync.thresholds().chars, 500.0);
    assert_eq!(config.sync.job_interval(), Duration::from_secs(30));
    // Unset keys in a present section keep their defaults
    assert_eq!(config.sync.delta_abs_seconds, 60.0);
    assert_eq!(config.transcribe.command.len(), 3);
    assert_eq!(config.transcribe.ffprobe, "ffprobe");
    assert_eq!(config.web.port, 8080);
    assert_eq!(config.supervisor.startup_delay_secs, 1);
    assert_eq!(config.supervisor.shutdown_grace_secs, 10);
    assert_eq!(
        config.supervisor.daemon_command,
        Some(vec!["abs-kosync".to_string(), "daemon".to_string()])
    );
    assert!(config.validate_for_daemon().is_ok());
}

#[test]
fn test_invalid_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "[web]\nport = \"not a number\"\n").unwrap();

    let err = Config::load(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }));
    assert!(err.to_string().contains("bad.toml"));
}

#[test]
fn test_zero_intervals_are_clamped() {
    let config: Config = toml::from_str("[sync]\nperiod_mins = 0\njob_interval_secs = 0\n").unwrap();
    assert_eq!(config.sync.sync_period(), Duration::from_secs(60));
    assert_eq!(config.sync.job_interval(), Duration::from_secs(1));
}
