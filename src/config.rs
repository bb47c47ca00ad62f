//! Configuration loader and validator for the media server → tracker relay.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::error::ErrorKind;
use crate::retry::RetryConfig;
use crate::router::{TranslationPolicy, DEFAULT_COMPLETION_THRESHOLD};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub app: App,
    #[serde(default)]
    pub pipeline: Pipeline,
    #[serde(default)]
    pub retry: Retry,
    pub tracker: Tracker,
    pub users: Vec<User>,
}

/// HTTP server and history settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct App {
    pub port: u16,
    pub history_size: usize,
    pub shutdown_grace_seconds: u64,
}

impl Default for App {
    fn default() -> Self {
        Self {
            port: 9001,
            history_size: crate::history::DEFAULT_MAX_EVENTS,
            shutdown_grace_seconds: 15,
        }
    }
}

/// Debounce and queueing knobs shared by every worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Pipeline {
    pub debounce_ms: u64,
    pub queue_capacity: usize,
    pub completion_threshold: f64,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            debounce_ms: 5_000,
            queue_capacity: crate::worker::DEFAULT_QUEUE_CAPACITY,
            completion_threshold: DEFAULT_COMPLETION_THRESHOLD,
        }
    }
}

/// Longest accepted `pipeline.debounce_ms` (one hour).
pub const MAX_DEBOUNCE_MS: u64 = 60 * 60 * 1000;

impl Pipeline {
    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Backoff policy for tracker operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Retry {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub retryable_kinds: Vec<ErrorKind>,
    pub non_retryable_kinds: Vec<ErrorKind>,
}

impl Default for Retry {
    fn default() -> Self {
        let d = RetryConfig::default();
        Self {
            max_attempts: d.max_attempts,
            initial_delay_ms: d.initial_delay.as_millis() as u64,
            max_delay_ms: d.max_delay.as_millis() as u64,
            backoff_factor: d.backoff_factor,
            retryable_kinds: d.retryable_kinds,
            non_retryable_kinds: d.non_retryable_kinds,
        }
    }
}

impl Retry {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_factor: self.backoff_factor,
            retryable_kinds: self.retryable_kinds.clone(),
            non_retryable_kinds: self.non_retryable_kinds.clone(),
        }
    }
}

/// Tracker service endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tracker {
    pub base_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_request_timeout() -> u64 {
    30
}

/// One person: their tracker login plus the media-server identities that
/// route to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub tracker: TrackerAccount,
    #[serde(default)]
    pub emby: Option<EmbyUser>,
    #[serde(default)]
    pub plex: Option<PlexUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackerAccount {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub log_films: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmbyUser {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlexUser {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub id: String,
}

impl Config {
    pub fn policy_for(&self, account: &TrackerAccount) -> TranslationPolicy {
        TranslationPolicy {
            log_films: account.log_films,
            completion_threshold: self.pipeline.completion_threshold,
        }
    }

    /// Apply command-line (or `PORT` / `HISTORY_SIZE` environment) values
    /// over the file. A zero history size is ignored.
    pub fn apply_overrides(&mut self, port: Option<u16>, history_size: Option<usize>) {
        if let Some(port) = port {
            self.app.port = port;
        }
        if let Some(size) = history_size.filter(|s| *s > 0) {
            self.app.history_size = size;
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.port == 0 {
        return Err(ConfigError::Invalid("app.port must be > 0"));
    }
    if cfg.pipeline.debounce_ms > MAX_DEBOUNCE_MS {
        return Err(ConfigError::Invalid(
            "pipeline.debounce_ms must be <= 3600000 (one hour)",
        ));
    }
    if cfg.pipeline.queue_capacity == 0 {
        return Err(ConfigError::Invalid("pipeline.queue_capacity must be > 0"));
    }
    let threshold = cfg.pipeline.completion_threshold;
    if !(threshold > 0.0 && threshold <= 1.0) {
        return Err(ConfigError::Invalid(
            "pipeline.completion_threshold must be in (0, 1]",
        ));
    }

    if cfg.retry.max_attempts == 0 {
        return Err(ConfigError::Invalid("retry.max_attempts must be > 0"));
    }
    if !(cfg.retry.backoff_factor >= 1.0) {
        return Err(ConfigError::Invalid("retry.backoff_factor must be >= 1.0"));
    }
    if cfg.retry.max_delay_ms < cfg.retry.initial_delay_ms {
        return Err(ConfigError::Invalid(
            "retry.max_delay_ms must be >= retry.initial_delay_ms",
        ));
    }

    if cfg.tracker.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("tracker.base_url must be non-empty"));
    }
    if cfg.tracker.request_timeout_seconds == 0 {
        return Err(ConfigError::Invalid(
            "tracker.request_timeout_seconds must be > 0",
        ));
    }

    if cfg.users.is_empty() {
        return Err(ConfigError::Invalid("users must list at least one user"));
    }
    for user in &cfg.users {
        if user.tracker.username.trim().is_empty() {
            return Err(ConfigError::Invalid("users[].tracker.username must be non-empty"));
        }
        if user.tracker.password.is_empty() {
            return Err(ConfigError::Invalid("users[].tracker.password must be non-empty"));
        }
        if let Some(emby) = &user.emby {
            if emby.username.trim().is_empty() {
                return Err(ConfigError::Invalid("users[].emby.username must be non-empty"));
            }
        }
        if let Some(plex) = &user.plex {
            if plex.username.trim().is_empty() && plex.id.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "users[].plex needs a username or an id",
                ));
            }
        }
        if user.emby.is_none() && user.plex.is_none() {
            return Err(ConfigError::Invalid(
                "users[] must link an emby or plex identity",
            ));
        }
    }

    Ok(())
}

/// Returns a sample configuration document.
pub fn example() -> &'static str {
    r#"app:
  port: 9001
  history_size: 100
  shutdown_grace_seconds: 15

pipeline:
  debounce_ms: 5000
  queue_capacity: 10
  completion_threshold: 0.9

retry:
  max_attempts: 3
  initial_delay_ms: 500
  max_delay_ms: 10000
  backoff_factor: 2.0
  retryable_kinds: [network, timeout]
  non_retryable_kinds: [auth]

tracker:
  base_url: "https://tracker.example.com/"
  request_timeout_seconds: 30

users:
  - tracker:
      username: "alice"
      password: "YOUR_TRACKER_PASSWORD"
      log_films: true
    plex:
      username: "alice"
      id: "42"
    emby:
      username: "alice"
  - tracker:
      username: "bob"
      password: "YOUR_TRACKER_PASSWORD"
    plex:
      username: "bob"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn example_config() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    #[test]
    fn parse_example_ok() {
        let cfg = example_config();
        validate(&cfg).unwrap();
        assert_eq!(cfg.users.len(), 2);
        assert!(cfg.users[0].tracker.log_films);
        assert!(!cfg.users[1].tracker.log_films);
        assert_eq!(cfg.users[0].plex.as_ref().unwrap().id, "42");
        assert!(cfg.users[1].emby.is_none());
    }

    #[test]
    fn sections_default_when_missing() {
        let yaml = r#"
tracker:
  base_url: "https://tracker.example.com/"
users:
  - tracker: { username: "alice", password: "pw" }
    emby: { username: "alice" }
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.app, App::default());
        assert_eq!(cfg.pipeline, Pipeline::default());
        assert_eq!(cfg.retry.to_retry_config(), RetryConfig::default());
        assert_eq!(cfg.tracker.request_timeout_seconds, 30);
        assert_eq!(cfg.pipeline.quiet_period(), Duration::from_secs(5));
    }

    #[test]
    fn retry_section_maps_to_policy() {
        let cfg = example_config();
        let retry = cfg.retry.to_retry_config();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.initial_delay, Duration::from_millis(500));
        assert_eq!(retry.max_delay, Duration::from_secs(10));
        assert_eq!(retry.retryable_kinds, vec![ErrorKind::Network, ErrorKind::Timeout]);
        assert_eq!(retry.non_retryable_kinds, vec![ErrorKind::Auth]);
    }

    #[test]
    fn invalid_threshold() {
        let mut cfg = example_config();
        cfg.pipeline.completion_threshold = 0.0;
        match validate(&cfg).unwrap_err() {
            ConfigError::Invalid(msg) => assert!(msg.contains("completion_threshold")),
            _ => panic!("wrong error"),
        }
        cfg.pipeline.completion_threshold = 1.5;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_users() {
        let mut cfg = example_config();
        cfg.users.clear();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_config();
        cfg.users[0].tracker.username = " ".into();
        match validate(&cfg).unwrap_err() {
            ConfigError::Invalid(msg) => assert!(msg.contains("tracker.username")),
            _ => panic!("wrong error"),
        }

        let mut cfg = example_config();
        cfg.users[1].plex = None;
        match validate(&cfg).unwrap_err() {
            ConfigError::Invalid(msg) => assert!(msg.contains("emby or plex")),
            _ => panic!("wrong error"),
        }

        let mut cfg = example_config();
        cfg.users[1].plex = Some(PlexUser {
            username: "".into(),
            id: "".into(),
        });
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn debounce_is_capped_at_one_hour() {
        let mut cfg = example_config();
        cfg.pipeline.debounce_ms = MAX_DEBOUNCE_MS;
        validate(&cfg).unwrap();

        cfg.pipeline.debounce_ms = MAX_DEBOUNCE_MS + 1;
        match validate(&cfg).unwrap_err() {
            ConfigError::Invalid(msg) => assert!(msg.contains("debounce_ms")),
            _ => panic!("wrong error"),
        }

        cfg.pipeline.debounce_ms = u64::MAX;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn overrides_replace_file_values() {
        let mut cfg = example_config();
        cfg.apply_overrides(None, None);
        assert_eq!(cfg.app.port, 9001);
        assert_eq!(cfg.app.history_size, 100);

        cfg.apply_overrides(Some(8080), Some(250));
        assert_eq!(cfg.app.port, 8080);
        assert_eq!(cfg.app.history_size, 250);

        cfg.apply_overrides(None, Some(0));
        assert_eq!(cfg.app.history_size, 250);
    }

    #[test]
    fn invalid_retry_and_tracker() {
        let mut cfg = example_config();
        cfg.retry.max_attempts = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_config();
        cfg.retry.max_delay_ms = 10;
        match validate(&cfg).unwrap_err() {
            ConfigError::Invalid(msg) => assert!(msg.contains("max_delay_ms")),
            _ => panic!("wrong error"),
        }

        let mut cfg = example_config();
        cfg.tracker.base_url = "".into();
        match validate(&cfg).unwrap_err() {
            ConfigError::Invalid(msg) => assert!(msg.contains("tracker.base_url")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn policy_follows_account_preference() {
        let cfg = example_config();
        let policy = cfg.policy_for(&cfg.users[0].tracker);
        assert!(policy.log_films);
        assert_eq!(policy.completion_threshold, 0.9);
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.app.port, 9001);
        assert_eq!(cfg.users[0].tracker.username, "alice");
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let td = tempdir().unwrap();
        let err = load(Some(&td.path().join("nope.yaml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
