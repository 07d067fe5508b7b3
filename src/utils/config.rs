// src/utils/config.rs
//! Recorder configuration
//!
//! Defaults are tuned for a hub writing to a local SQLite file. Values can be
//! overridden from an optional config file and from `HEARTH_RECORDER__*`
//! environment variables.

use crate::utils::errors::{RecorderError, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

fn default_db_url() -> String {
    "sqlite://hearth.db".to_string()
}

fn default_commit_interval_secs() -> u64 {
    1
}

fn default_max_retries() -> u32 {
    10
}

fn default_retry_wait_secs() -> u64 {
    3
}

fn default_max_backlog() -> usize {
    65_000
}

fn default_cache_size() -> usize {
    2048
}

fn default_purge_keep_days() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

/// Recorder configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RecorderConfig {
    /// Database URL (`sqlite://<path>` or a bare file path)
    #[serde(default = "default_db_url")]
    pub db_url: String,

    /// Seconds between batched commits; 0 commits after every event
    #[serde(default = "default_commit_interval_secs")]
    pub commit_interval_secs: u64,

    /// Retry budget for connection setup and transient commit errors
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed wait between retries, in seconds
    #[serde(default = "default_retry_wait_secs")]
    pub retry_wait_secs: u64,

    /// Backlog ceiling; the watchdog stops accepting input past this depth
    #[serde(default = "default_max_backlog")]
    pub max_backlog: usize,

    /// Capacity of the event-data dedup cache
    #[serde(default = "default_cache_size")]
    pub event_data_cache_size: usize,

    /// Capacity of the state-attributes dedup cache
    #[serde(default = "default_cache_size")]
    pub state_attributes_cache_size: usize,

    /// Run a nightly retention purge
    #[serde(default = "default_true")]
    pub auto_purge: bool,

    /// Repack (VACUUM) the store after a completed purge
    #[serde(default)]
    pub auto_repack: bool,

    /// Days of history the nightly purge keeps
    #[serde(default = "default_purge_keep_days")]
    pub purge_keep_days: u32,

    /// Seconds between keep-alive pings; 0 disables (file-backed stores)
    #[serde(default)]
    pub keep_alive_interval_secs: u64,

    /// Event types never recorded
    #[serde(default)]
    pub exclude_event_types: Vec<String>,

    /// Event types recorded when the allow-list is non-empty
    #[serde(default)]
    pub include_event_types: Vec<String>,

    /// Entity ids never recorded
    #[serde(default)]
    pub exclude_entities: Vec<String>,

    /// Entity ids recorded when the allow-list is non-empty
    #[serde(default)]
    pub include_entities: Vec<String>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            db_url: default_db_url(),
            commit_interval_secs: default_commit_interval_secs(),
            max_retries: default_max_retries(),
            retry_wait_secs: default_retry_wait_secs(),
            max_backlog: default_max_backlog(),
            event_data_cache_size: default_cache_size(),
            state_attributes_cache_size: default_cache_size(),
            auto_purge: true,
            auto_repack: false,
            purge_keep_days: default_purge_keep_days(),
            keep_alive_interval_secs: 0,
            exclude_event_types: Vec::new(),
            include_event_types: Vec::new(),
            exclude_entities: Vec::new(),
            include_entities: Vec::new(),
        }
    }
}

impl RecorderConfig {
    /// Load configuration from an optional file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("HEARTH_RECORDER")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(","),
            )
            .build()
            .map_err(|e| RecorderError::Config(e.to_string()))?;

        let cfg: RecorderConfig = settings
            .try_deserialize()
            .map_err(|e| RecorderError::Config(e.to_string()))?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_backlog == 0 {
            return Err(RecorderError::Config("max_backlog must be non-zero".into()));
        }
        if self.event_data_cache_size == 0 || self.state_attributes_cache_size == 0 {
            return Err(RecorderError::Config(
                "dedup cache capacities must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_secs(self.commit_interval_secs)
    }

    /// Whether every ingested event commits immediately
    pub fn commit_synchronously(&self) -> bool {
        self.commit_interval_secs == 0
    }

    pub fn retry_wait(&self) -> Duration {
        Duration::from_secs(self.retry_wait_secs)
    }

    pub fn keep_alive_interval(&self) -> Option<Duration> {
        (self.keep_alive_interval_secs > 0)
            .then(|| Duration::from_secs(self.keep_alive_interval_secs))
    }

    pub fn purge_keep(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.purge_keep_days))
    }
}
