use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 3000;
pub const DEFAULT_MAX_WORKERS: usize = 1;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Top-level config (gutpunch.toml + GUTPUNCH_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GutPunchConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Poll loop and worker pool tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Delay between poll ticks.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on handlers executing at the same time. Zero is treated as one.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Per-job execution deadline. Unset means handlers may run indefinitely.
    #[serde(default)]
    pub job_timeout_ms: Option<u64>,
    /// `max_retries` given to jobs that don't specify their own.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Minimum time a FAILED job waits before it is put back to PENDING.
    #[serde(default)]
    pub retry_delay_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_workers: DEFAULT_MAX_WORKERS,
            job_timeout_ms: None,
            default_max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_secs: 0,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_ms.map(Duration::from_millis)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.gutpunch/gutpunch.db", home)
}

impl GutPunchConfig {
    /// Load config from a TOML file with GUTPUNCH_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `GUTPUNCH_SCHEDULER__MAX_WORKERS=4`. A missing file is not an error;
    /// every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: GutPunchConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("GUTPUNCH_").split("__"))
            .extract()
            .map_err(|e| crate::error::GutPunchError::Config(e.to_string()))?;

        tracing::debug!(path = %path, "configuration loaded");
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.gutpunch/gutpunch.toml", home)
}
