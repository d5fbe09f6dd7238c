//! Watcher configuration.
//!
//! All knobs have defaults matching the documented behaviour and can be
//! overridden through `STREAMWATCH_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Consecutive failed reads before a running target is pushed to `Waiting`.
pub const DEFAULT_MAX_FAILS: u32 = 3;

/// Backoff before a `Waiting` target is restarted (5 minutes).
pub const DEFAULT_SECONDS_TO_WAIT: u64 = 300;

/// Delay between retries of a failed read.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 5_000;

/// Delay between successful reads of a running target.
pub const DEFAULT_READ_INTERVAL_SECS: u64 = 60;

/// Watcher tick period.
pub const DEFAULT_TICK_PERIOD_MS: u64 = 1_000;

/// Status snapshot period (10 minutes).
pub const DEFAULT_SNAPSHOT_INTERVAL_SECS: u64 = 600;

/// Maximum queued operations executed per dispatcher batch.
pub const DEFAULT_DISPATCH_BATCH_SIZE: usize = 10;

/// Pause between dispatcher batches.
pub const DEFAULT_DISPATCH_INTERVAL_MS: u64 = 1_000;

/// Time allowed for the work queue to drain on shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;

/// Status history columns kept for the snapshot file.
pub const DEFAULT_HISTORY_LIMIT: usize = 3_600;

/// Environment variable prefix.
const ENV_PREFIX: &str = "STREAMWATCH_";

/// Scheduling, retry and persistence settings for the watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherConfig {
    pub max_fails: u32,
    pub seconds_to_wait: u64,
    pub retry_delay_ms: u64,
    pub read_interval_secs: u64,
    pub tick_period_ms: u64,
    pub snapshot_interval_secs: u64,
    pub dispatch_batch_size: usize,
    pub dispatch_interval_ms: u64,
    pub shutdown_timeout_secs: u64,
    pub history_limit: usize,
    /// Folder holding the persisted target list.
    pub config_folder: String,
    /// Target list file, one `website,channel` per line.
    pub targets_file: String,
    pub status_folder: String,
    pub status_file: String,
    /// Folder receiving one observation log per target.
    pub metrics_folder: String,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            max_fails: DEFAULT_MAX_FAILS,
            seconds_to_wait: DEFAULT_SECONDS_TO_WAIT,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            read_interval_secs: DEFAULT_READ_INTERVAL_SECS,
            tick_period_ms: DEFAULT_TICK_PERIOD_MS,
            snapshot_interval_secs: DEFAULT_SNAPSHOT_INTERVAL_SECS,
            dispatch_batch_size: DEFAULT_DISPATCH_BATCH_SIZE,
            dispatch_interval_ms: DEFAULT_DISPATCH_INTERVAL_MS,
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            history_limit: DEFAULT_HISTORY_LIMIT,
            config_folder: "config".to_string(),
            targets_file: "streams.txt".to_string(),
            status_folder: "debug".to_string(),
            status_file: "status.csv".to_string(),
            metrics_folder: "metrics".to_string(),
        }
    }
}

impl WatcherConfig {
    /// Build a configuration from `STREAMWATCH_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    ///
    /// Absent variables keep their defaults; malformed ones are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |suffix: &str| lookup(&format!("{}{}", ENV_PREFIX, suffix));

        let config = Self {
            max_fails: parse_var(&get, "MAX_FAILS", defaults.max_fails)?,
            seconds_to_wait: parse_var(&get, "SECONDS_TO_WAIT", defaults.seconds_to_wait)?,
            retry_delay_ms: parse_var(&get, "RETRY_DELAY_MS", defaults.retry_delay_ms)?,
            read_interval_secs: parse_var(&get, "READ_INTERVAL_SECS", defaults.read_interval_secs)?,
            tick_period_ms: parse_var(&get, "TICK_PERIOD_MS", defaults.tick_period_ms)?,
            snapshot_interval_secs: parse_var(
                &get,
                "SNAPSHOT_INTERVAL_SECS",
                defaults.snapshot_interval_secs,
            )?,
            dispatch_batch_size: parse_var(
                &get,
                "DISPATCH_BATCH_SIZE",
                defaults.dispatch_batch_size,
            )?,
            dispatch_interval_ms: parse_var(
                &get,
                "DISPATCH_INTERVAL_MS",
                defaults.dispatch_interval_ms,
            )?,
            shutdown_timeout_secs: parse_var(
                &get,
                "SHUTDOWN_TIMEOUT_SECS",
                defaults.shutdown_timeout_secs,
            )?,
            history_limit: parse_var(&get, "HISTORY_LIMIT", defaults.history_limit)?,
            config_folder: get("CONFIG_FOLDER").unwrap_or(defaults.config_folder),
            targets_file: get("TARGETS_FILE").unwrap_or(defaults.targets_file),
            status_folder: get("STATUS_FOLDER").unwrap_or(defaults.status_folder),
            status_file: get("STATUS_FILE").unwrap_or(defaults.status_file),
            metrics_folder: get("METRICS_FOLDER").unwrap_or(defaults.metrics_folder),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would stall or spin the watcher.
    pub fn validate(&self) -> Result<()> {
        if self.max_fails == 0 {
            return Err(Error::config("max_fails must be at least 1"));
        }
        if self.tick_period_ms == 0 {
            return Err(Error::config("tick_period_ms must be greater than zero"));
        }
        if self.dispatch_batch_size == 0 {
            return Err(Error::config("dispatch_batch_size must be greater than zero"));
        }
        if self.dispatch_interval_ms == 0 {
            return Err(Error::config("dispatch_interval_ms must be greater than zero"));
        }
        if self.history_limit == 0 {
            return Err(Error::config("history_limit must be greater than zero"));
        }
        for (name, value) in [
            ("config_folder", &self.config_folder),
            ("targets_file", &self.targets_file),
            ("status_folder", &self.status_folder),
            ("status_file", &self.status_file),
            ("metrics_folder", &self.metrics_folder),
        ] {
            if value.trim().is_empty() {
                return Err(Error::config(format!("{} must not be empty", name)));
            }
        }
        Ok(())
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.seconds_to_wait)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn read_interval(&self) -> Duration {
        Duration::from_secs(self.read_interval_secs)
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Filesystem locations used by the binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    /// Root of the durable store.
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    /// JSON file with per-website reader profiles.
    pub profiles: Option<PathBuf>,
    /// Log filter directive applied over the default after startup.
    pub log_filter: Option<String>,
}

impl AppPaths {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |suffix: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, suffix)).filter(|v| !v.trim().is_empty())
        };

        Self {
            data_dir: get("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data")),
            log_dir: get("LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("logs")),
            profiles: get("PROFILES").map(PathBuf::from),
            log_filter: get("LOG_FILTER"),
        }
    }
}

fn parse_var<T, G>(get: &G, suffix: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(suffix) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e| {
            Error::config(format!("invalid {}{}={:?}: {}", ENV_PREFIX, suffix, raw, e))
        }),
    }
}
