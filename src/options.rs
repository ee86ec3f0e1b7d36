//! Runtime and source configuration.
//!
//! Precedence (highest to lowest):
//! 1. Environment variables (`REPORT_*`)
//! 2. TOML config file
//! 3. Default values
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Whether one permanently failed lookup fails the whole report.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Failed lookups are counted in the `error` bucket and the run completes.
    #[default]
    ContinueWithErrorBucket,
    /// The first recorded lookup failure fails the run.
    FailOnAnyActivityFailure,
}

impl std::str::FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "continue_with_error_bucket" | "continue" => Ok(FailurePolicy::ContinueWithErrorBucket),
            "fail_on_any_activity_failure" | "strict" => Ok(FailurePolicy::FailOnAnyActivityFailure),
            other => Err(format!("unknown failure policy: {other}")),
        }
    }
}

/// Bounded exponential backoff for transient activity failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Knobs for the engine, the worker pool and the instance lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeOptions {
    /// Records requested from the batch source per run.
    pub max_records: usize,
    /// Upper bound on activities executing at once across all instances.
    pub max_concurrent_activities: usize,
    pub fetch_retry: RetryPolicy,
    pub activity_retry: RetryPolicy,
    pub failure_policy: FailurePolicy,
    /// Lifetime of an instance lease; drivers renew it every turn.
    pub lease_ttl_ms: u64,
    /// Idle time after which a driver releases its instance.
    pub idle_dehydrate_ms: u64,
    pub poller_idle_sleep_ms: u64,
    /// Maximum number of log entries per instance.
    pub history_cap: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_records: 100,
            max_concurrent_activities: 16,
            fetch_retry: RetryPolicy {
                max_attempts: 5,
                ..RetryPolicy::default()
            },
            activity_retry: RetryPolicy::default(),
            failure_policy: FailurePolicy::default(),
            lease_ttl_ms: 30_000,
            idle_dehydrate_ms: 1_000,
            poller_idle_sleep_ms: 10,
            history_cap: 4_096,
        }
    }
}

impl RuntimeOptions {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn idle_dehydrate(&self) -> Duration {
        Duration::from_millis(self.idle_dehydrate_ms)
    }

    pub fn poller_idle_sleep(&self) -> Duration {
        Duration::from_millis(self.poller_idle_sleep_ms)
    }
}

/// Location of the transaction data store, handed to the batch source at construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SourceConfig {
    pub endpoint: String,
    pub database: String,
    pub collection: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            endpoint: "./data".to_string(),
            database: "store".to_string(),
            collection: "orders".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {var}: {value}")]
    InvalidEnv { var: String, value: String },
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReportConfig {
    pub runtime: RuntimeOptions,
    pub source: SourceConfig,
}

impl ReportConfig {
    /// Load from an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::load_from_file(p)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        debug!(?config, "loaded report configuration");
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `REPORT_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    pub(crate) fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        fn parsed<T: std::str::FromStr>(var: &str, value: String) -> Result<T, ConfigError> {
            value
                .parse()
                .map_err(|_| ConfigError::InvalidEnv { var: var.to_string(), value })
        }

        if let Some(v) = lookup("REPORT_SOURCE_ENDPOINT") {
            self.source.endpoint = v;
        }
        if let Some(v) = lookup("REPORT_SOURCE_DATABASE") {
            self.source.database = v;
        }
        if let Some(v) = lookup("REPORT_SOURCE_COLLECTION") {
            self.source.collection = v;
        }
        if let Some(v) = lookup("REPORT_MAX_RECORDS") {
            self.runtime.max_records = parsed("REPORT_MAX_RECORDS", v)?;
        }
        if let Some(v) = lookup("REPORT_MAX_CONCURRENT_ACTIVITIES") {
            self.runtime.max_concurrent_activities = parsed("REPORT_MAX_CONCURRENT_ACTIVITIES", v)?;
        }
        if let Some(v) = lookup("REPORT_FAILURE_POLICY") {
            self.runtime.failure_policy = parsed("REPORT_FAILURE_POLICY", v)?;
        }
        if let Some(v) = lookup("REPORT_LEASE_TTL_MS") {
            self.runtime.lease_ttl_ms = parsed("REPORT_LEASE_TTL_MS", v)?;
        }
        if let Some(v) = lookup("REPORT_IDLE_DEHYDRATE_MS") {
            self.runtime.idle_dehydrate_ms = parsed("REPORT_IDLE_DEHYDRATE_MS", v)?;
        }
        if let Some(v) = lookup("REPORT_HISTORY_CAP") {
            self.runtime.history_cap = parsed("REPORT_HISTORY_CAP", v)?;
        }
        Ok(())
    }
}
