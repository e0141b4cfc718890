//! Engine configuration.
//!
//! Every field has a serde default so a partial JSON file or an empty
//! environment produces a usable configuration.

use crate::errors::{ConfigurationError, PipegraphError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogConfig {
    /// Default filter directive, overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Configuration for the execution engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// URL workers use to reach the coordinator.
    #[serde(default = "default_coordinator_url")]
    pub coordinator_url: String,
    /// URL of the worker that allocates containers. `None` runs tasks in-process.
    #[serde(default)]
    pub worker_url: Option<String>,
    /// Number of node executions that may hold a worker at once.
    #[serde(default = "default_worker_slots")]
    pub worker_slots: usize,
    /// Parallelism used when a container does not declare one.
    #[serde(default = "default_parallelism")]
    pub default_parallelism: usize,
    /// Minimum interval between persisted job progress updates.
    #[serde(default = "default_job_state_interval_ms")]
    pub job_state_interval_ms: u64,
    /// Console lines kept per job.
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,
    /// Resolutions of one node allowed in a single run.
    #[serde(default = "default_max_resolutions")]
    pub max_resolutions_per_node: usize,
    /// Upper bound on how long a stop request waits for the job to finish.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_seconds: f64,
    /// Interval between container status polls.
    #[serde(default = "default_poll_interval_ms")]
    pub container_poll_interval_ms: u64,
    /// Timeout of a single HTTP request to a worker or container.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: f64,
    /// Logging configuration.
    #[serde(default)]
    pub log: LogConfig,
}

fn default_coordinator_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_worker_slots() -> usize {
    1
}

fn default_parallelism() -> usize {
    1
}

fn default_job_state_interval_ms() -> u64 {
    1000
}

fn default_tail_lines() -> usize {
    1000
}

fn default_max_resolutions() -> usize {
    8
}

fn default_stop_timeout() -> f64 {
    300.0
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_request_timeout() -> f64 {
    60.0
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            coordinator_url: default_coordinator_url(),
            worker_url: None,
            worker_slots: default_worker_slots(),
            default_parallelism: default_parallelism(),
            job_state_interval_ms: default_job_state_interval_ms(),
            tail_lines: default_tail_lines(),
            max_resolutions_per_node: default_max_resolutions(),
            stop_timeout_seconds: default_stop_timeout(),
            container_poll_interval_ms: default_poll_interval_ms(),
            request_timeout_seconds: default_request_timeout(),
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, PipegraphError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Builds a configuration from `PIPEGRAPH_*` environment variables.
    pub fn from_env() -> Result<Self, PipegraphError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PipegraphError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigurationError> {
            value.trim().parse().map_err(|_| {
                ConfigurationError::new(format!("invalid value for {name}: {value:?}"))
            })
        }

        let mut config = Self::default();
        if let Some(v) = lookup("PIPEGRAPH_COORDINATOR_URL") {
            config.coordinator_url = v;
        }
        if let Some(v) = lookup("PIPEGRAPH_WORKER_URL") {
            config.worker_url = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = lookup("PIPEGRAPH_WORKER_SLOTS") {
            config.worker_slots = parse("PIPEGRAPH_WORKER_SLOTS", &v)?;
        }
        if let Some(v) = lookup("PIPEGRAPH_DEFAULT_PARALLELISM") {
            config.default_parallelism = parse("PIPEGRAPH_DEFAULT_PARALLELISM", &v)?;
        }
        if let Some(v) = lookup("PIPEGRAPH_JOB_STATE_INTERVAL_MS") {
            config.job_state_interval_ms = parse("PIPEGRAPH_JOB_STATE_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("PIPEGRAPH_MAX_RESOLUTIONS") {
            config.max_resolutions_per_node = parse("PIPEGRAPH_MAX_RESOLUTIONS", &v)?;
        }
        if let Some(v) = lookup("PIPEGRAPH_STOP_TIMEOUT_SECONDS") {
            config.stop_timeout_seconds = parse("PIPEGRAPH_STOP_TIMEOUT_SECONDS", &v)?;
        }
        if let Some(v) = lookup("PIPEGRAPH_LOG_LEVEL") {
            config.log.level = v;
        }
        if let Some(v) = lookup("PIPEGRAPH_LOG_FORMAT") {
            config.log.format = match v.as_str() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                other => {
                    let msg = format!("unknown log format {other:?}");
                    return Err(ConfigurationError::new(msg).into());
                }
            };
        }
        config.validate()?;
        Ok(config)
    }

    /// Checks values that would make the engine unable to run.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.worker_slots == 0 {
            return Err(ConfigurationError::new("worker_slots must be at least 1"));
        }
        if self.max_resolutions_per_node == 0 {
            return Err(ConfigurationError::new("max_resolutions_per_node must be at least 1"));
        }
        if self.stop_timeout_seconds <= 0.0 {
            return Err(ConfigurationError::new("stop_timeout_seconds must be positive"));
        }
        Ok(())
    }

    /// Sets the worker URL.
    #[must_use]
    pub fn with_worker_url(mut self, url: impl Into<String>) -> Self {
        self.worker_url = Some(url.into());
        self
    }

    /// Sets the number of worker slots.
    #[must_use]
    pub fn with_worker_slots(mut self, slots: usize) -> Self {
        self.worker_slots = slots;
        self
    }

    /// Sets the default container parallelism.
    #[must_use]
    pub fn with_default_parallelism(mut self, parallelism: usize) -> Self {
        self.default_parallelism = parallelism;
        self
    }

    /// Sets the resolution bound.
    #[must_use]
    pub fn with_max_resolutions(mut self, max: usize) -> Self {
        self.max_resolutions_per_node = max;
        self
    }

    /// Sets the stop timeout.
    #[must_use]
    pub fn with_stop_timeout(mut self, seconds: f64) -> Self {
        self.stop_timeout_seconds = seconds;
        self
    }

    /// Job progress persistence interval.
    #[must_use]
    pub fn job_state_interval(&self) -> Duration {
        Duration::from_millis(self.job_state_interval_ms)
    }

    /// Stop timeout as a duration.
    #[must_use]
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.stop_timeout_seconds)
    }

    /// Container status poll interval.
    #[must_use]
    pub fn container_poll_interval(&self) -> Duration {
        Duration::from_millis(self.container_poll_interval_ms)
    }

    /// HTTP request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_seconds)
    }
}
