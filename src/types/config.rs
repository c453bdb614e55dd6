//! Configuration structures.
//!
//! Configuration is built from defaults, an optional JSON file, and
//! environment overrides (`KITE_WORKERS`, `KITE_LOG_FORMAT`).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::errors::{Error, Result};

/// Global runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Number of workers. `None` uses the available parallelism.
    #[serde(default)]
    pub workers: Option<usize>,

    /// Runtime tuning.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Parse a configuration from a JSON document.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Load a configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Overlay `KITE_WORKERS` and `KITE_LOG_FORMAT` from the environment.
    pub fn apply_env(mut self) -> Result<Self> {
        if let Ok(raw) = std::env::var("KITE_WORKERS") {
            let workers = raw
                .trim()
                .parse::<usize>()
                .map_err(|e| Error::config(format!("KITE_WORKERS={}: {}", raw, e)))?;
            self.workers = Some(workers);
        }
        if let Ok(format) = std::env::var("KITE_LOG_FORMAT") {
            self.observability.json_logs = format.eq_ignore_ascii_case("json");
        }
        Ok(self)
    }

    /// Resolve the worker count, falling back to the available parallelism.
    pub fn worker_count(&self) -> Result<usize> {
        let count = match self.workers {
            Some(n) => n,
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        };
        if count == 0 {
            return Err(Error::config("worker count must be positive"));
        }
        Ok(count)
    }
}

/// Runtime tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Capacity of the broadcast channel carrying runtime error events.
    pub error_channel_capacity: usize,

    /// Upper bound on waiting for worker threads after shutdown.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            error_channel_capacity: 256,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}
