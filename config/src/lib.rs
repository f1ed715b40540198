//! Configuration loading, parsing and defaults for relay.
//!
//! Everything is optional in the TOML file; missing fields take the
//! documented defaults. A handful of deployment-specific settings can also
//! be overridden from the environment (`RELAY_RUNTIME_URL`, `RELAY_DB_PATH`,
//! `RELAY_DEFAULT_MODEL`), which wins over the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Runtime configuration for the relay daemon.
///
/// Defaults mirror the behavior of a bare install on a constrained device:
/// conservative cooldowns, aggressive idle unloading, smart batching on.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Base URL of the Ollama-compatible inference runtime.
    pub runtime_url: String,
    /// SQLite database path.
    pub db_path: PathBuf,
    /// Fallback default model (catalog id) when the store has none.
    pub default_model: Option<String>,

    /// Floor between two model activations.
    pub switch_cooldown_secs: u64,
    /// `keep_alive` passed to the runtime so a model stays resident after a
    /// request.
    pub default_keep_alive_secs: u64,
    /// Idle time after which the resident model is unloaded.
    pub inactivity_threshold_secs: u64,
    /// Memory-pressure warning threshold.
    pub ram_critical_percent: u8,
    /// A request running longer than this counts as "long" for the pressure
    /// warning.
    pub long_request_ms: u64,

    /// Catalog sync cadence.
    pub sync_interval_secs: u64,
    /// Auto-unload check cadence.
    pub unload_check_secs: u64,
    /// Stale-job reaper cadence.
    pub reaper_secs: u64,
    /// Terminal-job GC cadence.
    pub gc_interval_secs: u64,
    /// Terminal jobs older than this are purged.
    pub terminal_retention_secs: u64,

    /// Smart batching (prefer jobs matching the resident model). Off means
    /// pure priority + FIFO.
    pub batching_enabled: bool,
    /// Queue-wait bound applied to jobs that don't specify their own.
    pub default_max_wait_secs: u64,

    /// Streaming persistence flush thresholds.
    pub batch_flush_ms: u64,
    pub batch_flush_chars: usize,

    /// Pending jobs older than this fail with a queue timeout.
    pub queue_timeout_secs: u64,
    /// Streaming jobs with no delta for this long fail with a stream timeout.
    pub stream_idle_secs: u64,
    /// Upper bound on a model activation call (large models are slow).
    pub activation_timeout_secs: u64,
    /// Upper bound on an unload call.
    pub unload_timeout_secs: u64,
    /// Upper bound on a model download.
    pub download_timeout_secs: u64,

    /// Readiness poll: initial interval, growth factor, per-poll cap, total
    /// budget.
    pub readiness_interval_secs: u64,
    pub readiness_backoff_factor: f64,
    pub readiness_interval_cap_secs: u64,
    pub readiness_budget_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            runtime_url: "http://127.0.0.1:11434".to_string(),
            db_path: PathBuf::from("relay.db"),
            default_model: None,

            switch_cooldown_secs: 5,
            default_keep_alive_secs: 300,
            inactivity_threshold_secs: 1800,
            ram_critical_percent: 95,
            long_request_ms: 180_000,

            sync_interval_secs: 60,
            unload_check_secs: 30,
            reaper_secs: 60,
            gc_interval_secs: 3600,
            terminal_retention_secs: 3600,

            batching_enabled: true,
            default_max_wait_secs: 120,

            batch_flush_ms: 500,
            batch_flush_chars: 100,

            queue_timeout_secs: 1800,
            stream_idle_secs: 600,
            activation_timeout_secs: 900,
            unload_timeout_secs: 10,
            download_timeout_secs: 3600,

            readiness_interval_secs: 5,
            readiness_backoff_factor: 1.5,
            readiness_interval_cap_secs: 10,
            readiness_budget_secs: 300,
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file, then apply environment overrides.
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            tracing::debug!(path = %path.display(), "No config file; using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("RELAY_RUNTIME_URL")
            && !url.is_empty()
        {
            self.runtime_url = url;
        }
        if let Ok(path) = std::env::var("RELAY_DB_PATH")
            && !path.is_empty()
        {
            self.db_path = PathBuf::from(path);
        }
        if let Ok(model) = std::env::var("RELAY_DEFAULT_MODEL")
            && !model.is_empty()
        {
            self.default_model = Some(model);
        }
    }

    #[must_use]
    pub fn switch_cooldown(&self) -> Duration {
        Duration::from_secs(self.switch_cooldown_secs)
    }

    #[must_use]
    pub fn inactivity_threshold(&self) -> Duration {
        Duration::from_secs(self.inactivity_threshold_secs)
    }

    #[must_use]
    pub fn long_request(&self) -> Duration {
        Duration::from_millis(self.long_request_ms)
    }

    #[must_use]
    pub fn batch_flush_interval(&self) -> Duration {
        Duration::from_millis(self.batch_flush_ms)
    }

    #[must_use]
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_secs)
    }

    #[must_use]
    pub fn stream_idle(&self) -> Duration {
        Duration::from_secs(self.stream_idle_secs)
    }

    #[must_use]
    pub fn activation_timeout(&self) -> Duration {
        Duration::from_secs(self.activation_timeout_secs)
    }

    #[must_use]
    pub fn unload_timeout(&self) -> Duration {
        Duration::from_secs(self.unload_timeout_secs)
    }

    #[must_use]
    pub fn terminal_retention(&self) -> Duration {
        Duration::from_secs(self.terminal_retention_secs)
    }
}
