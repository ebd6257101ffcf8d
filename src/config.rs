//! Config loading and tuning knobs.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Lower clamp for the client debounce window.
pub const DEBOUNCE_MIN_MS: u64 = 50;
/// Upper clamp for the client debounce window.
pub const DEBOUNCE_MAX_MS: u64 = 200;
/// Liveness intervals a connection may stay silent before eviction.
pub const LIVENESS_MISSED_INTERVALS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Client debounce window in milliseconds (clamped to [50, 200]).
    pub debounce_ms: u64,
    /// Server liveness ping interval in seconds.
    pub liveness_interval_secs: u64,
    /// Per-write deadline in milliseconds, server and client.
    pub write_deadline_ms: u64,
    /// Capacity of the client's inbound delivery queue.
    pub inbound_queue_capacity: usize,
    /// First reconnect delay in milliseconds.
    pub backoff_base_ms: u64,
    /// Reconnect delay ceiling in milliseconds.
    pub backoff_max_ms: u64,
    /// Reconnect attempts before the client reports itself degraded.
    pub max_reconnect_attempts: u32,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            liveness_interval_secs: 30,
            write_deadline_ms: 1_000,
            inbound_queue_capacity: 10,
            backoff_base_ms: 1_000,
            backoff_max_ms: 16_000,
            max_reconnect_attempts: 5,
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Effective debounce window: `RIPPLE_DEBOUNCE_MS` overrides the config
    /// value, and the result is clamped to [50, 200] ms.
    pub fn debounce_window(&self) -> Duration {
        let ms = std::env::var("RIPPLE_DEBOUNCE_MS")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(self.debounce_ms);
        Duration::from_millis(ms.clamp(DEBOUNCE_MIN_MS, DEBOUNCE_MAX_MS))
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs)
    }

    /// Idle time after which a silent connection is evicted.
    pub fn liveness_timeout(&self) -> Duration {
        self.liveness_interval() * LIVENESS_MISSED_INTERVALS
    }

    pub fn write_deadline(&self) -> Duration {
        Duration::from_millis(self.write_deadline_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

// =============================================================================
// Logging config
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    #[default]
    Daily,
    Hourly,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log to stderr.
    pub stdout: bool,
    pub stdout_format: LogFormat,
    pub file: FileLoggingConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            stdout_format: LogFormat::default(),
            file: FileLoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    /// Log directory; defaults to the XDG state dir.
    pub dir: Option<PathBuf>,
    pub format: LogFormat,
    pub rotation: LogRotation,
}

// =============================================================================
// Loading
// =============================================================================

pub fn config_path() -> PathBuf {
    crate::paths::config_dir().join("config.toml")
}

pub fn load() -> Result<Config> {
    let path = config_path();
    let contents = fs::read_to_string(&path)
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
    toml::from_str(&contents)
        .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
}

/// Load the config file, falling back to defaults when it is absent.
///
/// A malformed file is reported and ignored rather than aborting startup.
pub fn load_or_default() -> Config {
    if !config_path().exists() {
        return Config::default();
    }
    match load() {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("ignoring config: {e}");
            Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_contract() {
        let config = Config::default();
        assert_eq!(config.debounce_ms, 100);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.liveness_timeout(), Duration::from_secs(90));
        assert_eq!(config.inbound_queue_capacity, 10);
    }

    #[test]
    fn debounce_window_is_clamped() {
        let mut config = Config::default();
        config.debounce_ms = 5;
        assert_eq!(config.debounce_window(), Duration::from_millis(50));
        config.debounce_ms = 10_000;
        assert_eq!(config.debounce_window(), Duration::from_millis(200));
        config.debounce_ms = 120;
        assert_eq!(config.debounce_window(), Duration::from_millis(120));
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: Config = toml::from_str("debounce_ms = 150\n").unwrap();
        assert_eq!(config.debounce_ms, 150);
        assert_eq!(config.backoff_base_ms, 1_000);
        assert!(config.logging.stdout);
    }
}
