use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::health::BackoffPolicy;

/// Engine configuration stored at `~/.tally/config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // Transport
    pub request_timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub backoff_jitter: f64,
    /// Full passes over a chain's endpoint list before giving up; 0 retries forever.
    pub max_endpoint_cycles: u32,

    // Balances
    pub evm_poll_interval_secs: u64,
    pub stale_after_secs: u64,
    pub snapshot_channel_capacity: usize,

    // General
    /// `EnvFilter` directives used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
            backoff_jitter: 0.2,
            max_endpoint_cycles: 0,
            evm_poll_interval_secs: 12,
            stale_after_secs: 60,
            snapshot_channel_capacity: 64,
            log_level: crate::logging::DEFAULT_FILTER.into(),
        }
    }
}

impl EngineConfig {
    /// Returns the base directory: `~/.tally/`
    pub fn base_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".tally"))
    }

    /// Returns the config file path: `~/.tally/config.json`
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("config.json"))
    }

    /// Returns the logs directory: `~/.tally/logs/`
    pub fn logs_dir() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("logs"))
    }

    /// Returns the database path: `~/.tally/tally.db`
    pub fn db_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("tally.db"))
    }

    /// Creates `~/.tally/` and its `logs/` subdirectory when absent.
    pub fn ensure_dirs() -> Result<()> {
        for dir in [Self::base_dir()?, Self::logs_dir()?] {
            if !dir.exists() {
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
            }
        }
        Ok(())
    }

    /// Reads `~/.tally/config.json`, writing the defaults there on first run.
    pub fn load() -> Result<Self> {
        Self::ensure_dirs()?;
        let path = Self::config_path()?;
        Self::load_from_path(&path)
    }

    /// Fields missing from the file take their default values.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let config: Self =
                serde_json::from_str(&content).with_context(|| "Failed to parse config.json")?;
            info!(path = %path.display(), "Loaded engine config");
            Ok(config)
        } else {
            let config = Self::default();
            config.save_to_path(path)?;
            info!(path = %path.display(), "Wrote default engine config");
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        self.save_to_path(&path)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    // -- Typed views -------------------------------------------------------

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn evm_poll_interval(&self) -> Duration {
        Duration::from_secs(self.evm_poll_interval_secs.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.backoff_base_ms),
            cap: Duration::from_millis(self.backoff_cap_ms.max(self.backoff_base_ms)),
            jitter: self.backoff_jitter.clamp(0.0, 1.0),
        }
    }

    /// `None` means retry forever.
    pub fn max_endpoint_cycles(&self) -> Option<u32> {
        (self.max_endpoint_cycles > 0).then_some(self.max_endpoint_cycles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_sane_durations() {
        let config = EngineConfig::default();
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.evm_poll_interval(), Duration::from_secs(12));
        assert_eq!(config.stale_after(), Duration::from_secs(60));
        assert_eq!(config.max_endpoint_cycles(), None);
        assert_eq!(config.snapshot_channel_capacity, 64);
    }

    #[test]
    fn missing_file_creates_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        let config = EngineConfig::load_from_path(&path).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(path.exists());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"request_timeout_secs": 5, "max_endpoint_cycles": 3}"#).unwrap();

        let config = EngineConfig::load_from_path(&path).unwrap();
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_endpoint_cycles(), Some(3));
        assert_eq!(config.backoff_base_ms, 500);
    }

    #[test]
    fn save_and_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        let config = EngineConfig {
            stale_after_secs: 5,
            log_level: "debug".into(),
            ..EngineConfig::default()
        };
        config.save_to_path(&path).unwrap();
        assert_eq!(EngineConfig::load_from_path(&path).unwrap(), config);
    }

    #[test]
    fn backoff_policy_cap_never_below_base() {
        let config = EngineConfig {
            backoff_base_ms: 2_000,
            backoff_cap_ms: 100,
            backoff_jitter: 7.0,
            ..EngineConfig::default()
        };
        let policy = config.backoff_policy();
        assert_eq!(policy.cap, Duration::from_millis(2_000));
        assert_eq!(policy.jitter, 1.0);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(EngineConfig::load_from_path(&path).is_err());
    }
}
