//! Engine configuration.
//!
//! Values come from defaults, an optional JSON file, and `MAGMA_*`
//! environment variables, in increasing order of precedence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable naming the worker binary.
pub const WORKER_PATH_ENV: &str = "MAGMA_WORKER_PATH";

/// Environment variable overriding the state directory.
pub const STATE_DIR_ENV: &str = "MAGMA_STATE_DIR";

/// Configuration for the execution engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Root directory for persisted namespaces.
    /// `None` means the platform data directory.
    pub state_dir: Option<PathBuf>,

    /// Explicit path to the `magma-worker` binary.
    pub worker_path: Option<PathBuf>,

    /// Minimum time between two intermediate output rewrites.
    pub refresh_interval_ms: u64,

    /// Receive timeout when polling a worker for messages.
    pub poll_interval_ms: u64,

    /// How long interrupt/restart wait for a killed job to wind down.
    pub join_timeout_ms: u64,

    /// Pause before a delayed job starts executing.
    pub start_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            worker_path: None,
            refresh_interval_ms: 300,
            poll_interval_ms: 10,
            join_timeout_ms: 2000,
            start_delay_ms: 500,
        }
    }
}

impl EngineConfig {
    /// Load a configuration file (JSON). Missing fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `MAGMA_*` environment overrides.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
            self.state_dir = Some(PathBuf::from(dir));
        }
        if let Ok(path) = std::env::var(WORKER_PATH_ENV) {
            self.worker_path = Some(PathBuf::from(path));
        }
        if let Some(ms) = env_millis("MAGMA_REFRESH_MS")? {
            self.refresh_interval_ms = ms;
        }
        if let Some(ms) = env_millis("MAGMA_JOIN_TIMEOUT_MS")? {
            self.join_timeout_ms = ms;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be positive".to_string()));
        }
        if self.join_timeout_ms == 0 {
            return Err(Error::Config("join_timeout_ms must be positive".to_string()));
        }
        Ok(())
    }

    /// The state directory, falling back to the platform data directory.
    pub fn resolve_state_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.state_dir {
            return dir.clone();
        }
        dirs::data_local_dir()
            .map(|d| d.join("magma"))
            .unwrap_or_else(|| PathBuf::from(".magma"))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }
}

fn env_millis(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| Error::Config(format!("{} must be a number of milliseconds: {}", name, e))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.refresh_interval(), Duration::from_millis(300));
        assert_eq!(config.poll_interval(), Duration::from_millis(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_partial() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("magma.json");
        std::fs::write(&path, r#"{ "refresh_interval_ms": 50, "state_dir": "/tmp/ns" }"#).unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.refresh_interval_ms, 50);
        assert_eq!(config.state_dir, Some(PathBuf::from("/tmp/ns")));
        assert_eq!(config.join_timeout_ms, 2000);
    }

    #[test]
    fn test_from_file_rejects_unknown_fields() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("magma.json");
        std::fs::write(&path, r#"{ "refresh": 50 }"#).unwrap();

        assert!(matches!(EngineConfig::from_file(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_poll() {
        let config = EngineConfig {
            poll_interval_ms: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
