//! Engine configuration, loadable from TOML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Process-wide engine tunables.
///
/// All durations are expressed in milliseconds so the config stays flat
/// and TOML-friendly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Grace period a worker gets to acknowledge a cancellation request
    /// before the task is forced to `Failed`
    pub cancel_grace_ms: u64,

    /// How long the brain waits for in-flight tasks while draining
    pub drain_timeout_ms: u64,

    /// Bounded debug-history ring kept by the event engine
    pub event_history_limit: usize,

    /// Where the catalog persists its artifact index and task history.
    /// `None` disables persistence.
    pub persist_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cancel_grace_ms: 5_000,
            drain_timeout_ms: 30_000,
            event_history_limit: 256,
            persist_path: None,
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(String),
    #[error("could not parse config: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert!(config.cancel_grace_ms > 0);
        assert!(config.drain_timeout_ms > 0);
        assert!(config.event_history_limit > 0);
        assert!(config.persist_path.is_none());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config = EngineConfig::from_toml_str("cancel_grace_ms = 250\n").expect("parse");
        assert_eq!(config.cancel_grace(), Duration::from_millis(250));
        assert_eq!(
            config.drain_timeout_ms,
            EngineConfig::default().drain_timeout_ms
        );
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        let err = EngineConfig::from_toml_str("cancel_grace_ms = \"fast\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
