//! Engine settings

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings shared by every session the service opens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-command timeout when a request leaves it at zero
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Timeout for `cd`, `export` and host probes
    #[serde(default = "default_internal_timeout_ms")]
    pub internal_timeout_ms: u64,
    /// Directory holding `<name>.json` credential files
    #[serde(default = "default_secret_dir")]
    pub secret_dir: PathBuf,
    /// Terminators added to every read
    #[serde(default)]
    pub default_terminators: Vec<String>,
}

fn default_timeout_ms() -> u64 {
    20_000
}

fn default_internal_timeout_ms() -> u64 {
    5_000
}

fn default_secret_dir() -> PathBuf {
    PathBuf::from("~/.secret")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            internal_timeout_ms: default_internal_timeout_ms(),
            secret_dir: default_secret_dir(),
            default_terminators: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Default per-command timeout
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Timeout for bookkeeping commands
    #[must_use]
    pub fn internal_timeout(&self) -> Duration {
        Duration::from_millis(self.internal_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: EngineConfig = serde_json::from_str(r#"{"default_timeout_ms": 1000}"#).unwrap();
        assert_eq!(config.default_timeout(), Duration::from_secs(1));
        assert_eq!(config.internal_timeout(), Duration::from_secs(5));
        assert_eq!(config.secret_dir, PathBuf::from("~/.secret"));
    }
}
