//! Configuration loading and types

use std::path::{Path, PathBuf};

use hostrun_core::{EngineConfig, Target};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the hostrun CLI
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Engine settings
    #[serde(default)]
    pub engine: EngineSection,
    /// Named targets
    #[serde(default)]
    pub target: Vec<TargetConfig>,
}

/// `[engine]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Timeouts, secret directory and terminators
    #[serde(flatten)]
    pub engine: EngineConfig,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            engine: EngineConfig::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// `[[target]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Name used on the command line
    pub name: String,
    /// Target URL
    pub url: String,
    /// Credential reference
    pub credentials: Option<String>,
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from default paths or use defaults
    ///
    /// # Errors
    /// Returns error if a found file cannot be read or parsed
    pub fn load_default() -> eyre::Result<Self> {
        if let Ok(path) = std::env::var("HOSTRUN_CONFIG") {
            return Self::load(&PathBuf::from(path));
        }

        let paths = [
            PathBuf::from("hostrun.toml"),
            PathBuf::from("/etc/hostrun/hostrun.toml"),
            dirs::config_dir()
                .map(|p| p.join("hostrun/hostrun.toml"))
                .unwrap_or_default(),
        ];

        for path in paths {
            if path.is_file() {
                return Self::load(&path);
            }
        }

        Ok(Config::default())
    }

    /// Resolve a command-line target: a configured name, else a URL
    #[must_use]
    pub fn target(&self, name_or_url: &str, credentials: Option<String>) -> Target {
        let configured = self.target.iter().find(|t| t.name == name_or_url);
        let mut target = match configured {
            Some(t) => Target {
                url: t.url.clone(),
                credentials: t.credentials.clone(),
            },
            None => Target::new(name_or_url),
        };
        if credentials.is_some() {
            target.credentials = credentials;
        }
        target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str(
            r#"
            [engine]
            log_level = "debug"
            default_timeout_ms = 60000
            secret_dir = "/etc/hostrun/secrets"
            default_terminators = ["> "]

            [[target]]
            name = "web"
            url = "ssh://10.0.0.5:2222/srv/web"
            credentials = "deploy"
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.log_level, "debug");
        assert_eq!(config.engine.engine.default_timeout_ms, 60_000);
        assert_eq!(config.engine.engine.internal_timeout_ms, 5_000);
        assert_eq!(config.engine.engine.default_terminators, vec!["> "]);

        let target = config.target("web", None);
        assert_eq!(target.url, "ssh://10.0.0.5:2222/srv/web");
        assert_eq!(target.credentials.as_deref(), Some("deploy"));
    }

    #[test]
    fn test_unknown_target_is_url() {
        let config = Config::default();
        let target = config.target("ssh://db", Some("root".into()));
        assert_eq!(target.url, "ssh://db");
        assert_eq!(target.credentials.as_deref(), Some("root"));
        assert_eq!(config.engine.log_level, "info");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostrun.toml");
        std::fs::write(&path, "[engine]\ninternal_timeout_ms = 1500\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.engine.engine.internal_timeout_ms, 1500);
        assert!(config.target.is_empty());
    }
}
