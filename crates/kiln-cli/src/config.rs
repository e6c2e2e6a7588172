use kiln_runtime::{DEFAULT_PROJECT, DEFAULT_REMOTE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("config error: HOME not set")]
    HomeNotSet,
}

/// Persistent CLI defaults, stored at `~/.config/kiln/config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KilnConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_project")]
    pub project: String,
    #[serde(default = "default_remote")]
    pub remote: String,
}

fn default_backend() -> String {
    "lxd".to_owned()
}

fn default_project() -> String {
    DEFAULT_PROJECT.to_owned()
}

fn default_remote() -> String {
    DEFAULT_REMOTE.to_owned()
}

impl Default for KilnConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            project: default_project(),
            remote: default_remote(),
        }
    }
}

impl KilnConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Like [`KilnConfig::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let home = std::env::var("HOME").map_err(|_| ConfigError::HomeNotSet)?;
    Ok(PathBuf::from(home).join(".config/kiln/config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.json");

        let config = KilnConfig {
            backend: "multipass".to_owned(),
            project: "craft".to_owned(),
            remote: "local".to_owned(),
        };
        config.save(&path).unwrap();

        assert_eq!(KilnConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = KilnConfig::load_or_default(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, KilnConfig::default());
        assert_eq!(config.backend, "lxd");
        assert_eq!(config.project, "default");
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"backend": "mock"}"#).unwrap();
        let config = KilnConfig::load(&path).unwrap();
        assert_eq!(config.backend, "mock");
        assert_eq!(config.remote, "local");
    }

    #[test]
    fn invalid_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "backend = lxd").unwrap();
        let err = KilnConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().starts_with("config error:"));
    }
}
