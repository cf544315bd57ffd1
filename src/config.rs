//! Registry configuration
//!
//! Layered with figment: built-in defaults, then an optional TOML file, then
//! `PERMTREE_` environment variables (`__` separates nested keys, so
//! `PERMTREE_FILE__PATH` sets `file.path`).

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(#[from] figment::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to write config file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub path: PathBuf,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("permissions.json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "permissions.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    /// Name of the backend selected at startup
    pub backend: String,
    /// Entities must hold `sys.whitelisted` to be permitted
    pub whitelist: bool,
    /// Log every permission check
    pub debug: bool,
    /// Ops pass every check
    pub allow_ops: bool,
    pub file: FileConfig,
    pub database: DatabaseConfig,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            whitelist: false,
            debug: false,
            allow_ops: true,
            file: FileConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl PermissionsConfig {
    /// Figment with defaults, the TOML file when given, and the environment
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(PermissionsConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed("PERMTREE_").split("__"))
    }

    /// Load the layered config. A missing file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Ok(Self::figment(path).extract()?)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Write the config back as TOML
    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = self.to_toml()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ConfigError::WriteFile {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::write(path, text)
            .await
            .map_err(|source| ConfigError::WriteFile {
                path: path.to_path_buf(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PermissionsConfig::default();
        assert_eq!(config.backend, "memory");
        assert!(config.allow_ops);
        assert!(!config.whitelist);
        assert!(!config.debug);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = PermissionsConfig::figment(Some(&dir.path().join("absent.toml")))
            .extract::<PermissionsConfig>()
            .unwrap();
        assert_eq!(config.file, FileConfig::default());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("permtree.toml");
        std::fs::write(
            &path,
            "backend = \"file\"\nwhitelist = true\n\n[file]\npath = \"/tmp/perms.json\"\n",
        )
        .unwrap();

        let config: PermissionsConfig = PermissionsConfig::figment(Some(&path)).extract().unwrap();
        assert_eq!(config.backend, "file");
        assert!(config.whitelist);
        assert!(config.allow_ops);
        assert_eq!(config.file.path, PathBuf::from("/tmp/perms.json"));
        assert_eq!(config.database, DatabaseConfig::default());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("permtree.toml");

        let config = PermissionsConfig {
            debug: true,
            allow_ops: false,
            ..Default::default()
        };
        config.save(&path).await.unwrap();

        let loaded: PermissionsConfig = PermissionsConfig::figment(Some(&path)).extract().unwrap();
        assert_eq!(loaded, config);
    }
}
