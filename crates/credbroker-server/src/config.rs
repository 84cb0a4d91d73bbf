//! Daemon configuration.
//!
//! Loaded from a TOML file named by `CREDBROKER_CONFIG` (default
//! `config/credbroker.toml`). Every field has a default, so a missing file or
//! a partial one is fine.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use credbroker_kms::{FileRootKey, RootKeyProvider, StaticRootKey};
use credbroker_store::RepositoryConfig;
use serde::Deserialize;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "CREDBROKER_CONFIG";

/// Configuration file used when [`CONFIG_ENV`] is not set.
pub const DEFAULT_CONFIG_PATH: &str = "config/credbroker.toml";

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub database: DatabaseConfig,
    pub kms: KmsConfig,
    pub repository: RepositorySection,
    pub jobs: JobsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file holding stores, libraries and the oplog.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/credbroker.db"),
        }
    }
}

/// Where data keys live and where the root key comes from.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KmsConfig {
    /// SQLite file holding the wrapped data keys.
    pub database_path: PathBuf,
    /// Root key file, created with mode 0600 on first use.
    pub root_key_file: PathBuf,
    /// Environment variable that may carry a base64 root key. When it is
    /// set, it takes precedence over `root_key_file`.
    pub root_key_base64_env: String,
}

impl Default for KmsConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/keyring.db"),
            root_key_file: FileRootKey::default_path(Path::new("data")),
            root_key_base64_env: "CREDBROKER_ROOT_KEY".to_string(),
        }
    }
}

impl KmsConfig {
    /// Resolve the root key source.
    pub fn root_key_provider(&self) -> Result<Arc<dyn RootKeyProvider>> {
        match std::env::var(&self.root_key_base64_env) {
            Ok(encoded) if !encoded.trim().is_empty() => {
                let key = StaticRootKey::from_base64(encoded.trim()).with_context(|| {
                    format!("invalid root key in ${}", self.root_key_base64_env)
                })?;
                Ok(Arc::new(key))
            }
            _ => Ok(Arc::new(FileRootKey::new(&self.root_key_file))),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RepositorySection {
    /// Row limit for list calls without their own; zero or negative means
    /// unlimited.
    pub default_limit: i32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub rewrap_interval_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            rewrap_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

impl ServerConfig {
    /// Load from `$CREDBROKER_CONFIG` or the default path.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&path)
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Repository settings derived from the `repository` and `jobs` tables.
    pub fn repository_config(&self) -> RepositoryConfig {
        RepositoryConfig {
            default_limit: self.repository.default_limit,
            rewrap_interval: Duration::from_secs(self.jobs.rewrap_interval_secs),
        }
    }
}
