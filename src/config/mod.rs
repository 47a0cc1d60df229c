//! Configuration management for vaultkeep

pub mod schema;

pub use schema::Config;

use crate::error::{VaultError, VaultResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vaultkeep")
            .join("config.toml")
    }

    /// Get the default data directory path
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vaultkeep")
    }

    /// Resolve the data directory for a loaded config
    pub fn data_dir(config: &Config) -> PathBuf {
        config
            .general
            .data_dir
            .clone()
            .unwrap_or_else(Self::default_data_dir)
    }

    /// Directory for the file backend's per-user documents
    pub fn vaults_dir(config: &Config) -> PathBuf {
        config
            .storage
            .file
            .dir
            .clone()
            .unwrap_or_else(|| Self::data_dir(config).join("vaults"))
    }

    /// Database file for the SQLite backend
    pub fn database_path(config: &Config) -> PathBuf {
        config
            .storage
            .sqlite
            .path
            .clone()
            .unwrap_or_else(|| Self::data_dir(config).join("vaults.db"))
    }

    /// Load configuration, falling back to defaults if the file does not exist
    pub async fn load(&self) -> VaultResult<Config> {
        Ok(self.load_raw().await?.validated())
    }

    /// Load configuration without repairing out-of-range values
    ///
    /// Lets the caller install a log subscriber before `Config::validated`
    /// reports what it fixed.
    pub async fn load_raw(&self) -> VaultResult<Config> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        Self::parse_file(&self.config_path).await
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> VaultResult<Config> {
        Ok(Self::parse_file(path).await?.validated())
    }

    async fn parse_file(path: &Path) -> VaultResult<Config> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| VaultError::io(format!("reading config from {}", path.display()), e))?;

        toml::from_str(&content).map_err(|e| VaultError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> VaultResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            VaultError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Ensure the config directory exists
    async fn ensure_config_dir(&self) -> VaultResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| VaultError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
