//! Configuration schema for vaultkeep
//!
//! Configuration is stored at `~/.config/vaultkeep/config.toml`

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

/// Slot counts a Simple-mode vault may be configured with
pub const SIMPLE_SLOT_SIZES: [u32; 6] = [9, 18, 27, 36, 45, 54];

/// Slot counts a Paged-mode vault may be configured with
pub const PAGED_SLOT_SIZES: [u32; 6] = [9, 18, 27, 36, 45, 52];

/// Upper bound on pages in Paged mode
pub const MAX_PAGES: u32 = 5;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Vault layout settings
    pub vault: VaultConfig,

    /// Storage backend settings
    pub storage: StorageConfig,

    /// Record cache settings
    pub cache: CacheConfig,

    /// Auto-save settings
    pub autosave: AutoSaveConfig,
}

impl Config {
    /// Replace out-of-range values with their defaults, logging each fix
    pub fn validated(mut self) -> Self {
        let vault = &mut self.vault;
        match vault.mode {
            ModeName::Simple => {
                if !SIMPLE_SLOT_SIZES.contains(&vault.simple_slots) {
                    warn!(
                        "Invalid vault.simple_slots value '{}'. Must be one of {:?}. Defaulting to 27.",
                        vault.simple_slots, SIMPLE_SLOT_SIZES
                    );
                    vault.simple_slots = 27;
                }
            }
            ModeName::Paged => {
                if !PAGED_SLOT_SIZES.contains(&vault.paged_slots) {
                    warn!(
                        "Invalid vault.paged_slots value '{}'. Must be one of {:?}. Defaulting to 52.",
                        vault.paged_slots, PAGED_SLOT_SIZES
                    );
                    vault.paged_slots = 52;
                }
                if !(1..=MAX_PAGES).contains(&vault.paged_pages) {
                    warn!(
                        "Invalid vault.paged_pages value '{}'. Must be between 1 and {}. Defaulting to 1.",
                        vault.paged_pages, MAX_PAGES
                    );
                    vault.paged_pages = 1;
                }
            }
        }

        if self.autosave.interval_secs == 0 {
            warn!("Invalid autosave.interval_secs value 0. Defaulting to 300.");
            self.autosave.interval_secs = 300;
        }
        if self.autosave.timeout_secs == 0 {
            warn!("Invalid autosave.timeout_secs value 0. Defaulting to 30.");
            self.autosave.timeout_secs = 30;
        }
        if self.storage.sqlite.max_attempts == 0 {
            warn!("Invalid storage.sqlite.max_attempts value 0. Defaulting to 3.");
            self.storage.sqlite.max_attempts = 3;
        }

        self
    }
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Base directory for vault data (defaults to the platform data dir)
    pub data_dir: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            data_dir: None,
        }
    }
}

/// Operational mode name as written in the config file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeName {
    /// Single page, size from slot grants
    Simple,
    /// Multiple fixed-width pages
    #[default]
    Paged,
}

/// Vault layout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Operational mode
    pub mode: ModeName,

    /// Default slot count in Simple mode
    pub simple_slots: u32,

    /// Default slot count in Paged mode
    pub paged_slots: u32,

    /// Default page count in Paged mode
    pub paged_pages: u32,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            mode: ModeName::Paged,
            simple_slots: 27,
            paged_slots: 52,
            paged_pages: 1,
        }
    }
}

/// Which persistence backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// One JSON document per user
    #[default]
    File,
    /// SQLite database
    Sqlite,
}

/// Storage backend configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend selection
    pub backend: BackendKind,

    /// File backend settings
    pub file: FileStorageConfig,

    /// SQLite backend settings
    pub sqlite: SqliteStorageConfig,
}

/// File backend settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileStorageConfig {
    /// Directory holding per-user documents (default: `<data_dir>/vaults`)
    pub dir: Option<PathBuf>,
}

/// SQLite backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteStorageConfig {
    /// Database file (default: `<data_dir>/vaults.db`)
    pub path: Option<PathBuf>,

    /// How long SQLite waits on a locked database before reporting busy
    pub busy_timeout_ms: u64,

    /// Total attempts for a transient failure, including the first
    pub max_attempts: u32,

    /// Delay before the first retry; doubles on each further retry
    pub initial_retry_delay_ms: u64,
}

impl Default for SqliteStorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: 5_000,
            max_attempts: 3,
            initial_retry_delay_ms: 1_000,
        }
    }
}

/// Record cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entry count above which a leak warning is logged
    pub warn_threshold: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            warn_threshold: 1_000,
        }
    }
}

/// Auto-save configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoSaveConfig {
    /// Seconds between auto-save runs
    pub interval_secs: u64,

    /// Upper bound on a single run (and on the shutdown drain)
    pub timeout_secs: u64,
}

impl Default for AutoSaveConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            timeout_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[general]"));
        assert!(toml.contains("[vault]"));
        assert!(toml.contains("[storage.sqlite]"));
    }

    #[test]
    fn config_deserializes_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.vault.mode, ModeName::Paged);
        assert_eq!(config.storage.backend, BackendKind::File);
        assert_eq!(config.autosave.timeout_secs, 30);
    }

    #[test]
    fn config_deserializes_partial() {
        let toml = r#"
            [storage]
            backend = "sqlite"

            [vault]
            mode = "simple"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.storage.backend, BackendKind::Sqlite);
        assert_eq!(config.vault.mode, ModeName::Simple);
        assert_eq!(config.storage.sqlite.max_attempts, 3); // default preserved
    }

    #[test]
    fn validated_repairs_bad_values() {
        let mut config = Config::default();
        config.vault.paged_slots = 50;
        config.vault.paged_pages = 9;
        config.autosave.interval_secs = 0;

        let config = config.validated();
        assert_eq!(config.vault.paged_slots, 52);
        assert_eq!(config.vault.paged_pages, 1);
        assert_eq!(config.autosave.interval_secs, 300);
    }

    #[test]
    fn validated_checks_simple_sizes() {
        let mut config = Config::default();
        config.vault.mode = ModeName::Simple;
        config.vault.simple_slots = 52;

        let config = config.validated();
        assert_eq!(config.vault.simple_slots, 27);
    }
}
