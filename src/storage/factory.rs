//! Backend factory
//!
//! Selects the storage implementation named in configuration.

use crate::config::schema::BackendKind;
use crate::config::{Config, ConfigManager};
use crate::storage::{FileBackend, SqliteBackend, VaultBackend};
use std::sync::Arc;

/// Create the configured vault backend
///
/// The backend is not initialized; call [`VaultBackend::initialize`] before use.
///
/// # Arguments
/// * `config` - The application configuration
/// * `page_width` - Slots per stored page for the active mode
pub fn create_backend(config: &Config, page_width: usize) -> Arc<dyn VaultBackend> {
    match config.storage.backend {
        BackendKind::File => Arc::new(FileBackend::new(
            ConfigManager::vaults_dir(config),
            page_width,
        )),
        BackendKind::Sqlite => Arc::new(SqliteBackend::new(
            ConfigManager::database_path(config),
            page_width,
            &config.storage.sqlite,
        )),
    }
}
