//! Persistence backend abstraction
//!
//! Provides a trait for vault storage that can be implemented by different
//! backends (per-user JSON documents, SQLite database).

pub mod factory;
pub mod file;
pub mod flush;
pub mod retry;
pub mod sqlite;

pub use factory::create_backend;
pub use file::FileBackend;
pub use flush::{FlushOutcome, Persister, SaveReport};
pub use retry::RetryPolicy;
pub use sqlite::SqliteBackend;

use crate::error::VaultResult;
use crate::vault::VaultRecord;
use async_trait::async_trait;
use tracing::{debug, error};
use uuid::Uuid;

/// Abstract vault storage interface
///
/// Implementations must be safe to call from many tasks at once. Saves for
/// the same user are serialized by the [`Persister`], not by the backend.
#[async_trait]
pub trait VaultBackend: Send + Sync {
    /// Prepare storage (create directories, schema). Failure is fatal.
    async fn initialize(&self) -> VaultResult<()>;

    /// Read a user's record. `Ok(None)` means the user has no prior data.
    async fn fetch(&self, user: Uuid) -> VaultResult<Option<VaultRecord>>;

    /// Load a user's record, never failing
    ///
    /// Missing data yields an empty record. Read errors are logged and also
    /// yield an empty record so the user can still open their vault.
    async fn load(&self, user: Uuid) -> VaultRecord {
        match self.fetch(user).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!("No stored vault for {}, starting empty", user);
                VaultRecord::empty(user)
            }
            Err(e) => {
                error!(
                    backend = self.name(),
                    "Failed to load vault for {}, serving empty record: {}", user, e
                );
                VaultRecord::empty(user)
            }
        }
    }

    /// Persist the complete record atomically
    async fn save(&self, user: Uuid, record: &VaultRecord) -> VaultResult<()>;

    /// Release resources. Safe to call more than once.
    async fn close(&self) -> VaultResult<()>;

    /// Get the human-readable backend name for display
    fn name(&self) -> &'static str;
}
