//! Error types for vaultkeep
//!
//! All modules use `VaultResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for vault operations
pub type VaultResult<T> = Result<T, VaultError>;

/// All errors that can occur in vaultkeep
#[derive(Error, Debug)]
pub enum VaultError {
    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Storage errors
    #[error("Storage initialization failed for {backend}: {reason}")]
    StorageInit { backend: String, reason: String },

    #[error("Database error while {context}: {source}")]
    Database {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Corrupt vault record for {user}: {reason}")]
    CorruptRecord { user: Uuid, reason: String },

    #[error("Storage backend is closed")]
    BackendClosed,

    #[error("Operation timed out: {0}")]
    Timeout(String),

    // Cache errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Session errors
    #[error("No open vault session for {0}")]
    SessionNotOpen(Uuid),

    #[error("Vault session for {user} is {state}, cannot {action}")]
    InvalidTransition {
        user: Uuid,
        state: String,
        action: &'static str,
    },

    #[error("Page {page} is out of range (1..={max})")]
    PageOutOfRange { page: u32, max: u32 },

    #[error("User {0} disconnected before the vault could be opened")]
    UserUnavailable(Uuid),

    #[error("Render surface error: {0}")]
    Render(String),

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl VaultError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a database error with context
    pub fn database(context: impl Into<String>, source: rusqlite::Error) -> Self {
        Self::Database {
            context: context.into(),
            source,
        }
    }

    /// Check if error is transient and the operation may be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database { source, .. } => matches!(
                source,
                rusqlite::Error::SqliteFailure(e, _)
                    if matches!(
                        e.code,
                        rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                    )
            ),
            Self::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
            ),
            Self::Timeout(_) => true,
            _ => false,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::ConfigInvalid { .. } => Some("Run: vaultd config show"),
            Self::StorageInit { .. } => {
                Some("Check storage.backend and the data directory permissions")
            }
            Self::BackendClosed => Some("The server is shutting down"),
            _ => None,
        }
    }
}
