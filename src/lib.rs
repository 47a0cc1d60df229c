//! vaultkeep - per-user item vaults
//!
//! Keeps each user's vault pages in a write-back cache, coordinates the
//! open/navigate/close lifecycle of vault sessions, and persists records to
//! JSON documents or SQLite on close and on a fixed auto-save schedule.

pub mod autosave;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod session;
pub mod storage;
pub mod ui;
pub mod vault;

pub use error::{VaultError, VaultResult};
