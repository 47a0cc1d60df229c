//! Vault data model
//!
//! A vault record holds a user's pages of fixed-width slots plus optional
//! admin overrides. The layout (page width, capacity math) comes from the
//! configured [`VaultMode`].

pub mod mode;
pub mod record;

pub use mode::{Capacity, PagedLayout, SimpleLayout, VaultMode};
pub use record::{ItemBlob, VaultPage, VaultRecord};
