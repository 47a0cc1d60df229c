//! File backend: one JSON document per user
//!
//! Layout of `<dir>/<uuid>.json`:
//!
//! ```json
//! {
//!   "user-id": "…",
//!   "custom-slots": 0,
//!   "custom-pages": 0,
//!   "pages": { "1": { "0": "<base64>", "13": "<base64>" } }
//! }
//! ```
//!
//! Only occupied slots and non-empty pages are written.

use crate::error::{VaultError, VaultResult};
use crate::storage::VaultBackend;
use crate::vault::{ItemBlob, VaultPage, VaultRecord};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// On-disk document shape
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct VaultDocument {
    user_id: Uuid,
    #[serde(default)]
    custom_slots: u32,
    #[serde(default)]
    custom_pages: u32,
    #[serde(default)]
    pages: BTreeMap<String, BTreeMap<String, String>>,
}

impl VaultDocument {
    fn from_record(record: &VaultRecord) -> Self {
        let pages = record
            .pages()
            .values()
            .filter(|page| !page.is_empty())
            .map(|page| {
                let slots = page
                    .occupied()
                    .map(|(slot, item)| (slot.to_string(), STANDARD.encode(item.as_bytes())))
                    .collect();
                (page.number().to_string(), slots)
            })
            .collect();

        Self {
            user_id: record.user(),
            custom_slots: record.custom_slots(),
            custom_pages: record.custom_pages(),
            pages,
        }
    }

    /// Rebuild a record, skipping entries that cannot be decoded
    fn into_record(self, width: usize) -> VaultRecord {
        let user = self.user_id;
        let mut pages = BTreeMap::new();

        for (page_key, slots) in self.pages {
            let number = match page_key.parse::<u32>() {
                Ok(n) if n >= 1 => n,
                _ => {
                    warn!("Skipping invalid page key '{}' in vault of {}", page_key, user);
                    continue;
                }
            };

            let mut page = VaultPage::empty(number, width);
            for (slot_key, encoded) in slots {
                let slot = match slot_key.parse::<usize>() {
                    Ok(s) if s < width => s,
                    _ => {
                        warn!(
                            "Skipping invalid slot '{}' on page {} in vault of {}",
                            slot_key, number, user
                        );
                        continue;
                    }
                };
                match STANDARD.decode(encoded.as_bytes()) {
                    Ok(bytes) => {
                        page.set_slot(slot, Some(ItemBlob::new(bytes)));
                    }
                    Err(e) => warn!(
                        "Skipping undecodable item at page {} slot {} in vault of {}: {}",
                        number, slot, user, e
                    ),
                }
            }

            if !page.is_empty() {
                pages.insert(number, page);
            }
        }

        VaultRecord::new(user, pages, self.custom_slots, self.custom_pages)
    }
}

/// Stores each user's vault as a JSON document in one directory
pub struct FileBackend {
    dir: PathBuf,
    page_width: usize,
    closed: AtomicBool,
}

impl FileBackend {
    /// Create a new file backend rooted at `dir`
    pub fn new(dir: PathBuf, page_width: usize) -> Self {
        Self {
            dir,
            page_width,
            closed: AtomicBool::new(false),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Document path for a user
    pub fn record_path(&self, user: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", user))
    }

    fn ensure_open(&self) -> VaultResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VaultError::BackendClosed);
        }
        Ok(())
    }

    /// Write to a unique temp file, then rename over the target
    async fn write_atomic(&self, path: &Path, content: &[u8]) -> VaultResult<()> {
        let temp_path = self
            .dir
            .join(format!(".{}.tmp", Uuid::new_v4().simple()));

        fs::write(&temp_path, content)
            .await
            .map_err(|e| VaultError::io(format!("writing {}", temp_path.display()), e))?;

        if let Err(e) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(VaultError::io(
                format!("renaming into {}", path.display()),
                e,
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl VaultBackend for FileBackend {
    async fn initialize(&self) -> VaultResult<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| VaultError::StorageInit {
                backend: self.name().to_string(),
                reason: format!("cannot create {}: {}", self.dir.display(), e),
            })?;
        info!("File storage ready at {}", self.dir.display());
        Ok(())
    }

    async fn fetch(&self, user: Uuid) -> VaultResult<Option<VaultRecord>> {
        self.ensure_open()?;
        let path = self.record_path(user);

        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(VaultError::io(format!("reading {}", path.display()), e));
            }
        };

        let document: VaultDocument =
            serde_json::from_slice(&content).map_err(|e| VaultError::CorruptRecord {
                user,
                reason: format!("{}: {}", path.display(), e),
            })?;

        if document.user_id != user {
            return Err(VaultError::CorruptRecord {
                user,
                reason: format!(
                    "{} belongs to {}",
                    path.display(),
                    document.user_id
                ),
            });
        }

        debug!("Loaded vault for {} from {}", user, path.display());
        Ok(Some(document.into_record(self.page_width)))
    }

    async fn save(&self, user: Uuid, record: &VaultRecord) -> VaultResult<()> {
        self.ensure_open()?;
        if record.user() != user {
            return Err(VaultError::InvalidArgument(format!(
                "record for {} cannot be saved as {}",
                record.user(),
                user
            )));
        }

        let content = serde_json::to_vec_pretty(&VaultDocument::from_record(record))?;
        let path = self.record_path(user);
        self.write_atomic(&path, &content).await?;

        debug!("Saved vault for {} to {}", user, path.display());
        Ok(())
    }

    async fn close(&self) -> VaultResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("File storage closed");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}
