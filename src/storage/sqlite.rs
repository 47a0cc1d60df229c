//! SQLite backend
//!
//! Blocking SQLite calls run on tokio's blocking pool. Saves are diffed
//! against the stored rows inside a single transaction.

use crate::config::schema::SqliteStorageConfig;
use crate::error::{VaultError, VaultResult};
use crate::storage::{RetryPolicy, VaultBackend};
use crate::vault::{ItemBlob, VaultPage, VaultRecord};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS vault_users (
    user_id      TEXT PRIMARY KEY,
    custom_slots INTEGER NOT NULL DEFAULT 0,
    custom_pages INTEGER NOT NULL DEFAULT 0,
    updated_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS vault_items (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id     TEXT NOT NULL REFERENCES vault_users(user_id) ON DELETE CASCADE,
    page_number INTEGER NOT NULL,
    slot_number INTEGER NOT NULL,
    item_blob   BLOB NOT NULL,
    UNIQUE(user_id, page_number, slot_number)
);

CREATE INDEX IF NOT EXISTS idx_vault_items_user_page
    ON vault_items(user_id, page_number);
"#;

/// Row counts touched by one diffed save
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct SaveDiff {
    upserted: usize,
    deleted: usize,
    unchanged: usize,
}

/// Stores vaults in a SQLite database file
pub struct SqliteBackend {
    path: PathBuf,
    page_width: usize,
    busy_timeout: Duration,
    retry: RetryPolicy,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteBackend {
    /// Create a new SQLite backend; the database is opened by `initialize`
    pub fn new(path: PathBuf, page_width: usize, config: &SqliteStorageConfig) -> Self {
        Self {
            path,
            page_width,
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
            retry: RetryPolicy::from_config(config),
            conn: Arc::new(Mutex::new(None)),
        }
    }

    /// Override the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the open connection on the blocking pool
    async fn with_conn<T, F>(&self, context: &'static str, f: F) -> VaultResult<T>
    where
        F: FnOnce(&mut Connection) -> VaultResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| VaultError::Internal("sqlite connection lock poisoned".into()))?;
            let conn = guard.as_mut().ok_or(VaultError::BackendClosed)?;
            f(conn)
        })
        .await
        .map_err(|e| VaultError::Internal(format!("{} task failed: {}", context, e)))?
    }
}

fn open_connection(path: &Path, busy_timeout: Duration) -> VaultResult<Connection> {
    let conn = Connection::open(path).map_err(|e| VaultError::StorageInit {
        backend: "sqlite".to_string(),
        reason: format!("cannot open {}: {}", path.display(), e),
    })?;
    conn.busy_timeout(busy_timeout)
        .map_err(|e| VaultError::database("setting busy timeout", e))?;
    conn.execute("PRAGMA foreign_keys = ON", [])
        .map_err(|e| VaultError::database("enabling foreign keys", e))?;
    // WAL is unavailable on some filesystems; the default journal still works
    let _ = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0));
    conn.execute_batch(SCHEMA)
        .map_err(|e| VaultError::StorageInit {
            backend: "sqlite".to_string(),
            reason: format!("creating schema: {}", e),
        })?;
    Ok(conn)
}

fn read_record(conn: &Connection, user: Uuid, width: usize) -> VaultResult<Option<VaultRecord>> {
    let key = user.to_string();

    let header: Option<(i64, i64)> = conn
        .query_row(
            "SELECT custom_slots, custom_pages FROM vault_users WHERE user_id = ?1",
            params![key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| VaultError::database("reading vault header", e))?;

    let Some((custom_slots, custom_pages)) = header else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare(
            "SELECT page_number, slot_number, item_blob FROM vault_items
             WHERE user_id = ?1 ORDER BY page_number, slot_number",
        )
        .map_err(|e| VaultError::database("preparing item query", e))?;
    let rows = stmt
        .query_map(params![key], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })
        .map_err(|e| VaultError::database("reading vault items", e))?;

    let mut pages: BTreeMap<u32, VaultPage> = BTreeMap::new();
    for row in rows {
        let (page, slot, blob) = row.map_err(|e| VaultError::database("reading vault item", e))?;
        let number = match u32::try_from(page) {
            Ok(n) if n >= 1 => n,
            _ => {
                warn!("Skipping item with invalid page {} for {}", page, user);
                continue;
            }
        };
        let slot = match usize::try_from(slot) {
            Ok(s) if s < width => s,
            _ => {
                warn!("Skipping item with invalid slot {} on page {} for {}", slot, number, user);
                continue;
            }
        };
        pages
            .entry(number)
            .or_insert_with(|| VaultPage::empty(number, width))
            .set_slot(slot, Some(ItemBlob::new(blob)));
    }

    Ok(Some(VaultRecord::new(
        user,
        pages,
        u32::try_from(custom_slots).unwrap_or(0),
        u32::try_from(custom_pages).unwrap_or(0),
    )))
}

fn write_record(conn: &mut Connection, record: &VaultRecord) -> VaultResult<SaveDiff> {
    let key = record.user().to_string();
    // Dropping an uncommitted transaction rolls it back
    let tx = conn
        .transaction()
        .map_err(|e| VaultError::database("starting save transaction", e))?;

    tx.execute(
        "INSERT INTO vault_users (user_id, custom_slots, custom_pages, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(user_id) DO UPDATE SET
             custom_slots = excluded.custom_slots,
             custom_pages = excluded.custom_pages,
             updated_at = excluded.updated_at",
        params![
            key,
            record.custom_slots(),
            record.custom_pages(),
            Utc::now().to_rfc3339()
        ],
    )
    .map_err(|e| VaultError::database("upserting vault header", e))?;

    let existing: HashMap<(i64, i64), Vec<u8>> = {
        let mut stmt = tx
            .prepare(
                "SELECT page_number, slot_number, item_blob FROM vault_items WHERE user_id = ?1",
            )
            .map_err(|e| VaultError::database("preparing existing item query", e))?;
        let rows = stmt
            .query_map(params![key], |row| {
                Ok((
                    (row.get::<_, i64>(0)?, row.get::<_, i64>(1)?),
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })
            .map_err(|e| VaultError::database("reading existing items", e))?;
        rows.collect::<Result<_, _>>()
            .map_err(|e| VaultError::database("reading existing item", e))?
    };

    let mut diff = SaveDiff::default();

    for &(page, slot) in existing.keys() {
        let still_present = u32::try_from(page)
            .ok()
            .zip(usize::try_from(slot).ok())
            .and_then(|(p, s)| record.page(p).and_then(|pg| pg.get(s)))
            .is_some();
        if !still_present {
            tx.execute(
                "DELETE FROM vault_items
                 WHERE user_id = ?1 AND page_number = ?2 AND slot_number = ?3",
                params![key, page, slot],
            )
            .map_err(|e| VaultError::database("deleting emptied slot", e))?;
            diff.deleted += 1;
        }
    }

    for page in record.pages().values() {
        for (slot, item) in page.occupied() {
            let slot = slot as i64;
            let page_number = i64::from(page.number());
            if existing.get(&(page_number, slot)).map(Vec::as_slice) == Some(item.as_bytes()) {
                diff.unchanged += 1;
                continue;
            }
            tx.execute(
                "INSERT INTO vault_items (user_id, page_number, slot_number, item_blob)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id, page_number, slot_number)
                 DO UPDATE SET item_blob = excluded.item_blob",
                params![key, page_number, slot, item.as_bytes()],
            )
            .map_err(|e| VaultError::database("upserting slot", e))?;
            diff.upserted += 1;
        }
    }

    tx.commit()
        .map_err(|e| VaultError::database("committing save transaction", e))?;
    Ok(diff)
}

#[async_trait]
impl VaultBackend for SqliteBackend {
    async fn initialize(&self) -> VaultResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| VaultError::StorageInit {
                    backend: self.name().to_string(),
                    reason: format!("cannot create {}: {}", parent.display(), e),
                })?;
        }

        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        let slot = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path, busy_timeout)?;
            let mut guard = slot
                .lock()
                .map_err(|_| VaultError::Internal("sqlite connection lock poisoned".into()))?;
            *guard = Some(conn);
            Ok::<_, VaultError>(())
        })
        .await
        .map_err(|e| VaultError::Internal(format!("initialize task failed: {}", e)))??;

        info!("SQLite storage ready at {}", self.path.display());
        Ok(())
    }

    async fn fetch(&self, user: Uuid) -> VaultResult<Option<VaultRecord>> {
        let width = self.page_width;
        self.retry
            .run("load", || {
                self.with_conn("load", move |conn| read_record(conn, user, width))
            })
            .await
    }

    async fn save(&self, user: Uuid, record: &VaultRecord) -> VaultResult<()> {
        if record.user() != user {
            return Err(VaultError::InvalidArgument(format!(
                "record for {} cannot be saved as {}",
                record.user(),
                user
            )));
        }

        let diff = self
            .retry
            .run("save", || {
                let record = record.clone();
                self.with_conn("save", move |conn| write_record(conn, &record))
            })
            .await?;

        debug!(
            upserted = diff.upserted,
            deleted = diff.deleted,
            unchanged = diff.unchanged,
            "Saved vault for {}",
            user
        );
        Ok(())
    }

    async fn close(&self) -> VaultResult<()> {
        let slot = Arc::clone(&self.conn);
        let closed = tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| VaultError::Internal("sqlite connection lock poisoned".into()))?;
            match guard.take() {
                Some(conn) => conn
                    .close()
                    .map(|_| true)
                    .map_err(|(_, e)| VaultError::database("closing database", e)),
                None => Ok(false),
            }
        })
        .await
        .map_err(|e| VaultError::Internal(format!("close task failed: {}", e)))??;

        if closed {
            debug!("SQLite storage closed");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}
