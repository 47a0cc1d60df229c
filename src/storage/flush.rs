//! Saving cached records through a backend
//!
//! All writes of cached records go through [`Persister`] so that saves for
//! one user never overlap and dirty flags are cleared only when the saved
//! snapshot is still current.

use crate::cache::RecordCache;
use crate::metrics::Metrics;
use crate::storage::VaultBackend;
use dashmap::DashMap;
use futures_util::future::join_all;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Result of persisting one user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The record was written and is clean (unless edited meanwhile)
    Saved,
    /// Nothing to write
    Clean,
    /// Dirty flag was set but no record is cached; the flag was dropped
    Missing,
    /// The backend rejected the write; the user stays dirty
    Failed,
}

impl FlushOutcome {
    pub fn is_success(self) -> bool {
        !matches!(self, Self::Failed)
    }
}

/// Aggregate result of a batch save
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SaveReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Saves still running when the timeout hit
    pub abandoned: usize,
    pub elapsed: Duration,
}

impl SaveReport {
    /// True when every attempted save finished successfully
    pub fn is_complete(&self) -> bool {
        self.succeeded == self.attempted
    }
}

/// Writes cached records to the backend
pub struct Persister {
    backend: Arc<dyn VaultBackend>,
    cache: Arc<RecordCache>,
    metrics: Arc<Metrics>,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl Persister {
    /// Create a new persister
    pub fn new(backend: Arc<dyn VaultBackend>, cache: Arc<RecordCache>) -> Self {
        Self {
            backend,
            cache,
            metrics: Arc::new(Metrics::new()),
            locks: DashMap::new(),
        }
    }

    /// Share an existing metrics registry
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn backend(&self) -> &Arc<dyn VaultBackend> {
        &self.backend
    }

    pub fn cache(&self) -> &Arc<RecordCache> {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    fn lock_for(&self, user: Uuid) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(user).or_default().value())
    }

    /// Save the user's cached record if dirty
    pub async fn persist(&self, user: Uuid) -> FlushOutcome {
        let lock = self.lock_for(user);
        let outcome = {
            let _guard = lock.lock().await;
            self.persist_locked(user).await
        };
        drop(lock);
        // Only this map holds the lock now unless another save is queued
        self.locks
            .remove_if(&user, |_, l| Arc::strong_count(l) == 1);
        outcome
    }

    async fn persist_locked(&self, user: Uuid) -> FlushOutcome {
        // Generation first: a later edit then always outlives this save
        let Some(generation) = self.cache.dirty_generation(user) else {
            return FlushOutcome::Clean;
        };
        let Some(record) = self.cache.get(user) else {
            debug!("Dropping dirty flag for {} with no cached record", user);
            self.cache.clear_dirty_if(user, generation);
            return FlushOutcome::Missing;
        };

        let started = Instant::now();
        let result = self.backend.save(user, &record).await;
        self.metrics.record_since("save", started);

        match result {
            Ok(()) => {
                if !self.cache.clear_dirty_if(user, generation) {
                    debug!("Vault for {} changed during save; staying dirty", user);
                }
                FlushOutcome::Saved
            }
            Err(e) => {
                error!(
                    backend = self.backend.name(),
                    "Failed to save vault for {}: {}", user, e
                );
                FlushOutcome::Failed
            }
        }
    }

    /// Save every user in `users` concurrently, waiting at most `timeout`
    ///
    /// Saves still running at the deadline keep running in the background
    /// and are reported as abandoned.
    pub async fn save_all(self: &Arc<Self>, users: HashSet<Uuid>, timeout: Duration) -> SaveReport {
        let started = Instant::now();
        let attempted = users.len();
        if attempted == 0 {
            return SaveReport::default();
        }

        let succeeded = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = users
            .into_iter()
            .map(|user| {
                let persister = Arc::clone(self);
                let succeeded = Arc::clone(&succeeded);
                let failed = Arc::clone(&failed);
                tokio::spawn(async move {
                    if persister.persist(user).await.is_success() {
                        succeeded.fetch_add(1, Ordering::SeqCst);
                    } else {
                        failed.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        let timed_out = tokio::time::timeout(timeout, join_all(handles))
            .await
            .is_err();

        let succeeded = succeeded.load(Ordering::SeqCst);
        let failed = failed.load(Ordering::SeqCst);
        let report = SaveReport {
            attempted,
            succeeded,
            failed,
            abandoned: attempted.saturating_sub(succeeded + failed),
            elapsed: started.elapsed(),
        };
        self.metrics.record("save_all", report.elapsed);

        if timed_out {
            warn!(
                attempted,
                succeeded,
                failed,
                abandoned = report.abandoned,
                timeout_ms = timeout.as_millis() as u64,
                "Batch save timed out; remaining saves left running"
            );
        } else if failed > 0 {
            warn!(attempted, succeeded, failed, "Batch save finished with failures");
        } else {
            info!(
                attempted,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Batch save finished"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::ScriptedBackend;
    use crate::vault::{ItemBlob, VaultRecord};

    fn setup() -> (Arc<ScriptedBackend>, Arc<RecordCache>, Arc<Persister>) {
        let backend = Arc::new(ScriptedBackend::new());
        let cache = Arc::new(RecordCache::default());
        let persister = Arc::new(Persister::new(backend.clone(), cache.clone()));
        (backend, cache, persister)
    }

    fn touch(cache: &RecordCache, user: Uuid, item: &str) {
        cache.update(user, |r| {
            r.write_slots(1, 52, &[Some(ItemBlob::from(item))], 52)
        });
    }

    #[tokio::test]
    async fn persist_saves_and_clears() {
        let (backend, cache, persister) = setup();
        let user = Uuid::new_v4();
        cache.put(user, VaultRecord::empty(user)).unwrap();
        touch(&cache, user, "a");

        assert_eq!(persister.persist(user).await, FlushOutcome::Saved);
        assert!(!cache.is_dirty(user));
        assert_eq!(backend.stored(user), cache.get(user));
        assert_eq!(persister.metrics().get("save").unwrap().count, 1);
    }

    #[tokio::test]
    async fn clean_user_is_not_written() {
        let (backend, cache, persister) = setup();
        let user = Uuid::new_v4();
        cache.put(user, VaultRecord::empty(user)).unwrap();

        assert_eq!(persister.persist(user).await, FlushOutcome::Clean);
        assert_eq!(backend.save_count(), 0);
    }

    #[tokio::test]
    async fn failure_keeps_dirty() {
        let (backend, cache, persister) = setup();
        backend.set_fail_saves(true);
        let user = Uuid::new_v4();
        cache.put_dirty(user, VaultRecord::empty(user)).unwrap();

        assert_eq!(persister.persist(user).await, FlushOutcome::Failed);
        assert!(cache.is_dirty(user));
    }

    #[tokio::test]
    async fn dirty_without_record_is_dropped() {
        let (backend, cache, persister) = setup();
        let user = Uuid::new_v4();
        cache.mark_dirty(user);

        assert_eq!(persister.persist(user).await, FlushOutcome::Missing);
        assert!(!cache.is_dirty(user));
        assert_eq!(backend.save_count(), 0);
    }

    #[tokio::test]
    async fn edit_during_save_stays_dirty() {
        let (backend, cache, persister) = setup();
        backend.set_save_delay(Duration::from_millis(50));
        let user = Uuid::new_v4();
        cache.put(user, VaultRecord::empty(user)).unwrap();
        touch(&cache, user, "old");

        let task = {
            let persister = Arc::clone(&persister);
            tokio::spawn(async move { persister.persist(user).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        touch(&cache, user, "new");

        assert_eq!(task.await.unwrap(), FlushOutcome::Saved);
        assert!(cache.is_dirty(user));

        assert_eq!(persister.persist(user).await, FlushOutcome::Saved);
        assert!(!cache.is_dirty(user));
        let stored = backend.stored(user).unwrap();
        assert_eq!(stored.page(1).unwrap().get(0), Some(&ItemBlob::from("new")));
    }

    #[tokio::test]
    async fn save_all_counts_outcomes() {
        let (backend, cache, persister) = setup();
        let users: HashSet<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for &user in &users {
            cache.put_dirty(user, VaultRecord::empty(user)).unwrap();
        }

        let report = persister.save_all(users, Duration::from_secs(5)).await;
        assert_eq!(report.attempted, 5);
        assert_eq!(report.succeeded, 5);
        assert!(report.is_complete());
        assert_eq!(backend.save_count(), 5);
        assert_eq!(cache.dirty_count(), 0);
        assert!(persister.locks.is_empty());
    }

    #[tokio::test]
    async fn save_all_reports_failures() {
        let (backend, cache, persister) = setup();
        backend.set_fail_saves(true);
        let user = Uuid::new_v4();
        cache.put_dirty(user, VaultRecord::empty(user)).unwrap();

        let report = persister
            .save_all(HashSet::from([user]), Duration::from_secs(5))
            .await;
        assert_eq!(report.failed, 1);
        assert!(!report.is_complete());
        assert!(cache.is_dirty(user));
    }

    #[tokio::test]
    async fn save_all_abandons_on_timeout() {
        let (backend, cache, persister) = setup();
        backend.set_save_delay(Duration::from_millis(300));
        let user = Uuid::new_v4();
        cache.put_dirty(user, VaultRecord::empty(user)).unwrap();

        let report = persister
            .save_all(HashSet::from([user]), Duration::from_millis(20))
            .await;
        assert_eq!(report.abandoned, 1);
        assert_eq!(report.succeeded, 0);

        // the abandoned save still completes
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!cache.is_dirty(user));
        assert_eq!(backend.save_count(), 1);
    }
}
