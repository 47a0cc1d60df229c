//! In-memory record cache with dirty tracking
//!
//! Holds the working copy of every active user's vault. The cache is safe for
//! concurrent access but does not serialize logical writers: the session
//! coordinator guarantees at most one session (and so one writer) per user.
//!
//! # Dirty generations
//!
//! Every `mark_dirty` stamps the user with a fresh generation number. A save
//! snapshots the generation together with the record and only clears the flag
//! through [`RecordCache::clear_dirty_if`], so an edit that lands while the
//! save is in flight keeps the user dirty for the next flush.

use crate::error::{VaultError, VaultResult};
use crate::vault::VaultRecord;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};
use uuid::Uuid;

/// Default entry count above which a leak warning is logged
pub const DEFAULT_WARN_THRESHOLD: usize = 1_000;

/// Point-in-time cache counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub total: usize,
    pub clean: usize,
    pub dirty: usize,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cached={} clean={} dirty={}",
            self.total, self.clean, self.dirty
        )
    }
}

/// Thread-safe map from user to vault record plus the dirty set
pub struct RecordCache {
    records: DashMap<Uuid, VaultRecord>,
    dirty: DashMap<Uuid, u64>,
    retired: DashSet<Uuid>,
    generation: AtomicU64,
    warn_threshold: usize,
}

impl RecordCache {
    /// Create an empty cache
    pub fn new(warn_threshold: usize) -> Self {
        Self {
            records: DashMap::new(),
            dirty: DashMap::new(),
            retired: DashSet::new(),
            generation: AtomicU64::new(0),
            warn_threshold,
        }
    }

    /// Cloned snapshot of the cached record. Never loads.
    pub fn get(&self, user: Uuid) -> Option<VaultRecord> {
        self.records.get(&user).map(|r| r.value().clone())
    }

    /// Install a record without marking it dirty
    pub fn put(&self, user: Uuid, record: VaultRecord) -> VaultResult<()> {
        check_key(user, &record)?;
        self.records.insert(user, record);
        self.warn_if_oversized();
        Ok(())
    }

    fn warn_if_oversized(&self) {
        let size = self.records.len();
        if size > self.warn_threshold {
            warn!(
                size,
                threshold = self.warn_threshold,
                "Record cache exceeds threshold; possible leak or too many cached users"
            );
        }
    }

    /// Install a record unless one is already cached. Returns true if installed.
    pub fn put_if_absent(&self, user: Uuid, record: VaultRecord) -> VaultResult<bool> {
        check_key(user, &record)?;
        let installed = match self.records.entry(user) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
        };
        if installed {
            self.warn_if_oversized();
        }
        Ok(installed)
    }

    /// Install a record and mark it dirty
    pub fn put_dirty(&self, user: Uuid, record: VaultRecord) -> VaultResult<()> {
        self.put(user, record)?;
        self.mark_dirty(user);
        Ok(())
    }

    /// Mutate a cached record in place.
    ///
    /// `f` returns whether it changed anything; a change marks the user dirty.
    /// Returns `None` if the user is not cached.
    pub fn update<F>(&self, user: Uuid, f: F) -> Option<bool>
    where
        F: FnOnce(&mut VaultRecord) -> bool,
    {
        let changed = {
            let mut entry = self.records.get_mut(&user)?;
            f(entry.value_mut())
        };
        if changed {
            self.mark_dirty(user);
        }
        Some(changed)
    }

    /// Flag the user's record as diverged from storage
    pub fn mark_dirty(&self, user: Uuid) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.dirty.insert(user, generation);
    }

    /// Unconditionally clear the dirty flag
    pub fn clear_dirty(&self, user: Uuid) {
        self.dirty.remove(&user);
    }

    /// Clear the dirty flag only if no mutation happened since `generation`.
    ///
    /// A retired entry is evicted once its flag clears.
    pub fn clear_dirty_if(&self, user: Uuid, generation: u64) -> bool {
        let cleared = self
            .dirty
            .remove_if(&user, |_, current| *current == generation)
            .is_some();

        if cleared && self.retired.remove(&user).is_some() {
            self.records.remove(&user);
            debug!("Evicted retired record for {} after successful save", user);
        }
        cleared
    }

    pub fn is_dirty(&self, user: Uuid) -> bool {
        self.dirty.contains_key(&user)
    }

    /// Generation stamped by the most recent `mark_dirty`, if dirty
    pub fn dirty_generation(&self, user: Uuid) -> Option<u64> {
        self.dirty.get(&user).map(|g| *g.value())
    }

    /// Snapshot of dirty users; safe to iterate while mutations continue
    pub fn dirty_users(&self) -> HashSet<Uuid> {
        self.dirty.iter().map(|e| *e.key()).collect()
    }

    /// Evict a record and clear its dirty flag
    pub fn remove(&self, user: Uuid) -> Option<VaultRecord> {
        self.dirty.remove(&user);
        self.retired.remove(&user);
        self.records.remove(&user).map(|(_, record)| record)
    }

    /// Keep a departed user's dirty record until a save succeeds, then evict
    pub fn retire(&self, user: Uuid) {
        if self.records.contains_key(&user) {
            self.retired.insert(user);
        }
    }

    /// Undo `retire` when the user comes back
    pub fn reinstate(&self, user: Uuid) {
        self.retired.remove(&user);
    }

    pub fn is_retired(&self, user: Uuid) -> bool {
        self.retired.contains(&user)
    }

    pub fn contains(&self, user: Uuid) -> bool {
        self.records.contains_key(&user)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    pub fn cached_users(&self) -> HashSet<Uuid> {
        self.records.iter().map(|e| *e.key()).collect()
    }

    pub fn stats(&self) -> CacheStats {
        let total = self.records.len();
        let dirty = self.dirty.len();
        CacheStats {
            total,
            clean: total.saturating_sub(dirty),
            dirty,
        }
    }

    /// Drop clean records of users not in `active`. Dirty records stay for the
    /// next flush. Returns how many were evicted.
    pub fn evict_inactive(&self, active: &HashSet<Uuid>) -> usize {
        let mut evicted = 0;
        for user in self.cached_users() {
            if active.contains(&user) || self.is_dirty(user) {
                continue;
            }
            if self
                .records
                .remove_if(&user, |id, _| !self.dirty.contains_key(id))
                .is_some()
            {
                self.retired.remove(&user);
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!("Evicted {} inactive record(s) from cache", evicted);
        }
        evicted
    }

    /// Drop everything
    pub fn clear(&self) {
        self.records.clear();
        self.dirty.clear();
        self.retired.clear();
    }
}

fn check_key(user: Uuid, record: &VaultRecord) -> VaultResult<()> {
    if user.is_nil() {
        return Err(VaultError::InvalidArgument(
            "user id must not be nil".to_string(),
        ));
    }
    if record.user() != user {
        return Err(VaultError::InvalidArgument(format!(
            "record for {} cannot be cached under {}",
            record.user(),
            user
        )));
    }
    Ok(())
}

impl Default for RecordCache {
    fn default() -> Self {
        Self::new(DEFAULT_WARN_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::{ItemBlob, VaultPage};
    use std::sync::Arc;

    fn record(user: Uuid) -> VaultRecord {
        let mut record = VaultRecord::empty(user);
        record.set_page(VaultPage::empty(1, 9).with_slot(0, Some(ItemBlob::from("a"))));
        record
    }

    #[test]
    fn get_does_not_load() {
        let cache = RecordCache::default();
        assert!(cache.get(Uuid::new_v4()).is_none());
    }

    #[test]
    fn put_is_clean() {
        let cache = RecordCache::default();
        let user = Uuid::new_v4();
        cache.put(user, record(user)).unwrap();

        assert_eq!(cache.get(user), Some(record(user)));
        assert!(!cache.is_dirty(user));
    }

    #[test]
    fn put_rejects_mismatched_or_nil_user() {
        let cache = RecordCache::default();
        let user = Uuid::new_v4();

        let err = cache.put(Uuid::new_v4(), record(user)).unwrap_err();
        assert!(matches!(err, VaultError::InvalidArgument(_)));

        let err = cache.put(Uuid::nil(), VaultRecord::empty(Uuid::nil())).unwrap_err();
        assert!(matches!(err, VaultError::InvalidArgument(_)));
        assert!(cache.is_empty());
    }

    #[test]
    fn put_if_absent_keeps_existing() {
        let cache = RecordCache::default();
        let user = Uuid::new_v4();
        cache.put(user, record(user)).unwrap();

        assert!(!cache.put_if_absent(user, VaultRecord::empty(user)).unwrap());
        assert_eq!(cache.get(user), Some(record(user)));

        let other = Uuid::new_v4();
        assert!(cache.put_if_absent(other, VaultRecord::empty(other)).unwrap());
    }

    #[test]
    fn dirty_flag_is_idempotent() {
        let cache = RecordCache::default();
        let user = Uuid::new_v4();

        cache.mark_dirty(user);
        cache.mark_dirty(user);
        assert!(cache.is_dirty(user));
        assert_eq!(cache.dirty_count(), 1);

        cache.clear_dirty(user);
        cache.clear_dirty(user);
        assert!(!cache.is_dirty(user));
    }

    #[test]
    fn dirty_users_is_a_snapshot() {
        let cache = RecordCache::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        cache.mark_dirty(a);

        let snapshot = cache.dirty_users();
        cache.mark_dirty(b);

        assert_eq!(snapshot, HashSet::from([a]));
        assert_eq!(cache.dirty_users().len(), 2);
    }

    #[test]
    fn update_marks_dirty_only_on_change() {
        let cache = RecordCache::default();
        let user = Uuid::new_v4();
        cache.put(user, VaultRecord::empty(user)).unwrap();

        assert_eq!(cache.update(user, |_| false), Some(false));
        assert!(!cache.is_dirty(user));

        let changed = cache.update(user, |r| {
            r.write_slots(1, 9, &[Some(ItemBlob::from("x"))], 9)
        });
        assert_eq!(changed, Some(true));
        assert!(cache.is_dirty(user));
        assert_eq!(cache.get(user).unwrap().item_count(), 1);

        assert_eq!(cache.update(Uuid::new_v4(), |_| true), None);
    }

    #[test]
    fn stale_generation_does_not_clear() {
        let cache = RecordCache::default();
        let user = Uuid::new_v4();
        cache.mark_dirty(user);
        let seen = cache.dirty_generation(user).unwrap();

        // an edit lands while the save is in flight
        cache.mark_dirty(user);
        assert!(!cache.clear_dirty_if(user, seen));
        assert!(cache.is_dirty(user));

        let current = cache.dirty_generation(user).unwrap();
        assert!(cache.clear_dirty_if(user, current));
        assert!(!cache.is_dirty(user));
    }

    #[test]
    fn remove_clears_dirty() {
        let cache = RecordCache::default();
        let user = Uuid::new_v4();
        cache.put_dirty(user, record(user)).unwrap();

        assert_eq!(cache.remove(user), Some(record(user)));
        assert!(!cache.is_dirty(user));
        assert!(!cache.contains(user));
    }

    #[test]
    fn retired_entry_evicted_after_clean_save() {
        let cache = RecordCache::default();
        let user = Uuid::new_v4();
        cache.put_dirty(user, record(user)).unwrap();
        cache.retire(user);
        assert!(cache.is_retired(user));

        let generation = cache.dirty_generation(user).unwrap();
        assert!(cache.clear_dirty_if(user, generation));
        assert!(!cache.contains(user));
        assert!(!cache.is_retired(user));
    }

    #[test]
    fn reinstated_entry_survives_save() {
        let cache = RecordCache::default();
        let user = Uuid::new_v4();
        cache.put_dirty(user, record(user)).unwrap();
        cache.retire(user);
        cache.reinstate(user);

        let generation = cache.dirty_generation(user).unwrap();
        cache.clear_dirty_if(user, generation);
        assert!(cache.contains(user));
    }

    #[test]
    fn evict_inactive_keeps_active_and_dirty() {
        let cache = RecordCache::default();
        let active = Uuid::new_v4();
        let dirty = Uuid::new_v4();
        let idle = Uuid::new_v4();
        for user in [active, dirty, idle] {
            cache.put(user, record(user)).unwrap();
        }
        cache.mark_dirty(dirty);

        let evicted = cache.evict_inactive(&HashSet::from([active]));
        assert_eq!(evicted, 1);
        assert!(cache.contains(active));
        assert!(cache.contains(dirty));
        assert!(!cache.contains(idle));
    }

    #[test]
    fn stats_counts_clean_and_dirty() {
        let cache = RecordCache::new(1);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        cache.put(a, record(a)).unwrap();
        // crossing the threshold only warns
        cache.put_dirty(b, record(b)).unwrap();

        let stats = cache.stats();
        assert_eq!(
            stats,
            CacheStats {
                total: 2,
                clean: 1,
                dirty: 1
            }
        );
        assert_eq!(stats.to_string(), "cached=2 clean=1 dirty=1");
    }

    #[test]
    fn concurrent_marking_from_threads() {
        let cache = Arc::new(RecordCache::default());
        let users: Vec<Uuid> = (0..32).map(|_| Uuid::new_v4()).collect();

        let handles: Vec<_> = users
            .iter()
            .copied()
            .map(|user| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    cache.put(user, VaultRecord::empty(user)).unwrap();
                    cache.mark_dirty(user);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.len(), 32);
        assert_eq!(cache.dirty_users().len(), 32);
    }
}
