//! Process-local bounded cache (L1).
//!
//! [`LocalCache`] is the innermost storage tier: a concurrent map from uuid
//! to the entity record plus per-entry access metadata. Reads are lock-free
//! relative to other reads; writes use the map's own sharding. Entries carry
//! a dirty flag meaning "not yet durably persisted"; the persistence
//! pipeline clears it once the record reaches the document store.
//!
//! Capacity is bounded: inserts past `max_entries` evict the
//! least-recently-accessed of a random sample of clean entries. Dirty
//! entries are never sampled for eviction. Optional idle expiry drops
//! entries untouched for longer than `max_idle` lazily on access and during
//! sweeps.

use std::time::Duration;

use dashmap::DashMap;
use playergrid_core::entity::{now_millis, EntityRecord};
use rand::Rng;
use uuid::Uuid;

/// How many random entries are examined per eviction decision.
const EVICTION_SAMPLE_COUNT: usize = 8;

/// Per-entry access statistics.
#[derive(Debug, Clone)]
pub struct EntryMeta {
    /// Wall-clock millis when the entry was inserted.
    pub inserted_at: i64,
    /// Wall-clock millis of the last read access.
    pub last_access_time: i64,
    /// Number of read accesses.
    pub hits: u32,
}

impl EntryMeta {
    fn new(now: i64) -> Self {
        Self {
            inserted_at: now,
            last_access_time: now,
            hits: 0,
        }
    }

    fn on_access(&mut self, now: i64) {
        self.hits = self.hits.saturating_add(1);
        self.last_access_time = now;
    }
}

/// A cached record plus its tier-local state.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The cached record.
    pub record: EntityRecord,
    /// `true` while the record has changes not yet persisted to the DB.
    pub dirty: bool,
    /// Access statistics for idle expiry and eviction sampling.
    pub meta: EntryMeta,
}

/// Counters describing cache effectiveness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads answered from this tier.
    pub hits: u64,
    /// Reads that fell through to a lower tier.
    pub misses: u64,
    /// Entries evicted to stay within capacity.
    pub evictions: u64,
    /// Current entry count.
    pub len: usize,
}

/// Bounded concurrent L1 cache.
pub struct LocalCache {
    entries: DashMap<Uuid, CacheEntry>,
    /// Maximum entry count. 0 = unbounded.
    max_entries: usize,
    /// Drop entries unread for this long. `None` = no idle expiry.
    max_idle: Option<Duration>,
    hits: std::sync::atomic::AtomicU64,
    misses: std::sync::atomic::AtomicU64,
    evictions: std::sync::atomic::AtomicU64,
}

impl LocalCache {
    /// Creates a cache bounded to `max_entries` (0 = unbounded) with
    /// optional idle expiry.
    #[must_use]
    pub fn new(max_entries: usize, max_idle: Option<Duration>) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
            max_idle,
            hits: std::sync::atomic::AtomicU64::new(0),
            misses: std::sync::atomic::AtomicU64::new(0),
            evictions: std::sync::atomic::AtomicU64::new(0),
        }
    }

    #[allow(clippy::cast_possible_wrap)]
    fn idle_expired(&self, meta: &EntryMeta, now: i64) -> bool {
        self.max_idle
            .is_some_and(|idle| now - meta.last_access_time > idle.as_millis() as i64)
    }

    /// Reads a record, updating access statistics when `touch` is set.
    ///
    /// Idle-expired entries are dropped on the way out and read as a miss,
    /// unless they are dirty (unpersisted changes are never silently lost).
    pub fn get(&self, uuid: Uuid, touch: bool) -> Option<EntityRecord> {
        use std::sync::atomic::Ordering;

        let now = now_millis();
        let expired = {
            let Some(mut entry) = self.entries.get_mut(&uuid) else {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            };
            if self.idle_expired(&entry.meta, now) && !entry.dirty {
                true
            } else {
                if touch {
                    entry.meta.on_access(now);
                }
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.record.clone());
            }
        };
        if expired {
            self.entries.remove(&uuid);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Returns the full entry (record + flags) without touching statistics.
    #[must_use]
    pub fn peek(&self, uuid: Uuid) -> Option<CacheEntry> {
        self.entries.get(&uuid).map(|e| e.clone())
    }

    /// Inserts or replaces a record.
    pub fn insert(&self, record: EntityRecord, dirty: bool) {
        let now = now_millis();
        let uuid = record.uuid;
        match self.entries.get_mut(&uuid) {
            Some(mut entry) => {
                entry.record = record;
                // A clean overwrite never hides pending changes.
                entry.dirty = entry.dirty || dirty;
                entry.meta.last_access_time = now;
            }
            None => {
                self.entries.insert(
                    uuid,
                    CacheEntry {
                        record,
                        dirty,
                        meta: EntryMeta::new(now),
                    },
                );
            }
        }
        self.maybe_evict();
    }

    /// Clears the dirty flag, but only if the entry still holds `version`.
    ///
    /// A concurrent save that bumped the version keeps its dirty flag so the
    /// newer state is not skipped by the next persistence run.
    pub fn mark_clean(&self, uuid: Uuid, version: u64) {
        if let Some(mut entry) = self.entries.get_mut(&uuid) {
            if entry.record.version <= version {
                entry.dirty = false;
            }
        }
    }

    /// Drops an entry regardless of state. Returns the removed record.
    pub fn invalidate(&self, uuid: Uuid) -> Option<EntityRecord> {
        self.entries.remove(&uuid).map(|(_, e)| e.record)
    }

    /// Drops an entry only if it has no unpersisted changes.
    ///
    /// Used by cross-node sync: a dirty local entry outranks a remote
    /// invalidation and is reconciled by merge on its next save instead.
    pub fn invalidate_clean(&self, uuid: Uuid) -> bool {
        self.entries
            .remove_if(&uuid, |_, entry| !entry.dirty)
            .is_some()
    }

    /// Point-in-time snapshot of all entries.
    #[must_use]
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    /// Snapshot of entries with unpersisted changes.
    #[must_use]
    pub fn dirty_entries(&self) -> Vec<EntityRecord> {
        self.entries
            .iter()
            .filter(|e| e.value().dirty)
            .map(|e| e.value().record.clone())
            .collect()
    }

    /// All resident uuids.
    #[must_use]
    pub fn uuids(&self) -> Vec<Uuid> {
        self.entries.iter().map(|e| *e.key()).collect()
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current effectiveness counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        use std::sync::atomic::Ordering;
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            len: self.entries.len(),
        }
    }

    /// Drops idle-expired clean entries. Returns how many were removed.
    pub fn sweep_idle(&self) -> usize {
        let now = now_millis();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.dirty || !self.idle_expired(&entry.meta, now));
        before - self.entries.len()
    }

    /// Evicts sampled least-recently-accessed clean entries while over
    /// capacity.
    fn maybe_evict(&self) {
        use std::sync::atomic::Ordering;

        if self.max_entries == 0 {
            return;
        }
        while self.entries.len() > self.max_entries {
            let Some(victim) = self.sample_eviction_candidate() else {
                // Everything sampled was dirty; try again next insert.
                return;
            };
            if self.entries.remove_if(&victim, |_, e| !e.dirty).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            } else {
                return;
            }
        }
    }

    /// Reservoir-samples clean entries and returns the least recently
    /// accessed one.
    fn sample_eviction_candidate(&self) -> Option<Uuid> {
        let mut rng = rand::rng();
        let mut reservoir: Vec<(Uuid, i64)> = Vec::with_capacity(EVICTION_SAMPLE_COUNT);

        let mut seen = 0_usize;
        for entry in self.entries.iter().filter(|e| !e.value().dirty) {
            let pair = (*entry.key(), entry.value().meta.last_access_time);
            if seen < EVICTION_SAMPLE_COUNT {
                reservoir.push(pair);
            } else {
                let j = rng.random_range(0..=seen);
                if j < EVICTION_SAMPLE_COUNT {
                    reservoir[j] = pair;
                }
            }
            seen += 1;
        }

        reservoir
            .into_iter()
            .min_by_key(|(_, last_access)| *last_access)
            .map(|(uuid, _)| uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> EntityRecord {
        EntityRecord::new(Uuid::new_v4(), "guild")
    }

    #[test]
    fn insert_then_get_round_trip() {
        let cache = LocalCache::new(0, None);
        let r = record();
        cache.insert(r.clone(), false);
        assert_eq!(cache.get(r.uuid, false), Some(r));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn get_with_touch_updates_access_stats() {
        let cache = LocalCache::new(0, None);
        let r = record();
        cache.insert(r.clone(), false);

        cache.get(r.uuid, true);
        cache.get(r.uuid, true);
        let entry = cache.peek(r.uuid).unwrap();
        assert_eq!(entry.meta.hits, 2);
    }

    #[test]
    fn stats_count_hits_and_misses() {
        let cache = LocalCache::new(0, None);
        let r = record();
        cache.insert(r.clone(), false);

        cache.get(r.uuid, false);
        cache.get(Uuid::new_v4(), false);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn dirty_flag_survives_clean_overwrite() {
        let cache = LocalCache::new(0, None);
        let r = record();
        cache.insert(r.clone(), true);
        cache.insert(r.clone(), false);
        assert!(cache.peek(r.uuid).unwrap().dirty);
    }

    #[test]
    fn mark_clean_respects_version() {
        let cache = LocalCache::new(0, None);
        let mut r = record();
        r.version = 3;
        cache.insert(r.clone(), true);

        // Persisted an older version: entry stays dirty.
        cache.mark_clean(r.uuid, 2);
        assert!(cache.peek(r.uuid).unwrap().dirty);

        cache.mark_clean(r.uuid, 3);
        assert!(!cache.peek(r.uuid).unwrap().dirty);
    }

    #[test]
    fn invalidate_clean_skips_dirty_entries() {
        let cache = LocalCache::new(0, None);
        let dirty = record();
        let clean = record();
        cache.insert(dirty.clone(), true);
        cache.insert(clean.clone(), false);

        assert!(!cache.invalidate_clean(dirty.uuid));
        assert!(cache.invalidate_clean(clean.uuid));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn dirty_entries_lists_only_dirty() {
        let cache = LocalCache::new(0, None);
        let dirty = record();
        cache.insert(dirty.clone(), true);
        cache.insert(record(), false);

        let pending = cache.dirty_entries();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].uuid, dirty.uuid);
    }

    #[test]
    fn bounded_cache_evicts_clean_entries() {
        let cache = LocalCache::new(4, None);
        for _ in 0..10 {
            cache.insert(record(), false);
        }
        assert!(cache.len() <= 4);
        assert!(cache.stats().evictions >= 6);
    }

    #[test]
    fn bounded_cache_never_evicts_dirty_entries() {
        let cache = LocalCache::new(2, None);
        let dirty: Vec<EntityRecord> = (0..3).map(|_| record()).collect();
        for r in &dirty {
            cache.insert(r.clone(), true);
        }
        for _ in 0..5 {
            cache.insert(record(), false);
        }
        for r in &dirty {
            assert!(cache.peek(r.uuid).is_some(), "dirty entry was evicted");
        }
    }

    #[test]
    fn idle_expiry_drops_stale_clean_entries() {
        let cache = LocalCache::new(0, Some(Duration::from_millis(20)));
        let r = record();
        cache.insert(r.clone(), false);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(cache.get(r.uuid, false), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn idle_expiry_spares_dirty_entries() {
        let cache = LocalCache::new(0, Some(Duration::from_millis(10)));
        let r = record();
        cache.insert(r.clone(), true);

        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get(r.uuid, false).is_some());
        assert_eq!(cache.sweep_idle(), 0);
    }

    #[test]
    fn sweep_idle_removes_expired_entries() {
        let cache = LocalCache::new(0, Some(Duration::from_millis(10)));
        cache.insert(record(), false);
        cache.insert(record(), false);

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.sweep_idle(), 2);
        assert!(cache.is_empty());
    }
}
