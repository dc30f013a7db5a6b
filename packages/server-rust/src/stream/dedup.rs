//! Per-node duplicate suppression for record-limited accepters.
//!
//! [`RecentMessageSet`] remembers which message ids this node has already
//! processed. The set is bounded two ways: entries older than the TTL are
//! dropped, and when the capacity is exceeded the oldest entries go first.
//! Suppression is per-node and time-bounded only; cross-node dedup is not
//! provided, so handlers still rely on idempotent semantics.

use std::time::Duration;

use dashmap::DashMap;
use playergrid_core::entity::now_millis;
use playergrid_core::task::MessageId;

/// Default retention for processed message ids.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(10 * 60);

/// Default capacity bound.
pub const DEFAULT_DEDUP_CAPACITY: usize = 4_096;

/// Bounded, TTL-limited set of recently processed message ids.
pub struct RecentMessageSet {
    seen: DashMap<MessageId, i64>,
    capacity: usize,
    ttl_ms: i64,
}

impl RecentMessageSet {
    /// Creates a set with the given bounds.
    #[allow(clippy::cast_possible_wrap)]
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            capacity: capacity.max(1),
            ttl_ms: ttl.as_millis() as i64,
        }
    }

    /// Whether this id was processed within the retention window.
    #[must_use]
    pub fn contains(&self, id: MessageId) -> bool {
        let now = now_millis();
        // Copy the timestamp out so the shard read guard is released
        // before the removal below takes the write side.
        let expired = {
            let Some(at) = self.seen.get(&id) else {
                return false;
            };
            now - *at > self.ttl_ms
        };
        if expired {
            self.seen.remove(&id);
            return false;
        }
        true
    }

    /// Records an id as processed. Returns `true` if it was new.
    pub fn observe(&self, id: MessageId) -> bool {
        let now = now_millis();
        let fresh = self.seen.insert(id, now).is_none();
        if self.seen.len() > self.capacity {
            self.evict(now);
        }
        fresh
    }

    /// Number of retained ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Drops expired entries; if still over capacity, drops the oldest ids.
    fn evict(&self, now: i64) {
        self.seen.retain(|_, at| now - *at <= self.ttl_ms);
        while self.seen.len() > self.capacity {
            let Some(oldest) = self
                .seen
                .iter()
                .min_by_key(|entry| (*entry.value(), *entry.key()))
                .map(|entry| *entry.key())
            else {
                return;
            };
            self.seen.remove(&oldest);
        }
    }
}

impl Default for RecentMessageSet {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY, DEFAULT_DEDUP_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_then_contains() {
        let set = RecentMessageSet::default();
        let id = MessageId::new(100, 0);
        assert!(!set.contains(id));
        assert!(set.observe(id));
        assert!(set.contains(id));
        assert!(!set.observe(id));
    }

    #[test]
    fn capacity_bound_drops_oldest() {
        let set = RecentMessageSet::new(3, Duration::from_secs(600));
        for i in 0..10 {
            set.observe(MessageId::new(100, i));
        }
        assert!(set.len() <= 3);
        // The most recent id always survives the bound.
        assert!(set.contains(MessageId::new(100, 9)));
    }

    #[test]
    fn expired_entries_read_as_absent() {
        let set = RecentMessageSet::new(16, Duration::from_millis(10));
        let id = MessageId::new(100, 0);
        set.observe(id);
        std::thread::sleep(Duration::from_millis(40));
        assert!(!set.contains(id));
    }
}
