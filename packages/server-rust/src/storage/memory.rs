//! In-process implementations of the tier collaborators.
//!
//! [`MemoryRemoteCache`] implements [`RemoteCache`](super::RemoteCache) and
//! [`MemoryDocumentStore`] implements [`DocumentStore`](super::DocumentStore)
//! entirely in memory. Both are shareable across service instances in one
//! process, which makes them stand-ins for a real Redis/Mongo deployment in
//! tests and single-process setups: two services holding the same
//! `Arc<MemoryRemoteCache>` observe each other's writes exactly as two nodes
//! sharing a cache would.
//!
//! Atomicity: the KV side relies on the concurrent map's per-slot exclusive
//! entry access; each stream is guarded by its own mutex.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use playergrid_core::entity::{now_millis, EntityRecord};
use playergrid_core::task::{MessageId, StreamTask};
use uuid::Uuid;

use super::document_store::DocumentStore;
use super::remote_cache::{KeyTtl, LockGuard, RemoteCache};

// ---------------------------------------------------------------------------
// MemoryRemoteCache
// ---------------------------------------------------------------------------

/// How long a delivered-but-unacked stream message stays owned by its
/// consumer before it may be redelivered.
pub const DEFAULT_OWNERSHIP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct KvEntry {
    value: String,
    /// Absolute expiry in millis since epoch. `None` = unbounded.
    expires_at: Option<i64>,
}

impl KvEntry {
    fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone)]
struct StreamEntry {
    id: MessageId,
    task: StreamTask,
    published_at: i64,
}

#[derive(Debug, Clone)]
struct PendingDelivery {
    consumer: String,
    delivered_at: i64,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Highest id ever delivered to this group.
    cursor: Option<MessageId>,
    /// Delivered but not yet acknowledged messages.
    pending: BTreeMap<MessageId, PendingDelivery>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: VecDeque<StreamEntry>,
    last_id: Option<MessageId>,
    groups: HashMap<String, GroupState>,
}

/// In-memory [`RemoteCache`]: KV with TTL, ordered streams with consumer
/// groups, and per-key read-write locks.
///
/// Lock `hold` durations are advisory here: in-process guards cannot leak
/// past a crashed holder the way a distributed lease can, so only the wait
/// timeout is enforced.
pub struct MemoryRemoteCache {
    kv: DashMap<String, KvEntry>,
    streams: DashMap<String, Arc<Mutex<StreamState>>>,
    locks: DashMap<String, Arc<tokio::sync::RwLock<()>>>,
    ownership_timeout: Duration,
}

impl MemoryRemoteCache {
    /// Creates an empty cache with the default ownership timeout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            kv: DashMap::new(),
            streams: DashMap::new(),
            locks: DashMap::new(),
            ownership_timeout: DEFAULT_OWNERSHIP_TIMEOUT,
        }
    }

    /// Overrides how long unacked deliveries stay owned before redelivery.
    #[must_use]
    pub fn with_ownership_timeout(mut self, timeout: Duration) -> Self {
        self.ownership_timeout = timeout;
        self
    }

    fn stream_state(&self, stream: &str) -> Arc<Mutex<StreamState>> {
        self.streams
            .entry(stream.to_string())
            .or_default()
            .clone()
    }

    fn lock_cell(&self, key: &str) -> Arc<tokio::sync::RwLock<()>> {
        self.locks.entry(key.to_string()).or_default().clone()
    }

    /// Reads a live entry, dropping it if its TTL elapsed.
    fn live(&self, key: &str, now: i64) -> Option<KvEntry> {
        let entry = self.kv.get(key)?.clone();
        if entry.is_expired(now) {
            drop(self.kv.remove(key));
            return None;
        }
        Some(entry)
    }
}

impl Default for MemoryRemoteCache {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::cast_possible_wrap)]
fn expiry_from(now: i64, ttl: Duration) -> i64 {
    now + ttl.as_millis() as i64
}

#[async_trait]
impl RemoteCache for MemoryRemoteCache {
    // --- Key-value with TTL ---

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.live(key, now_millis()).map(|e| e.value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> anyhow::Result<()> {
        let now = now_millis();
        self.kv.insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| expiry_from(now, ttl)),
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> anyhow::Result<bool> {
        let now = now_millis();
        match self.kv.remove(key) {
            Some((_, entry)) => Ok(!entry.is_expired(now)),
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> anyhow::Result<KeyTtl> {
        let now = now_millis();
        Ok(match self.live(key, now) {
            None => KeyTtl::Missing,
            Some(KvEntry {
                expires_at: None, ..
            }) => KeyTtl::Unbounded,
            Some(KvEntry {
                expires_at: Some(at),
                ..
            }) => KeyTtl::Expires(Duration::from_millis(
                u64::try_from(at.saturating_sub(now)).unwrap_or(0),
            )),
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> anyhow::Result<bool> {
        let now = now_millis();
        let Some(mut entry) = self.kv.get_mut(key) else {
            return Ok(false);
        };
        if entry.is_expired(now) {
            drop(entry);
            self.kv.remove(key);
            return Ok(false);
        }
        entry.expires_at = Some(expiry_from(now, ttl));
        Ok(true)
    }

    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> anyhow::Result<i64> {
        let now = now_millis();
        // The entry slot is held exclusively for the whole read-modify-write.
        let mut slot = self.kv.entry(key.to_string()).or_insert_with(|| KvEntry {
            value: "0".to_string(),
            expires_at: Some(expiry_from(now, ttl)),
        });
        if slot.is_expired(now) {
            slot.value = "0".to_string();
            slot.expires_at = Some(expiry_from(now, ttl));
        }
        let current: i64 = slot.value.parse().unwrap_or(0);
        let next = current + 1;
        slot.value = next.to_string();
        Ok(next)
    }

    async fn scan_keys(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let now = now_millis();
        let mut keys: Vec<String> = self
            .kv
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && !entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort_unstable();
        Ok(keys)
    }

    // --- Ordered streams with consumer groups ---

    async fn stream_add(&self, stream: &str, task: &StreamTask) -> anyhow::Result<MessageId> {
        let state = self.stream_state(stream);
        let mut state = state.lock();
        let now = now_millis();
        let id = match state.last_id {
            Some(last) if last.millis >= now => MessageId::new(last.millis, last.seq + 1),
            _ => MessageId::new(now, 0),
        };
        state.last_id = Some(id);
        state.entries.push_back(StreamEntry {
            id,
            task: task.clone(),
            published_at: now,
        });
        Ok(id)
    }

    async fn stream_read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> anyhow::Result<Vec<(MessageId, StreamTask)>> {
        let state = self.stream_state(stream);
        let mut state = state.lock();
        let now = now_millis();
        #[allow(clippy::cast_possible_wrap)]
        let ownership_ms = self.ownership_timeout.as_millis() as i64;

        let by_id: HashMap<MessageId, StreamTask> = state
            .entries
            .iter()
            .map(|e| (e.id, e.task.clone()))
            .collect();
        let group_state = state.groups.entry(group.to_string()).or_default();

        let mut delivered: Vec<(MessageId, StreamTask)> = Vec::new();

        // Reclaim deliveries whose ownership lapsed; drop pendings whose
        // entry was removed from the stream.
        let mut stale: Vec<MessageId> = Vec::new();
        for (id, pending) in &mut group_state.pending {
            if !by_id.contains_key(id) {
                stale.push(*id);
                continue;
            }
            if delivered.len() < count && pending.delivered_at + ownership_ms <= now {
                tracing::trace!(
                    id = %id,
                    previous_owner = %pending.consumer,
                    "reclaiming timed-out delivery"
                );
                pending.consumer = consumer.to_string();
                pending.delivered_at = now;
                delivered.push((*id, by_id[id].clone()));
            }
        }
        for id in stale {
            group_state.pending.remove(&id);
        }

        // Deliver new messages past the group cursor.
        let cursor = group_state.cursor;
        for (id, task) in by_id
            .iter()
            .filter(|(id, _)| cursor.is_none_or(|c| **id > c))
            .collect::<BTreeMap<_, _>>()
        {
            if delivered.len() >= count {
                break;
            }
            group_state.pending.insert(
                *id,
                PendingDelivery {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                },
            );
            group_state.cursor = Some(group_state.cursor.map_or(*id, |c| c.max(*id)));
            delivered.push((*id, task.clone()));
        }

        delivered.sort_by_key(|(id, _)| *id);
        Ok(delivered)
    }

    async fn stream_ack(&self, stream: &str, group: &str, id: MessageId) -> anyhow::Result<bool> {
        let state = self.stream_state(stream);
        let mut state = state.lock();
        Ok(state
            .groups
            .get_mut(group)
            .is_some_and(|g| g.pending.remove(&id).is_some()))
    }

    async fn stream_remove(&self, stream: &str, id: MessageId) -> anyhow::Result<bool> {
        let state = self.stream_state(stream);
        let mut state = state.lock();
        let before = state.entries.len();
        state.entries.retain(|e| e.id != id);
        for group in state.groups.values_mut() {
            group.pending.remove(&id);
        }
        Ok(state.entries.len() != before)
    }

    async fn stream_trim_expired(&self, stream: &str) -> anyhow::Result<usize> {
        let state = self.stream_state(stream);
        let mut state = state.lock();
        let now = now_millis();
        let before = state.entries.len();
        #[allow(clippy::cast_possible_wrap)]
        state.entries.retain(|e| {
            e.task.expiry_ms == 0 || e.published_at + e.task.expiry_ms as i64 > now
        });
        let live: Vec<MessageId> = state.entries.iter().map(|e| e.id).collect();
        for group in state.groups.values_mut() {
            group.pending.retain(|id, _| live.contains(id));
        }
        Ok(before - state.entries.len())
    }

    // --- Distributed read-write lock ---

    async fn acquire_read(
        &self,
        key: &str,
        wait: Duration,
        _hold: Duration,
    ) -> anyhow::Result<Option<LockGuard>> {
        let cell = self.lock_cell(key);
        match tokio::time::timeout(wait, cell.read_owned()).await {
            Ok(guard) => Ok(Some(LockGuard::new(guard))),
            Err(_) => Ok(None),
        }
    }

    async fn acquire_write(
        &self,
        key: &str,
        wait: Duration,
        _hold: Duration,
    ) -> anyhow::Result<Option<LockGuard>> {
        let cell = self.lock_cell(key);
        match tokio::time::timeout(wait, cell.write_owned()).await {
            Ok(guard) => Ok(Some(LockGuard::new(guard))),
            Err(_) => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryDocumentStore
// ---------------------------------------------------------------------------

/// In-memory [`DocumentStore`] over typed records.
///
/// Field-path queries serialize each candidate to its JSON document and walk
/// the dot-path, so path semantics match what a real document store would
/// index (`"attributes.name"` equality, `"relationships.member_of"` set
/// containment).
pub struct MemoryDocumentStore {
    collections: DashMap<String, DashMap<Uuid, EntityRecord>>,
    indexes: Mutex<Vec<(String, String, bool)>>,
}

impl MemoryDocumentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            collections: DashMap::new(),
            indexes: Mutex::new(Vec::new()),
        }
    }

    /// Declared indexes, for introspection in tests.
    #[must_use]
    pub fn declared_indexes(&self) -> Vec<(String, String, bool)> {
        self.indexes.lock().clone()
    }

    /// Number of documents in a collection.
    #[must_use]
    pub fn len(&self, collection: &str) -> usize {
        self.collections.get(collection).map_or(0, |c| c.len())
    }

    /// Whether a collection is empty (or absent).
    #[must_use]
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    fn matches_path(record: &EntityRecord, path: &str, value: &str) -> bool {
        let Ok(doc) = serde_json::to_value(record) else {
            return false;
        };
        let mut node = &doc;
        for segment in path.split('.') {
            match node.get(segment) {
                Some(next) => node = next,
                None => return false,
            }
        }
        match node {
            serde_json::Value::String(s) => s == value,
            serde_json::Value::Array(items) => items
                .iter()
                .any(|item| item.as_str().is_some_and(|s| s == value)),
            other => other.to_string() == value,
        }
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn upsert_batch(
        &self,
        collection: &str,
        records: &[EntityRecord],
    ) -> anyhow::Result<()> {
        let docs = self
            .collections
            .entry(collection.to_string())
            .or_default();
        for record in records {
            docs.insert(record.uuid, record.clone());
        }
        Ok(())
    }

    async fn find_by_uuid(
        &self,
        collection: &str,
        uuid: Uuid,
    ) -> anyhow::Result<Option<EntityRecord>> {
        Ok(self
            .collections
            .get(collection)
            .and_then(|docs| docs.get(&uuid).map(|r| r.clone())))
    }

    async fn find_by_field(
        &self,
        collection: &str,
        path: &str,
        value: &str,
    ) -> anyhow::Result<Vec<EntityRecord>> {
        let Some(docs) = self.collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut found: Vec<EntityRecord> = docs
            .iter()
            .filter(|entry| Self::matches_path(entry.value(), path, value))
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by_key(|r| r.uuid);
        Ok(found)
    }

    async fn find_all(&self, collection: &str) -> anyhow::Result<Vec<EntityRecord>> {
        let Some(docs) = self.collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut all: Vec<EntityRecord> = docs.iter().map(|entry| entry.value().clone()).collect();
        all.sort_by_key(|r| r.uuid);
        Ok(all)
    }

    async fn ensure_index(
        &self,
        collection: &str,
        path: &str,
        sparse: bool,
    ) -> anyhow::Result<()> {
        let mut indexes = self.indexes.lock();
        let entry = (collection.to_string(), path.to_string(), sparse);
        if !indexes.contains(&entry) {
            indexes.push(entry);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(action: &str) -> StreamTask {
        StreamTask::new(action, "payload", 60_000)
    }

    // --- KV ---

    #[tokio::test]
    async fn set_get_round_trip() {
        let cache = MemoryRemoteCache::new();
        cache.set("k", "v", None).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(cache.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_key_reads_as_absent() {
        let cache = MemoryRemoteCache::new();
        cache
            .set("k", "v", Some(Duration::from_millis(30)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert_eq!(cache.ttl("k").await.unwrap(), KeyTtl::Missing);
    }

    #[tokio::test]
    async fn ttl_reports_all_three_states() {
        let cache = MemoryRemoteCache::new();
        assert_eq!(cache.ttl("k").await.unwrap(), KeyTtl::Missing);

        cache.set("k", "v", None).await.unwrap();
        assert_eq!(cache.ttl("k").await.unwrap(), KeyTtl::Unbounded);

        cache.expire("k", Duration::from_secs(60)).await.unwrap();
        match cache.ttl("k").await.unwrap() {
            KeyTtl::Expires(left) => assert!(left <= Duration::from_secs(60)),
            other => panic!("expected Expires, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expire_on_missing_key_returns_false() {
        let cache = MemoryRemoteCache::new();
        assert!(!cache.expire("k", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn increment_applies_ttl_only_on_create() {
        let cache = MemoryRemoteCache::new();
        assert_eq!(
            cache
                .increment_with_ttl("n", Duration::from_secs(60))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            cache
                .increment_with_ttl("n", Duration::from_secs(60))
                .await
                .unwrap(),
            2
        );
        assert!(matches!(
            cache.ttl("n").await.unwrap(),
            KeyTtl::Expires(_)
        ));
    }

    #[tokio::test]
    async fn scan_keys_filters_by_prefix() {
        let cache = MemoryRemoteCache::new();
        cache.set("a:1", "x", None).await.unwrap();
        cache.set("a:2", "x", None).await.unwrap();
        cache.set("b:1", "x", None).await.unwrap();
        assert_eq!(
            cache.scan_keys("a:").await.unwrap(),
            vec!["a:1".to_string(), "a:2".to_string()]
        );
    }

    // --- Streams ---

    #[tokio::test]
    async fn stream_ids_are_strictly_increasing() {
        let cache = MemoryRemoteCache::new();
        let mut last = None;
        for _ in 0..50 {
            let id = cache.stream_add("s", &task("a")).await.unwrap();
            if let Some(prev) = last {
                assert!(id > prev);
            }
            last = Some(id);
        }
    }

    #[tokio::test]
    async fn read_group_delivers_in_publish_order() {
        let cache = MemoryRemoteCache::new();
        for i in 0..5 {
            cache
                .stream_add("s", &task(&format!("a{i}")))
                .await
                .unwrap();
        }
        let read = cache
            .stream_read_group("s", "g", "c1", 10)
            .await
            .unwrap();
        let actions: Vec<&str> = read.iter().map(|(_, t)| t.action_name.as_str()).collect();
        assert_eq!(actions, vec!["a0", "a1", "a2", "a3", "a4"]);
    }

    #[tokio::test]
    async fn unacked_message_is_not_redelivered_before_ownership_timeout() {
        let cache = MemoryRemoteCache::new();
        cache.stream_add("s", &task("a")).await.unwrap();

        let first = cache.stream_read_group("s", "g", "c1", 10).await.unwrap();
        assert_eq!(first.len(), 1);

        let second = cache.stream_read_group("s", "g", "c1", 10).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn unacked_message_redelivers_after_ownership_timeout() {
        let cache =
            MemoryRemoteCache::new().with_ownership_timeout(Duration::from_millis(20));
        let id = cache.stream_add("s", &task("a")).await.unwrap();

        let first = cache.stream_read_group("s", "g", "c1", 10).await.unwrap();
        assert_eq!(first.len(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let second = cache.stream_read_group("s", "g", "c2", 10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].0, id);
    }

    #[tokio::test]
    async fn acked_message_is_never_redelivered() {
        let cache =
            MemoryRemoteCache::new().with_ownership_timeout(Duration::from_millis(10));
        let id = cache.stream_add("s", &task("a")).await.unwrap();

        cache.stream_read_group("s", "g", "c1", 10).await.unwrap();
        assert!(cache.stream_ack("s", "g", id).await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache
            .stream_read_group("s", "g", "c1", 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn groups_fan_out_independently() {
        let cache = MemoryRemoteCache::new();
        cache.stream_add("s", &task("a")).await.unwrap();

        assert_eq!(
            cache.stream_read_group("s", "g1", "c", 10).await.unwrap().len(),
            1
        );
        assert_eq!(
            cache.stream_read_group("s", "g2", "c", 10).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn stream_remove_deletes_from_stream_and_pending() {
        let cache = MemoryRemoteCache::new();
        let id = cache.stream_add("s", &task("a")).await.unwrap();
        cache.stream_read_group("s", "g", "c", 10).await.unwrap();

        assert!(cache.stream_remove("s", id).await.unwrap());
        assert!(!cache.stream_remove("s", id).await.unwrap());
        assert!(!cache.stream_ack("s", "g", id).await.unwrap());
    }

    #[tokio::test]
    async fn trim_expired_drops_old_tasks() {
        let cache = MemoryRemoteCache::new();
        cache
            .stream_add("s", &StreamTask::new("a", "p", 10))
            .await
            .unwrap();
        cache
            .stream_add("s", &StreamTask::new("b", "p", 600_000))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.stream_trim_expired("s").await.unwrap(), 1);
        let remaining = cache.stream_read_group("s", "g", "c", 10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].1.action_name, "b");
    }

    // --- Locks ---

    #[tokio::test]
    async fn write_lock_excludes_writers_until_dropped() {
        let cache = Arc::new(MemoryRemoteCache::new());
        let wait = Duration::from_millis(20);
        let hold = Duration::from_secs(30);

        let guard = cache.acquire_write("k", wait, hold).await.unwrap();
        assert!(guard.is_some());

        // Second writer times out while the first holds the lock.
        assert!(cache.acquire_write("k", wait, hold).await.unwrap().is_none());

        drop(guard);
        assert!(cache.acquire_write("k", wait, hold).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn readers_share_writers_exclude() {
        let cache = MemoryRemoteCache::new();
        let wait = Duration::from_millis(20);
        let hold = Duration::from_secs(30);

        let r1 = cache.acquire_read("k", wait, hold).await.unwrap();
        let r2 = cache.acquire_read("k", wait, hold).await.unwrap();
        assert!(r1.is_some() && r2.is_some());

        assert!(cache.acquire_write("k", wait, hold).await.unwrap().is_none());
        drop((r1, r2));
        assert!(cache.acquire_write("k", wait, hold).await.unwrap().is_some());
    }

    // --- Document store ---

    fn guild(name: &str) -> EntityRecord {
        EntityRecord::new(Uuid::new_v4(), "guild").with_attribute("name", name)
    }

    #[tokio::test]
    async fn upsert_batch_then_find_by_uuid() {
        let store = MemoryDocumentStore::new();
        let a = guild("Alpha");
        let b = guild("Beta");
        store.upsert_batch("svc", &[a.clone(), b.clone()]).await.unwrap();

        assert_eq!(store.find_by_uuid("svc", a.uuid).await.unwrap(), Some(a));
        assert_eq!(store.len("svc"), 2);
        assert!(store
            .find_by_uuid("svc", Uuid::new_v4())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn upsert_replaces_existing_document() {
        let store = MemoryDocumentStore::new();
        let mut record = guild("Alpha");
        store.upsert_batch("svc", &[record.clone()]).await.unwrap();

        record.set_attribute("name", "Omega");
        record.version = 2;
        store.upsert_batch("svc", &[record.clone()]).await.unwrap();

        let loaded = store.find_by_uuid("svc", record.uuid).await.unwrap().unwrap();
        assert_eq!(loaded.attribute("name"), Some("Omega"));
        assert_eq!(loaded.version, 2);
        assert_eq!(store.len("svc"), 1);
    }

    #[tokio::test]
    async fn find_by_field_walks_attribute_paths() {
        let store = MemoryDocumentStore::new();
        let a = guild("Alpha");
        let b = guild("Beta");
        store.upsert_batch("svc", &[a.clone(), b]).await.unwrap();

        let found = store
            .find_by_field("svc", "attributes.name", "Alpha")
            .await
            .unwrap();
        assert_eq!(found, vec![a]);
    }

    #[tokio::test]
    async fn find_by_field_matches_relationship_membership() {
        let store = MemoryDocumentStore::new();
        let target = Uuid::new_v4();
        let mut a = guild("Alpha");
        a.add_relationship("has_member", target);
        let b = guild("Beta");
        store.upsert_batch("svc", &[a.clone(), b]).await.unwrap();

        let found = store
            .find_by_field("svc", "relationships.has_member", &target.to_string())
            .await
            .unwrap();
        assert_eq!(found, vec![a]);
    }

    #[tokio::test]
    async fn find_by_entity_type() {
        let store = MemoryDocumentStore::new();
        let player = EntityRecord::new_player(Uuid::new_v4());
        store
            .upsert_batch("svc", &[guild("Alpha"), player.clone()])
            .await
            .unwrap();

        let players = store
            .find_by_field("svc", "entityType", "player")
            .await
            .unwrap();
        assert_eq!(players, vec![player]);
    }

    #[tokio::test]
    async fn collections_are_isolated() {
        let store = MemoryDocumentStore::new();
        store.upsert_batch("svc1", &[guild("Alpha")]).await.unwrap();
        assert!(store.find_all("svc2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ensure_index_is_idempotent() {
        let store = MemoryDocumentStore::new();
        store.ensure_index("svc", "entityType", false).await.unwrap();
        store.ensure_index("svc", "entityType", false).await.unwrap();
        assert_eq!(store.declared_indexes().len(), 1);
    }
}
