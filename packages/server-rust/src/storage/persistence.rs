//! Tier propagation pipelines.
//!
//! [`TierPipeline`] owns the two scheduled flows that move state down the
//! storage hierarchy:
//!
//! - **L1 -> L2 sync**: walk the local cache; wherever the local record and
//!   the shared cache disagree on version, reconcile through the merge
//!   rules under the entity's distributed write lock and rewrite the key.
//!   Running it twice in a row yields the same state.
//! - **L2 -> DB persistence**: under the service-wide write lock, scan the
//!   shared cache's data keys, fold in locally dirty records the cache may
//!   have already expired, and upsert a bounded batch into the document
//!   store. A single run may only process a prefix; the next cycle
//!   continues.
//!
//! Single-key failures are logged and retried next cycle; a batch failure
//! aborts the current run without partial-commit surprises for callers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use playergrid_core::entity::{now_millis, EntityRecord};
use playergrid_core::keys;
use playergrid_core::merge::resolve_save;
use uuid::Uuid;

use crate::service::error::ServiceError;

use super::local_cache::LocalCache;
use super::document_store::DocumentStore;
use super::remote_cache::{LockGuard, RemoteCache};

/// Serializes a record for the shared cache / document layer.
pub fn encode_record(record: &EntityRecord) -> anyhow::Result<String> {
    Ok(serde_json::to_string(record)?)
}

/// Deserializes a record from its shared-cache value.
pub fn decode_record(value: &str) -> anyhow::Result<EntityRecord> {
    Ok(serde_json::from_str(value)?)
}

/// Outcome of one L1 -> L2 sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// L1 entries examined.
    pub examined: usize,
    /// Keys rewritten in the shared cache.
    pub written: usize,
    /// Newer shared-cache state pulled into L1 without a write.
    pub pulled: usize,
    /// Keys skipped because both tiers already agreed.
    pub unchanged: usize,
    /// Keys skipped on lock timeout or transport failure.
    pub failed: usize,
}

/// How one key fared during an L1 -> L2 sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncOutcome {
    Written,
    Pulled,
    Unchanged,
}

/// Outcome of one L2 -> DB persistence run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistReport {
    /// Candidate records gathered from the shared cache and dirty L1 state.
    pub gathered: usize,
    /// Records written to the document store this run.
    pub persisted: usize,
    /// Candidates left for the next cycle by the batch bound.
    pub remaining: usize,
}

/// Lock scope and timing shared by the pipelines and the data service.
#[derive(Debug, Clone)]
pub struct LockScope {
    service_name: String,
    wait: Duration,
    hold: Duration,
}

impl LockScope {
    /// Creates a scope for one service.
    #[must_use]
    pub fn new(service_name: impl Into<String>, wait: Duration, hold: Duration) -> Self {
        Self {
            service_name: service_name.into(),
            wait,
            hold,
        }
    }

    /// Lock key guarding one entity's data key.
    #[must_use]
    pub fn entity_lock_key(&self, uuid: Uuid) -> String {
        keys::rw_lock_key(&keys::entity_data_key(&self.service_name, uuid))
    }

    /// Lock key guarding the service-wide map (persistence scope).
    #[must_use]
    pub fn map_lock_key(&self) -> String {
        keys::rw_lock_key(&keys::service_map_key(&self.service_name))
    }

    /// Acquires an entity's write lock.
    ///
    /// # Errors
    ///
    /// [`ServiceError::LockTimeout`] when the wait expires,
    /// [`ServiceError::Resource`] on transport failure.
    pub async fn lock_entity_write(
        &self,
        cache: &dyn RemoteCache,
        uuid: Uuid,
    ) -> Result<LockGuard, ServiceError> {
        let key = self.entity_lock_key(uuid);
        cache
            .acquire_write(&key, self.wait, self.hold)
            .await?
            .ok_or(ServiceError::LockTimeout { key })
    }

    /// Acquires the service-wide write lock.
    ///
    /// # Errors
    ///
    /// Same as [`lock_entity_write`](Self::lock_entity_write).
    pub async fn lock_map_write(
        &self,
        cache: &dyn RemoteCache,
    ) -> Result<LockGuard, ServiceError> {
        let key = self.map_lock_key();
        cache
            .acquire_write(&key, self.wait, self.hold)
            .await?
            .ok_or(ServiceError::LockTimeout { key })
    }
}

/// The scheduled L1 -> L2 -> DB propagation machinery of one service.
pub struct TierPipeline {
    service_name: String,
    l1: Arc<LocalCache>,
    l2: Arc<dyn RemoteCache>,
    db: Arc<dyn DocumentStore>,
    locks: LockScope,
    max_batch: usize,
    entity_ttl: Duration,
    player_ttl: Duration,
    /// Resume point of the bounded persistence scan: the last uuid the
    /// previous run processed, `None` after a completed pass.
    persist_cursor: parking_lot::Mutex<Option<Uuid>>,
}

impl TierPipeline {
    /// Wires the pipeline for one service.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        service_name: impl Into<String>,
        l1: Arc<LocalCache>,
        l2: Arc<dyn RemoteCache>,
        db: Arc<dyn DocumentStore>,
        locks: LockScope,
        max_batch: usize,
        entity_ttl: Duration,
        player_ttl: Duration,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            l1,
            l2,
            db,
            locks,
            max_batch,
            entity_ttl,
            player_ttl,
            persist_cursor: parking_lot::Mutex::new(None),
        }
    }

    /// Default L2 residency for a record, by record kind.
    #[must_use]
    pub fn ttl_for(&self, record: &EntityRecord) -> Duration {
        if record.is_player() {
            self.player_ttl
        } else {
            self.entity_ttl
        }
    }

    /// Prefix of this service's entity data keys.
    #[must_use]
    pub fn data_key_prefix(&self) -> String {
        keys::service_key(&self.service_name, keys::KeyKind::Data, "")
    }

    /// One L1 -> L2 sync pass.
    ///
    /// Idempotent: with no concurrent writers, a second pass reports
    /// everything unchanged.
    pub async fn sync_l1_to_l2(&self) -> SyncReport {
        let mut report = SyncReport::default();
        for entry in self.l1.snapshot() {
            report.examined += 1;
            let uuid = entry.record.uuid;
            match self.sync_one(entry.record, entry.dirty).await {
                Ok(SyncOutcome::Written) => report.written += 1,
                Ok(SyncOutcome::Pulled) => report.pulled += 1,
                Ok(SyncOutcome::Unchanged) => report.unchanged += 1,
                Err(error) => {
                    report.failed += 1;
                    tracing::warn!(
                        service = %self.service_name,
                        uuid = %uuid,
                        %error,
                        "L1 to L2 sync failed for key, retrying next cycle"
                    );
                }
            }
        }
        if report.written > 0 {
            metrics::counter!("playergrid_l1_l2_synced").increment(report.written as u64);
        }
        report
    }

    /// Reconciles one record with the shared cache.
    async fn sync_one(
        &self,
        local: EntityRecord,
        dirty: bool,
    ) -> Result<SyncOutcome, ServiceError> {
        let uuid = local.uuid;
        let data_key = keys::entity_data_key(&self.service_name, uuid);

        let remote = match self.l2.get(&data_key).await? {
            Some(value) => Some(decode_record(&value)?),
            None => None,
        };

        if let Some(remote) = &remote {
            let same = remote.version == local.version
                && remote.last_modified_time == local.last_modified_time;
            if same {
                return Ok(SyncOutcome::Unchanged);
            }
            let remote_newer = (remote.version, remote.last_modified_time)
                > (local.version, local.last_modified_time);
            if remote_newer && !dirty {
                // Read-repair: adopt the newer shared state locally.
                self.l1.insert(remote.clone(), false);
                return Ok(SyncOutcome::Pulled);
            }
        } else if !dirty {
            // Clean record whose L2 key expired: repopulate the tier
            // verbatim so read-through on other nodes hits again.
            let ttl = self.ttl_for(&local);
            self.l2
                .set(&data_key, &encode_record(&local)?, Some(ttl))
                .await?;
            return Ok(SyncOutcome::Written);
        }

        let _guard = self.locks.lock_entity_write(self.l2.as_ref(), uuid).await?;
        // Re-read under the lock: another node may have won the race.
        let current = match self.l2.get(&data_key).await? {
            Some(value) => Some(decode_record(&value)?),
            None => None,
        };
        let resolved = resolve_save(current.as_ref(), local, now_millis());
        let ttl = self.ttl_for(&resolved.record);
        self.l2
            .set(&data_key, &encode_record(&resolved.record)?, Some(ttl))
            .await?;
        self.l1.insert(resolved.record, dirty);
        Ok(SyncOutcome::Written)
    }

    /// One L2 -> DB persistence pass under the service-wide write lock.
    ///
    /// Gathers the shared cache's resident records plus locally dirty ones
    /// (whose cache key may already have expired), keeps the newest state
    /// per uuid, and upserts at most `max_batch` of them. Persisted records
    /// are marked clean in L1.
    ///
    /// # Errors
    ///
    /// [`ServiceError::LockTimeout`] when the persistence lock is
    /// contended away, [`ServiceError::Resource`] when the scan or the
    /// batch write fails; the batch is aborted, nothing is marked clean,
    /// and the next cycle retries.
    pub async fn persist_to_db(&self) -> Result<PersistReport, ServiceError> {
        let _guard = self.locks.lock_map_write(self.l2.as_ref()).await?;

        let mut candidates: BTreeMap<Uuid, EntityRecord> = BTreeMap::new();

        // Shared-cache residents.
        let prefix = self.data_key_prefix();
        for key in self.l2.scan_keys(&prefix).await? {
            let Some(value) = self.l2.get(&key).await? else {
                continue;
            };
            match decode_record(&value) {
                Ok(record) => {
                    candidates.insert(record.uuid, record);
                }
                Err(error) => {
                    tracing::warn!(key = %key, %error, "undecodable record in shared cache, skipping");
                }
            }
        }

        // Locally dirty records; newest version wins on overlap.
        for record in self.l1.dirty_entries() {
            match candidates.get(&record.uuid) {
                Some(existing)
                    if (existing.version, existing.last_modified_time)
                        >= (record.version, record.last_modified_time) => {}
                _ => {
                    candidates.insert(record.uuid, record);
                }
            }
        }

        let gathered = candidates.len();

        // Resume the bounded scan where the previous run stopped; a
        // completed pass resets the cursor so the next pass starts over.
        let cursor = *self.persist_cursor.lock();
        let ahead: Vec<EntityRecord> = candidates
            .into_values()
            .filter(|record| cursor.is_none_or(|c| record.uuid > c))
            .collect();
        let remaining = ahead.len().saturating_sub(self.max_batch);
        let batch: Vec<EntityRecord> = ahead.into_iter().take(self.max_batch).collect();

        if !batch.is_empty() {
            self.db.upsert_batch(&self.service_name, &batch).await?;
            for record in &batch {
                self.l1.mark_clean(record.uuid, record.version);
            }
            metrics::counter!("playergrid_db_persisted").increment(batch.len() as u64);
        }

        *self.persist_cursor.lock() = if remaining == 0 {
            None
        } else {
            batch.last().map(|record| record.uuid)
        };

        Ok(PersistReport {
            gathered,
            persisted: batch.len(),
            remaining,
        })
    }

    /// Flushes both pipelines until the document store has caught up.
    ///
    /// Used on shutdown. Bounded: gives up (with a warning) if repeated
    /// passes stop making progress.
    pub async fn flush_all(&self) {
        self.sync_l1_to_l2().await;
        let mut rounds = 0_usize;
        loop {
            match self.persist_to_db().await {
                Ok(report) => {
                    if report.remaining == 0 && self.l1.dirty_entries().is_empty() {
                        break;
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        service = %self.service_name,
                        %error,
                        "persistence flush failed during shutdown"
                    );
                    break;
                }
            }
            rounds += 1;
            if rounds > 1_000 {
                tracing::warn!(
                    service = %self.service_name,
                    "persistence flush did not converge, giving up"
                );
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{MemoryDocumentStore, MemoryRemoteCache};

    fn pipeline(max_batch: usize) -> (TierPipeline, Arc<LocalCache>, Arc<MemoryRemoteCache>, Arc<MemoryDocumentStore>) {
        let l1 = Arc::new(LocalCache::new(0, None));
        let l2 = Arc::new(MemoryRemoteCache::new());
        let db = Arc::new(MemoryDocumentStore::new());
        let locks = LockScope::new(
            "svc1",
            Duration::from_millis(200),
            Duration::from_secs(30),
        );
        let pipeline = TierPipeline::new(
            "svc1",
            l1.clone(),
            l2.clone(),
            db.clone(),
            locks,
            max_batch,
            Duration::from_secs(1_800),
            Duration::from_secs(86_400),
        );
        (pipeline, l1, l2, db)
    }

    fn record(name: &str) -> EntityRecord {
        EntityRecord::new(Uuid::new_v4(), "guild").with_attribute("name", name)
    }

    #[test]
    fn record_codec_round_trips() {
        let r = record("Alpha");
        let encoded = encode_record(&r).unwrap();
        assert_eq!(decode_record(&encoded).unwrap(), r);
    }

    #[tokio::test]
    async fn sync_writes_dirty_l1_records_to_l2() {
        let (pipeline, l1, l2, _) = pipeline(100);
        let r = record("Alpha");
        l1.insert(r.clone(), true);

        let report = pipeline.sync_l1_to_l2().await;
        assert_eq!(report.written, 1);

        let key = keys::entity_data_key("svc1", r.uuid);
        let stored = decode_record(&l2.get(&key).await.unwrap().unwrap()).unwrap();
        assert_eq!(stored.attribute("name"), Some("Alpha"));
    }

    #[tokio::test]
    async fn sync_is_idempotent() {
        let (pipeline, l1, _, _) = pipeline(100);
        l1.insert(record("Alpha"), true);

        let first = pipeline.sync_l1_to_l2().await;
        assert_eq!(first.written, 1);

        let second = pipeline.sync_l1_to_l2().await;
        assert_eq!(second.written, 0);
        assert_eq!(second.unchanged, 1);
    }

    #[tokio::test]
    async fn sync_pulls_newer_l2_state_into_l1() {
        let (pipeline, l1, l2, _) = pipeline(100);
        let mut stale = record("old");
        stale.last_modified_time = 1_000;
        l1.insert(stale.clone(), false);

        let mut newer = stale.clone();
        newer.set_attribute("name", "new");
        newer.version = 4;
        newer.last_modified_time = 2_000;
        let key = keys::entity_data_key("svc1", stale.uuid);
        l2.set(&key, &encode_record(&newer).unwrap(), None)
            .await
            .unwrap();

        pipeline.sync_l1_to_l2().await;
        let local = l1.get(stale.uuid, false).unwrap();
        assert_eq!(local.attribute("name"), Some("new"));
        assert_eq!(local.version, 4);
    }

    #[tokio::test]
    async fn persist_moves_l2_records_into_db() {
        let (pipeline, _, l2, db) = pipeline(100);
        let r = record("Alpha");
        let key = keys::entity_data_key("svc1", r.uuid);
        l2.set(&key, &encode_record(&r).unwrap(), None).await.unwrap();

        let report = pipeline.persist_to_db().await.unwrap();
        assert_eq!(report.persisted, 1);
        assert_eq!(report.remaining, 0);
        assert_eq!(
            db.find_by_uuid("svc1", r.uuid).await.unwrap().unwrap(),
            r
        );
    }

    #[tokio::test]
    async fn persist_includes_dirty_l1_records_missing_from_l2() {
        let (pipeline, l1, _, db) = pipeline(100);
        let r = record("Alpha");
        // The L2 key expired before persistence got to it.
        l1.insert(r.clone(), true);

        let report = pipeline.persist_to_db().await.unwrap();
        assert_eq!(report.persisted, 1);
        assert!(db.find_by_uuid("svc1", r.uuid).await.unwrap().is_some());
        assert!(!l1.peek(r.uuid).unwrap().dirty);
    }

    #[tokio::test]
    async fn persist_respects_batch_bound() {
        let (pipeline, l1, _, db) = pipeline(3);
        for i in 0..8 {
            l1.insert(record(&format!("r{i}")), true);
        }

        let report = pipeline.persist_to_db().await.unwrap();
        assert_eq!(report.gathered, 8);
        assert_eq!(report.persisted, 3);
        assert_eq!(report.remaining, 5);
        assert_eq!(db.len("svc1"), 3);

        // Later cycles drain the rest.
        pipeline.persist_to_db().await.unwrap();
        pipeline.persist_to_db().await.unwrap();
        assert_eq!(db.len("svc1"), 8);
    }

    #[tokio::test]
    async fn persist_times_out_when_lock_is_held() {
        let (pipeline, l1, l2, _) = pipeline(100);
        l1.insert(record("Alpha"), true);

        let lock_key = keys::rw_lock_key(&keys::service_map_key("svc1"));
        let _held = l2
            .acquire_write(&lock_key, Duration::from_millis(50), Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let err = pipeline.persist_to_db().await.unwrap_err();
        assert!(matches!(err, ServiceError::LockTimeout { .. }));
    }

    #[tokio::test]
    async fn flush_all_drains_every_tier() {
        let (pipeline, l1, l2, db) = pipeline(2);
        let records: Vec<EntityRecord> = (0..5).map(|i| record(&format!("r{i}"))).collect();
        for r in &records {
            l1.insert(r.clone(), true);
        }

        pipeline.flush_all().await;

        for r in &records {
            let key = keys::entity_data_key("svc1", r.uuid);
            assert!(l2.get(&key).await.unwrap().is_some(), "missing in L2");
            assert!(
                db.find_by_uuid("svc1", r.uuid).await.unwrap().is_some(),
                "missing in DB"
            );
            assert!(!l1.peek(r.uuid).unwrap().dirty);
        }
    }
}
