//! The entity data service orchestrator.
//!
//! [`EntityDataService`] fronts the three storage tiers with a
//! CRUD-plus-relationships API:
//!
//! - **Read-through with promotion**: `get` looks up L1, then the shared
//!   cache, then the document store, populating the upper tiers on the way
//!   back.
//! - **Write path**: `save` resolves the incoming record against the
//!   freshest known state through the merge rules, commits to L1
//!   immediately, rewrites the shared cache under the entity's write lock,
//!   and notifies other nodes through the task stream. The document store
//!   catches up on the persistence cycle.
//! - **Batched writes**: `save_batch` takes the service-wide write lock
//!   once, issues one document-store batch, and one stream notice.
//!
//! Construction registers the instance in the process-global registry
//! (duplicate names fail), builds the accepter table, and spawns the
//! periodic maintenance tasks. `shutdown` stops the tasks, drains in-flight
//! operations, flushes both pipelines, and unregisters.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use playergrid_core::criteria::{self, CriteriaMode, RelationshipCriterion};
use playergrid_core::entity::{now_millis, EntityRecord};
use playergrid_core::keys;
use playergrid_core::merge::resolve_save;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::relationship::transaction::{replay, RelationshipTransaction};
use crate::relationship::{apply_bidirectional, NDirectionalAssignments};
use crate::resilience::counter::RetryCounters;
use crate::resilience::policy::{RetryCondition, RetryPolicy};
use crate::scheduler::shutdown::ShutdownController;
use crate::scheduler::{self, PeriodicTask};
use crate::storage::document_store::DocumentStore;
use crate::storage::local_cache::{CacheStats, LocalCache};
use crate::storage::persistence::{
    decode_record, encode_record, LockScope, TierPipeline,
};
use crate::storage::remote_cache::RemoteCache;
use crate::storage::ttl::TtlOps;
use crate::stream::accepter::{
    AcceptContext, AccepterTable, HandlerError, TaskAccepter,
};
use crate::stream::bus::StreamBus;
use crate::stream::dispatcher::TaskDispatcher;

use super::config::ServiceConfig;
use super::error::{ServiceError, ServiceResult};
use super::registry;

/// Action name of the built-in cross-node L1 sync accepter.
pub const ENTITY_SYNC_ACTION: &str = "entity-sync";

/// Payload of an entity-sync stream task.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncNotice {
    /// Node that performed the save; it skips its own notice.
    origin: String,
    /// Entities whose L1 copies are stale elsewhere.
    uuids: Vec<Uuid>,
}

impl std::fmt::Debug for EntityDataService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityDataService").finish_non_exhaustive()
    }
}

/// Distributed, multi-tier entity data service.
pub struct EntityDataService {
    config: ServiceConfig,
    l1: Arc<LocalCache>,
    l2: Arc<dyn RemoteCache>,
    db: Arc<dyn DocumentStore>,
    ttl_ops: TtlOps,
    bus: Arc<StreamBus>,
    pipeline: Arc<TierPipeline>,
    locks: LockScope,
    dispatcher: Arc<TaskDispatcher>,
    lifecycle: ShutdownController,
    tasks: parking_lot::Mutex<Vec<PeriodicTask>>,
}

impl EntityDataService {
    /// Builds, registers, and starts a service instance.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Configuration`] for invalid parameters,
    /// [`ServiceError::DuplicateService`] if the name is taken,
    /// [`ServiceError::Resource`] if index bootstrap fails.
    pub async fn start(
        config: ServiceConfig,
        l2: Arc<dyn RemoteCache>,
        db: Arc<dyn DocumentStore>,
    ) -> ServiceResult<Arc<Self>> {
        let config = config.validate()?;
        let name = config.service_name.clone();

        let l1 = Arc::new(LocalCache::new(config.l1_max_entries, config.l1_max_idle));
        let ttl_ops = TtlOps::new(Arc::clone(&l2));
        let bus = Arc::new(StreamBus::new(
            Arc::clone(&l2),
            &name,
            config.stream_task_ttl,
        ));
        let locks = LockScope::new(&name, config.lock_wait_timeout, config.lock_hold_timeout);
        let pipeline = Arc::new(TierPipeline::new(
            &name,
            Arc::clone(&l1),
            Arc::clone(&l2),
            Arc::clone(&db),
            locks.clone(),
            config.max_batch,
            config.entity_default_ttl,
            config.player_default_ttl,
        ));

        let mut table = AccepterTable::build_for(&name);
        table.insert(Arc::new(EntitySyncAccepter {
            service_name: name.clone(),
            node_id: config.node_id.clone(),
        }));
        let dispatcher = Arc::new(TaskDispatcher::new(
            &name,
            &config.node_id,
            Arc::clone(&bus),
            Arc::new(table),
            Arc::new(RetryCounters::new(&name, Arc::clone(&l2))),
        ));

        let service = Arc::new(Self {
            config,
            l1,
            l2,
            db,
            ttl_ops,
            bus,
            pipeline,
            locks,
            dispatcher,
            lifecycle: ShutdownController::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        });

        registry::register(&service)?;

        if let Err(error) = service
            .db
            .ensure_index(&service.config.service_name, "entityType", false)
            .await
        {
            registry::unregister(&service.config.service_name);
            return Err(ServiceError::Resource(error));
        }

        service.spawn_maintenance();
        service.lifecycle.set_ready();
        tracing::info!(service = %service.config.service_name, "entity data service started");
        Ok(service)
    }

    fn spawn_maintenance(&self) {
        let mut tasks = self.tasks.lock();

        let dispatcher = Arc::clone(&self.dispatcher);
        let bus = Arc::clone(&self.bus);
        tasks.push(scheduler::spawn_periodic(
            "stream-poll",
            self.config.stream_accept_interval,
            self.lifecycle.subscribe(),
            move || {
                let dispatcher = Arc::clone(&dispatcher);
                let bus = Arc::clone(&bus);
                async move {
                    dispatcher.poll_once().await;
                    if let Err(error) = bus.gc_expired().await {
                        tracing::debug!(%error, "stream expiry gc failed");
                    }
                }
            },
        ));

        let pipeline = Arc::clone(&self.pipeline);
        let l1 = Arc::clone(&self.l1);
        tasks.push(scheduler::spawn_periodic(
            "l1-to-l2-sync",
            self.config.l1_sync_interval,
            self.lifecycle.subscribe(),
            move || {
                let pipeline = Arc::clone(&pipeline);
                let l1 = Arc::clone(&l1);
                async move {
                    l1.sweep_idle();
                    pipeline.sync_l1_to_l2().await;
                }
            },
        ));

        let pipeline = Arc::clone(&self.pipeline);
        let name = self.config.service_name.clone();
        tasks.push(scheduler::spawn_periodic(
            "l2-to-db-persistence",
            self.config.auto_save_interval,
            self.lifecycle.subscribe(),
            move || {
                let pipeline = Arc::clone(&pipeline);
                let name = name.clone();
                async move {
                    match pipeline.persist_to_db().await {
                        Ok(report) if report.persisted > 0 => {
                            tracing::debug!(
                                service = %name,
                                persisted = report.persisted,
                                remaining = report.remaining,
                                "persistence cycle completed"
                            );
                        }
                        Ok(_) => {}
                        Err(error) => {
                            tracing::warn!(service = %name, %error, "persistence cycle failed");
                        }
                    }
                }
            },
        ));
    }

    // --- Accessors ---

    /// The service's registry name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.service_name
    }

    /// This node's id within the service.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// L1 effectiveness counters.
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.l1.stats()
    }

    fn ensure_running(&self) -> ServiceResult<()> {
        if self.lifecycle.is_running() {
            Ok(())
        } else {
            Err(ServiceError::ShutDown)
        }
    }

    fn data_key(&self, uuid: Uuid) -> String {
        keys::entity_data_key(&self.config.service_name, uuid)
    }

    async fn read_l2(&self, uuid: Uuid) -> anyhow::Result<Option<EntityRecord>> {
        match self.l2.get(&self.data_key(uuid)).await? {
            Some(value) => Ok(Some(decode_record(&value)?)),
            None => Ok(None),
        }
    }

    /// Best-effort L2 read for the write path: transport trouble degrades
    /// to "unknown" so the save can still commit locally.
    async fn read_l2_lenient(&self, uuid: Uuid) -> Option<EntityRecord> {
        match self.read_l2(uuid).await {
            Ok(record) => record,
            Err(error) => {
                tracing::warn!(
                    service = %self.config.service_name,
                    uuid = %uuid,
                    %error,
                    "shared cache unavailable during save, resolving against L1 only"
                );
                None
            }
        }
    }

    // --- Read path ---

    /// Read-through lookup with tier promotion.
    ///
    /// Returns `None` only when no tier holds the record. Transient
    /// shared-cache trouble falls back to the document store.
    ///
    /// # Errors
    ///
    /// [`ServiceError::ShutDown`] after shutdown, [`ServiceError::Resource`]
    /// when the document store is unreachable.
    pub async fn get(&self, uuid: Uuid) -> ServiceResult<Option<EntityRecord>> {
        self.ensure_running()?;
        let _op = self.lifecycle.in_flight_guard();

        if let Some(record) = self.l1.get(uuid, true) {
            metrics::counter!("playergrid_l1_hits").increment(1);
            return Ok(Some(record));
        }

        match self.read_l2(uuid).await {
            Ok(Some(record)) => {
                metrics::counter!("playergrid_l2_hits").increment(1);
                self.l1.insert(record.clone(), false);
                return Ok(Some(record));
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(
                    service = %self.config.service_name,
                    uuid = %uuid,
                    %error,
                    "shared cache unavailable on read, falling back to document store"
                );
            }
        }

        let Some(record) = self.db.find_by_uuid(&self.config.service_name, uuid).await? else {
            return Ok(None);
        };
        metrics::counter!("playergrid_db_hits").increment(1);

        // Promote to both upper tiers.
        let ttl = self.pipeline.ttl_for(&record);
        if let Ok(encoded) = encode_record(&record) {
            if let Err(error) = self.l2.set(&self.data_key(uuid), &encoded, Some(ttl)).await {
                tracing::warn!(uuid = %uuid, %error, "L2 promotion failed, record stays DB-backed");
            }
        }
        self.l1.insert(record.clone(), false);
        Ok(Some(record))
    }

    /// Returns the existing record from any tier, or a fresh in-memory
    /// record that has **not** been saved anywhere.
    ///
    /// The fresh record is placed in L1 (clean) so subsequent reads and the
    /// eventual `save` observe it; nothing propagates until `save`.
    ///
    /// # Errors
    ///
    /// Same as [`get`](Self::get).
    pub async fn create(
        &self,
        uuid: Uuid,
        entity_type: &str,
    ) -> ServiceResult<EntityRecord> {
        if let Some(existing) = self.get(uuid).await? {
            return Ok(existing);
        }
        let record = EntityRecord::new(uuid, entity_type);
        self.l1.insert(record.clone(), false);
        Ok(record)
    }

    // --- Write path ---

    /// The freshest state currently visible for a uuid, across L1 and L2.
    async fn freshest_current(&self, uuid: Uuid) -> (Option<EntityRecord>, Option<EntityRecord>) {
        let local = self.l1.get(uuid, false);
        let remote = self.read_l2_lenient(uuid).await;
        let current = match (&local, &remote) {
            (Some(a), Some(b)) => {
                if (b.version, b.last_modified_time) > (a.version, a.last_modified_time) {
                    Some(b.clone())
                } else {
                    Some(a.clone())
                }
            }
            (Some(a), None) => Some(a.clone()),
            (None, Some(b)) => Some(b.clone()),
            (None, None) => None,
        };
        (current, remote)
    }

    /// Writes a resolved record to the shared cache under the entity's
    /// write lock.
    ///
    /// `based_on` is the L2 state the resolution already accounted for; if
    /// the under-lock re-read still matches it the record is written
    /// verbatim, otherwise the race is repaired by resolving once more.
    async fn write_l2_locked(
        &self,
        record: EntityRecord,
        based_on: Option<&EntityRecord>,
    ) -> Result<EntityRecord, ServiceError> {
        let uuid = record.uuid;
        let _guard = self.locks.lock_entity_write(self.l2.as_ref(), uuid).await?;

        let current = self.read_l2(uuid).await?;
        let unchanged = match (&current, based_on) {
            (None, None) => true,
            (Some(a), Some(b)) => {
                a.version == b.version && a.last_modified_time == b.last_modified_time
            }
            _ => false,
        };
        let final_record = if unchanged {
            record
        } else {
            resolve_save(current.as_ref(), record, now_millis()).record
        };

        let ttl = self.pipeline.ttl_for(&final_record);
        self.l2
            .set(
                &self.data_key(uuid),
                &encode_record(&final_record).map_err(ServiceError::Resource)?,
                Some(ttl),
            )
            .await?;
        Ok(final_record)
    }

    async fn publish_sync(&self, uuids: &[Uuid]) {
        let notice = SyncNotice {
            origin: self.config.node_id.clone(),
            uuids: uuids.to_vec(),
        };
        let payload = match serde_json::to_string(&notice) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(%error, "failed to encode sync notice");
                return;
            }
        };
        if let Err(error) = self.bus.publish(ENTITY_SYNC_ACTION, &payload).await {
            tracing::warn!(
                service = %self.config.service_name,
                %error,
                "sync notice not published, remote caches converge on next sync cycle"
            );
        }
    }

    /// Saves a record: merge-resolve, commit to L1, propagate to the shared
    /// cache, notify other nodes. The document store catches up on the
    /// persistence cycle.
    ///
    /// Returns the record as committed (version and timestamps applied).
    /// Shared-cache trouble does not fail the save; the L1 state stays
    /// dirty and the sync cycle repairs the tier.
    ///
    /// # Errors
    ///
    /// [`ServiceError::ShutDown`] after shutdown.
    pub async fn save(&self, record: EntityRecord) -> ServiceResult<EntityRecord> {
        self.ensure_running()?;
        let _op = self.lifecycle.in_flight_guard();

        let uuid = record.uuid;
        let (current, l2_basis) = self.freshest_current(uuid).await;
        let resolved = resolve_save(current.as_ref(), record, now_millis());
        self.l1.insert(resolved.record.clone(), true);
        metrics::counter!("playergrid_saves").increment(1);

        let final_record = match self
            .write_l2_locked(resolved.record.clone(), l2_basis.as_ref())
            .await
        {
            Ok(written) => {
                self.l1.insert(written.clone(), true);
                written
            }
            Err(error) => {
                tracing::warn!(
                    service = %self.config.service_name,
                    uuid = %uuid,
                    %error,
                    "shared-cache propagation deferred to next sync cycle"
                );
                resolved.record
            }
        };

        self.publish_sync(&[uuid]).await;
        Ok(final_record)
    }

    /// Saves many records with amortized cost: every record is
    /// merge-resolved and committed to L1, then one service-wide write
    /// lock guards the shared-cache writes, one document-store batch
    /// persists them all, and one stream notice covers every uuid.
    ///
    /// # Errors
    ///
    /// [`ServiceError::ShutDown`] after shutdown,
    /// [`ServiceError::LockTimeout`] when the service lock is contended
    /// away, [`ServiceError::Resource`] when the batch upsert fails.
    pub async fn save_batch(
        &self,
        records: Vec<EntityRecord>,
    ) -> ServiceResult<Vec<EntityRecord>> {
        self.ensure_running()?;
        let _op = self.lifecycle.in_flight_guard();

        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut resolved_batch = Vec::with_capacity(records.len());
        for record in records {
            let uuid = record.uuid;
            let (current, _) = self.freshest_current(uuid).await;
            let resolved = resolve_save(current.as_ref(), record, now_millis());
            self.l1.insert(resolved.record.clone(), true);
            resolved_batch.push(resolved.record);
        }

        // One exclusive lock for the whole batch.
        let guard = self.locks.lock_map_write(self.l2.as_ref()).await?;
        for record in &resolved_batch {
            let ttl = self.pipeline.ttl_for(record);
            let encoded = encode_record(record).map_err(ServiceError::Resource)?;
            if let Err(error) = self
                .l2
                .set(&self.data_key(record.uuid), &encoded, Some(ttl))
                .await
            {
                tracing::warn!(
                    uuid = %record.uuid,
                    %error,
                    "batch shared-cache write failed, sync cycle repairs"
                );
            }
        }
        drop(guard);

        // One document-store batch; records become clean in L1.
        self.db
            .upsert_batch(&self.config.service_name, &resolved_batch)
            .await?;
        for record in &resolved_batch {
            self.l1.mark_clean(record.uuid, record.version);
        }
        metrics::counter!("playergrid_batch_saves").increment(1);

        let uuids: Vec<Uuid> = resolved_batch.iter().map(|r| r.uuid).collect();
        self.publish_sync(&uuids).await;
        Ok(resolved_batch)
    }

    // --- Queries (document-store resident state) ---

    /// All records of a type. Sees only document-store resident state.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Resource`] when the store is unreachable.
    pub async fn find_by_type(&self, entity_type: &str) -> ServiceResult<Vec<EntityRecord>> {
        self.ensure_running()?;
        Ok(self
            .db
            .find_by_field(&self.config.service_name, "entityType", entity_type)
            .await?)
    }

    /// Records carrying `key = value`. With `sparse`, a sparse index on the
    /// attribute path is ensured first.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Resource`] when the store is unreachable.
    pub async fn find_by_attribute(
        &self,
        key: &str,
        value: &str,
        sparse: bool,
    ) -> ServiceResult<Vec<EntityRecord>> {
        self.ensure_running()?;
        let path = format!("attributes.{key}");
        if sparse {
            self.db
                .ensure_index(&self.config.service_name, &path, true)
                .await?;
        }
        Ok(self
            .db
            .find_by_field(&self.config.service_name, &path, value)
            .await?)
    }

    /// Records relating to `target` under `relationship_type`.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Resource`] when the store is unreachable.
    pub async fn find_by_relationship(
        &self,
        relationship_type: &str,
        target: Uuid,
    ) -> ServiceResult<Vec<EntityRecord>> {
        self.ensure_running()?;
        let path = format!("relationships.{relationship_type}");
        Ok(self
            .db
            .find_by_field(&self.config.service_name, &path, &target.to_string())
            .await?)
    }

    /// Multi-criterion relationship query over document-store resident
    /// records.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Resource`] when the store is unreachable.
    pub async fn find_by_multiple_relationships(
        &self,
        criteria: &[RelationshipCriterion],
        mode: CriteriaMode,
    ) -> ServiceResult<Vec<EntityRecord>> {
        self.ensure_running()?;

        let candidates = match mode {
            CriteriaMode::All => {
                // Narrow by the first positive criterion when there is one.
                match criteria.iter().find(|criterion| !criterion.negated) {
                    Some(first) => {
                        self.find_by_relationship(&first.relationship_type, first.target)
                            .await?
                    }
                    None => self.db.find_all(&self.config.service_name).await?,
                }
            }
            CriteriaMode::Any => {
                let mut merged: BTreeMap<Uuid, EntityRecord> = BTreeMap::new();
                for criterion in criteria.iter().filter(|criterion| !criterion.negated) {
                    let found = self
                        .find_by_relationship(&criterion.relationship_type, criterion.target)
                        .await?;
                    for record in found {
                        merged.insert(record.uuid, record);
                    }
                }
                merged.into_values().collect()
            }
        };

        Ok(candidates
            .into_iter()
            .filter(|record| criteria::matches(record, criteria, mode))
            .collect())
    }

    // --- Relationship operations ---

    /// Adds a relationship on the source record's set, in memory and L1
    /// only; call `save` to propagate. Returns the updated record, or
    /// `None` when the source is unknown in every tier.
    ///
    /// # Errors
    ///
    /// Same as [`get`](Self::get).
    pub async fn add_relationship(
        &self,
        source: Uuid,
        relationship_type: &str,
        target: Uuid,
    ) -> ServiceResult<Option<EntityRecord>> {
        let Some(mut record) = self.get(source).await? else {
            return Ok(None);
        };
        record.add_relationship(relationship_type, target);
        self.l1.insert(record.clone(), false);
        Ok(Some(record))
    }

    /// Removes a relationship; same contract as
    /// [`add_relationship`](Self::add_relationship).
    ///
    /// # Errors
    ///
    /// Same as [`get`](Self::get).
    pub async fn remove_relationship(
        &self,
        source: Uuid,
        relationship_type: &str,
        target: Uuid,
    ) -> ServiceResult<Option<EntityRecord>> {
        let Some(mut record) = self.get(source).await? else {
            return Ok(None);
        };
        record.remove_relationship(relationship_type, target);
        self.l1.insert(record.clone(), false);
        Ok(Some(record))
    }

    /// Atomically applies both sides of a relationship pair in memory and
    /// saves both records. If the save fails, the in-memory L1 mutations
    /// are reverted.
    ///
    /// # Errors
    ///
    /// Propagates [`save_batch`](Self::save_batch) failures after
    /// reverting.
    pub async fn create_bidirectional_relationship(
        &self,
        a: Uuid,
        b: Uuid,
        type_ab: &str,
        type_ba: &str,
    ) -> ServiceResult<(EntityRecord, EntityRecord)> {
        self.ensure_running()?;

        let prior_a = self.l1.peek(a);
        let prior_b = self.l1.peek(b);

        let mut record_a = self.create(a, "entity").await?;
        let mut record_b = self.create(b, "entity").await?;
        apply_bidirectional(&mut record_a, &mut record_b, type_ab, type_ba);
        self.l1.insert(record_a.clone(), false);
        self.l1.insert(record_b.clone(), false);

        match self.save_batch(vec![record_a, record_b]).await {
            Ok(saved) => {
                let mut saved = saved.into_iter();
                match (saved.next(), saved.next()) {
                    (Some(first), Some(second)) => Ok((first, second)),
                    _ => Err(ServiceError::Resource(anyhow::anyhow!(
                        "batch save returned a short result"
                    ))),
                }
            }
            Err(error) => {
                // Roll the in-memory pair back to the pre-call state.
                for (uuid, prior) in [(a, prior_a), (b, prior_b)] {
                    match prior {
                        Some(entry) => self.l1.insert(entry.record, entry.dirty),
                        None => {
                            self.l1.invalidate(uuid);
                        }
                    }
                }
                Err(error)
            }
        }
    }

    /// Applies a declarative relationship batch and saves every touched
    /// record through one `save_batch`.
    ///
    /// # Errors
    ///
    /// Propagates [`save_batch`](Self::save_batch) failures.
    pub async fn create_n_directional_relationships(
        &self,
        assignments: NDirectionalAssignments,
    ) -> ServiceResult<Vec<EntityRecord>> {
        self.ensure_running()?;

        let mut touched = Vec::with_capacity(assignments.len());
        for (source, sets) in assignments {
            let mut record = self.create(source, "entity").await?;
            crate::relationship::apply_assignments(&mut record, &sets);
            touched.push(record);
        }
        self.save_batch(touched).await
    }

    /// Runs `build` against a transaction recorder; on success the buffer
    /// replays against clones of the live records and everything saves in
    /// one batch. On failure the buffer is discarded and nothing mutates.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Resource`] when the closure fails, when an op
    /// references an unknown record, or when the batch save fails.
    pub async fn execute_relationship_transaction<F>(
        &self,
        build: F,
    ) -> ServiceResult<Vec<EntityRecord>>
    where
        F: FnOnce(&mut RelationshipTransaction) -> anyhow::Result<()>,
    {
        self.ensure_running()?;

        let mut txn = RelationshipTransaction::default();
        build(&mut txn).map_err(ServiceError::Resource)?;
        if txn.is_empty() {
            return Ok(Vec::new());
        }

        // Prefetch every referenced record; unknown uuids abort before any
        // mutation is applied.
        let mut records: BTreeMap<Uuid, EntityRecord> = BTreeMap::new();
        for uuid in txn.referenced_uuids() {
            let record = self.get(uuid).await?.ok_or_else(|| {
                ServiceError::Resource(anyhow::anyhow!(
                    "transaction references unknown record {uuid}"
                ))
            })?;
            records.insert(uuid, record);
        }

        replay(&txn.into_ops(), &mut records)
            .map_err(|error| ServiceError::Resource(error.into()))?;
        self.save_batch(records.into_values().collect()).await
    }

    // --- TTL operations ---

    /// Applies a TTL to the entity's shared-cache key. Returns `false`
    /// (instead of failing) when the key is not resident.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Resource`] on transport failure.
    pub async fn set_ttl(&self, uuid: Uuid, ttl: Duration) -> ServiceResult<bool> {
        self.ensure_running()?;
        Ok(self
            .ttl_ops
            .set_ttl_if_exists(&self.data_key(uuid), ttl)
            .await?)
    }

    /// Applies the record-kind default TTL (player or entity) to the
    /// entity's shared-cache key.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Resource`] on transport failure.
    pub async fn set_default_ttl(&self, uuid: Uuid) -> ServiceResult<bool> {
        self.ensure_running()?;
        let ttl = match self.l1.peek(uuid) {
            Some(entry) => self.pipeline.ttl_for(&entry.record),
            None => self.config.entity_default_ttl,
        };
        self.set_ttl(uuid, ttl).await
    }

    /// Ensures every resident shared-cache key of this service carries a
    /// TTL. Returns how many keys were checked.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Resource`] when the scan fails; per-key failures
    /// are logged and skipped.
    pub async fn set_default_ttl_for_all(&self) -> ServiceResult<usize> {
        self.ensure_running()?;
        let prefix = self.pipeline.data_key_prefix();
        let keys = self.l2.scan_keys(&prefix).await?;
        let mut ensured = 0_usize;
        for key in &keys {
            match self
                .ttl_ops
                .process_bucket_ttl(key, self.config.entity_default_ttl)
                .await
            {
                Ok(true) => ensured += 1,
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(key = %key, %error, "bulk TTL ensure failed for key");
                }
            }
        }
        Ok(ensured)
    }

    /// Explicitly drops the L1 copy of an entity, returning it. Lower
    /// tiers are untouched; the next read promotes again.
    pub fn invalidate_local(&self, uuid: Uuid) -> Option<EntityRecord> {
        self.l1.invalidate(uuid)
    }

    // --- Cross-node sync ---

    /// Applies a remote save notice: clean L1 copies of the named entities
    /// are dropped so the next read re-fetches the shared state. Dirty
    /// copies stay; their next save merges. Idempotent.
    pub(crate) fn apply_remote_sync(&self, uuids: &[Uuid]) {
        for uuid in uuids {
            if self.l1.invalidate_clean(*uuid) {
                metrics::counter!("playergrid_remote_invalidations").increment(1);
            }
        }
    }

    // --- Lifecycle ---

    /// Stops maintenance tasks, drains in-flight operations, flushes both
    /// pipelines once, and unregisters the name. Idempotent: later calls
    /// return immediately.
    pub async fn shutdown(&self) {
        if !self.lifecycle.begin_shutdown() {
            return;
        }
        tracing::info!(service = %self.config.service_name, "shutting down");

        let tasks: Vec<PeriodicTask> = self.tasks.lock().drain(..).collect();
        scheduler::join_all(tasks, self.config.shutdown_timeout).await;

        if !self
            .lifecycle
            .wait_for_drain(self.config.shutdown_timeout)
            .await
        {
            tracing::warn!(
                service = %self.config.service_name,
                in_flight = self.lifecycle.in_flight_count(),
                "in-flight operations did not drain in time"
            );
        }

        self.pipeline.flush_all().await;
        registry::unregister(&self.config.service_name);
        self.lifecycle.set_stopped();
        tracing::info!(service = %self.config.service_name, "shutdown complete");
    }
}

// ---------------------------------------------------------------------------
// Built-in cross-node sync accepter
// ---------------------------------------------------------------------------

/// Invalidates stale L1 copies when another node saves an entity.
struct EntitySyncAccepter {
    service_name: String,
    node_id: String,
}

#[async_trait]
impl TaskAccepter for EntitySyncAccepter {
    fn action_name(&self) -> &str {
        ENTITY_SYNC_ACTION
    }

    fn target_service_name(&self) -> Option<&str> {
        Some(&self.service_name)
    }

    fn is_record_limit(&self) -> bool {
        true
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retry_condition: RetryCondition::TransientOnly,
            ..RetryPolicy::default()
        }
    }

    async fn accept(&self, ctx: AcceptContext<'_>) -> Result<(), HandlerError> {
        let notice: SyncNotice =
            serde_json::from_str(ctx.payload).map_err(HandlerError::other)?;
        if notice.origin == self.node_id {
            // Our own save; the local tiers are already current.
            return Ok(());
        }
        if let Some(service) = registry::lookup(&self.service_name) {
            service.apply_remote_sync(&notice.uuids);
        }
        Ok(())
    }
}
