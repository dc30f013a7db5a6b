//! Durable document store (DB) collaborator contract.
//!
//! Defines [`DocumentStore`], the abstraction over the third storage tier:
//! one document per entity, keyed by uuid, carrying the same field set as
//! the L2 serialization. The persistence pipeline upserts in bounded
//! batches; query operations read the store directly and therefore do not
//! see records that exist only in L1.
//!
//! Used as `Arc<dyn DocumentStore>`.

use async_trait::async_trait;
use playergrid_core::entity::EntityRecord;
use uuid::Uuid;

/// Durable document store for entity records.
///
/// `collection` is the service name; each service persists into its own
/// collection. Field paths use dots (`"entityType"`, `"attributes.name"`,
/// `"relationships.member_of"`); matching against a relationship path tests
/// set containment of the target uuid.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert-or-replace a batch of records in one round-trip.
    async fn upsert_batch(&self, collection: &str, records: &[EntityRecord])
        -> anyhow::Result<()>;

    /// Load a single record by uuid.
    async fn find_by_uuid(
        &self,
        collection: &str,
        uuid: Uuid,
    ) -> anyhow::Result<Option<EntityRecord>>;

    /// All records whose document field at `path` equals (or, for sets,
    /// contains) `value`.
    async fn find_by_field(
        &self,
        collection: &str,
        path: &str,
        value: &str,
    ) -> anyhow::Result<Vec<EntityRecord>>;

    /// All records in the collection.
    async fn find_all(&self, collection: &str) -> anyhow::Result<Vec<EntityRecord>>;

    /// Idempotently create an index on `path`. `sparse` indexes skip
    /// documents missing the field.
    async fn ensure_index(&self, collection: &str, path: &str, sparse: bool) -> anyhow::Result<()>;
}
