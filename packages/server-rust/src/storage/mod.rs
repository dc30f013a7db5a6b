//! Multi-tier storage for the `PlayerGrid` service.
//!
//! Three tiers, closest first:
//!
//! - **L1** ([`LocalCache`]): bounded process-local concurrent map with
//!   access metadata, dirty tracking, idle expiry, and sampled eviction
//! - **L2** ([`RemoteCache`]): shared distributed cache collaborator
//!   contract -- KV with TTL, atomic increment/expire, ordered streams with
//!   consumer groups, distributed read-write locks
//! - **DB** ([`DocumentStore`]): durable document store collaborator
//!   contract, one document per entity
//!
//! [`TtlOps`] composes the atomic TTL primitives, [`TierPipeline`] runs the
//! scheduled L1 -> L2 -> DB propagation, and [`memory`] provides in-process
//! implementations of both collaborators.

pub mod document_store;
pub mod local_cache;
pub mod memory;
pub mod persistence;
pub mod remote_cache;
pub mod ttl;

pub use document_store::DocumentStore;
pub use local_cache::{CacheEntry, CacheStats, EntryMeta, LocalCache};
pub use memory::{MemoryDocumentStore, MemoryRemoteCache};
pub use persistence::{
    decode_record, encode_record, LockScope, PersistReport, SyncReport, TierPipeline,
};
pub use remote_cache::{KeyTtl, LockGuard, RemoteCache};
pub use ttl::{TtlOps, DEFAULT_ENTITY_TTL, DEFAULT_PLAYER_TTL};
