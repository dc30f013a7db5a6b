//! `PlayerGrid` Server -- distributed multi-tier entity/player data service.
//!
//! Authoritative per-entity state behind a three-tier storage hierarchy
//! (process-local cache, shared distributed cache, durable document store),
//! with cross-node coordination over a persistent task stream:
//!
//! - [`storage`]: the tiers, TTL primitives, and propagation pipelines
//! - [`service`]: configuration, registry, errors, and the data service API
//! - [`relationship`]: bidirectional/N-directional application and buffered
//!   transactions
//! - [`stream`]: task bus, accepter framework, poll dispatch
//! - [`resilience`]: retry policies, attempt counters, compensation
//! - [`scheduler`]: periodic maintenance and shutdown control

pub mod relationship;
pub mod resilience;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod stream;

pub use service::{
    EntityDataService, MongoConfig, PlayerDataService, RedisConfig, ServiceConfig, ServiceError,
    ServiceResult, UuidRepresentation, ENTITY_SYNC_ACTION,
};
pub use storage::{DocumentStore, MemoryDocumentStore, MemoryRemoteCache, RemoteCache};
pub use stream::{register_accepter, AcceptContext, HandlerError, TaskAccepter};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
