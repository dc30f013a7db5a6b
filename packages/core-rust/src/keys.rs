//! Deterministic L2 key schema.
//!
//! Every key the service writes to the shared cache follows
//!
//! ```text
//! legacy:player:<serviceName>:<kind>:<suffix>
//! ```
//!
//! where `<kind>` is one of `data`, `stream`, `map`, `stream-group`, or
//! `map-cache`, and `<suffix>` identifies the entity, stream, or bucket. A
//! `:rw-lock` suffix on any key names that key's read-write lock. Key
//! generation must be stable across nodes: two nodes configured with the
//! same service name always derive identical keys.

use std::fmt;

use uuid::Uuid;

/// Namespace root shared by every key this library writes.
pub const KEY_ROOT: &str = "legacy:player";

/// Suffix reserved for read-write locks.
pub const RW_LOCK_SUFFIX: &str = "rw-lock";

/// Key families under a service's namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    /// Serialized entity records.
    Data,
    /// Persistent task streams.
    Stream,
    /// Service-wide map keys (persistence lock scope).
    Map,
    /// Consumer-group names.
    StreamGroup,
    /// Short-lived bookkeeping values (retry counters, dedup buckets).
    MapCache,
}

impl KeyKind {
    /// The wire segment for this kind.
    #[must_use]
    pub fn segment(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Stream => "stream",
            Self::Map => "map",
            Self::StreamGroup => "stream-group",
            Self::MapCache => "map-cache",
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.segment())
    }
}

/// Builds a key in a service's namespace.
#[must_use]
pub fn service_key(service_name: &str, kind: KeyKind, suffix: &str) -> String {
    format!("{KEY_ROOT}:{service_name}:{kind}:{suffix}")
}

/// Key holding the serialized record of one entity.
#[must_use]
pub fn entity_data_key(service_name: &str, uuid: Uuid) -> String {
    service_key(service_name, KeyKind::Data, &uuid.to_string())
}

/// The read-write lock key guarding `key`.
#[must_use]
pub fn rw_lock_key(key: &str) -> String {
    format!("{key}:{RW_LOCK_SUFFIX}")
}

/// The service's task stream key.
#[must_use]
pub fn task_stream_key(service_name: &str) -> String {
    service_key(service_name, KeyKind::Stream, "tasks")
}

/// The service-wide map key; its write lock serializes persistence runs.
#[must_use]
pub fn service_map_key(service_name: &str) -> String {
    service_key(service_name, KeyKind::Map, "entities")
}

/// Consumer-group name for one node of a service.
#[must_use]
pub fn consumer_group_key(service_name: &str, node_id: &str) -> String {
    service_key(service_name, KeyKind::StreamGroup, node_id)
}

/// Distributed retry-counter key for one stream message.
#[must_use]
pub fn retry_counter_key(service_name: &str, message_id: &str) -> String {
    service_key(
        service_name,
        KeyKind::MapCache,
        &format!("retry:{message_id}"),
    )
}
