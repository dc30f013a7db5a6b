//! Shared distributed cache (L2) collaborator contract.
//!
//! Defines [`RemoteCache`], the abstraction over the shared key-value store
//! that backs the middle storage tier. Beyond plain KV-with-TTL it exposes
//! the three extras the service relies on: atomic increment/expire
//! primitives, persistent ordered streams with consumer groups, and a
//! distributed read-write lock.
//!
//! Implementations are expected to make each method atomic with respect to
//! other callers of the same key (server-side scripting on real stores, a
//! per-key critical section in [`MemoryRemoteCache`](super::MemoryRemoteCache)).
//!
//! Used as `Arc<dyn RemoteCache>`.

use std::any::Any;
use std::time::Duration;

use async_trait::async_trait;
use playergrid_core::task::{MessageId, StreamTask};

/// Remaining time-to-live of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist.
    Missing,
    /// The key exists and never expires.
    Unbounded,
    /// The key exists and expires after the contained duration.
    Expires(Duration),
}

/// Opaque lock token; the lock is released when the guard is dropped.
///
/// Implementations stash whatever state keeps the lock alive (an owned
/// guard, a lease handle) inside the box.
pub struct LockGuard {
    _token: Box<dyn Any + Send>,
}

impl LockGuard {
    /// Wraps an implementation-specific token.
    #[must_use]
    pub fn new(token: impl Any + Send) -> Self {
        Self {
            _token: Box::new(token),
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LockGuard")
    }
}

/// Shared distributed cache with TTL, streams, and locks.
///
/// All string values are opaque to the cache; the service stores serialized
/// entity records under [`keys::entity_data_key`](playergrid_core::keys)
/// keys. Every method may block on a network round-trip and returns
/// `anyhow::Result` for transport-level failures; domain-level misses are
/// expressed in the `Ok` value (`None`, `false`, [`KeyTtl::Missing`]).
#[async_trait]
pub trait RemoteCache: Send + Sync {
    // --- Key-value with TTL ---

    /// Read a value. Expired keys read as absent.
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// Write a value, replacing any previous one. `ttl = None` stores the
    /// key unbounded.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> anyhow::Result<()>;

    /// Remove a key. Returns `true` if it existed.
    ///
    /// Entity data keys are never removed through this path; TTL expiry is
    /// the only eviction mechanism for them. Bookkeeping keys (retry
    /// counters) are cleared with it.
    async fn remove(&self, key: &str) -> anyhow::Result<bool>;

    /// Remaining TTL of a key.
    async fn ttl(&self, key: &str) -> anyhow::Result<KeyTtl>;

    /// Apply a TTL to an existing key. Returns `false` if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> anyhow::Result<bool>;

    /// Atomically increment an integer key by one, applying `ttl` when the
    /// increment creates the key. Returns the post-increment value.
    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> anyhow::Result<i64>;

    /// List keys starting with `prefix`. Expired keys are not returned.
    async fn scan_keys(&self, prefix: &str) -> anyhow::Result<Vec<String>>;

    // --- Ordered streams with consumer groups ---

    /// Append a task; returns its bus-assigned id, strictly increasing
    /// within the stream.
    async fn stream_add(&self, stream: &str, task: &StreamTask) -> anyhow::Result<MessageId>;

    /// Read up to `count` messages for `(group, consumer)`: new messages
    /// past the group's delivery cursor, plus previously delivered messages
    /// whose ownership timed out without an ack. Each message is owned by
    /// exactly one consumer of the group at a time.
    async fn stream_read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> anyhow::Result<Vec<(MessageId, StreamTask)>>;

    /// Acknowledge a message for a group, removing it from the group's
    /// pending list. Returns `false` if it was not pending.
    async fn stream_ack(&self, stream: &str, group: &str, id: MessageId) -> anyhow::Result<bool>;

    /// Delete a message from the stream (and every group's pending list).
    async fn stream_remove(&self, stream: &str, id: MessageId) -> anyhow::Result<bool>;

    /// Garbage-collect tasks whose expiry elapsed. Returns how many were
    /// dropped.
    async fn stream_trim_expired(&self, stream: &str) -> anyhow::Result<usize>;

    // --- Distributed read-write lock ---

    /// Acquire the shared (read) side of the lock on `key`.
    ///
    /// Waits up to `wait`; returns `Ok(None)` on wait-timeout. `hold` is the
    /// lease after which a distributed implementation may break the lock to
    /// survive a crashed holder.
    async fn acquire_read(
        &self,
        key: &str,
        wait: Duration,
        hold: Duration,
    ) -> anyhow::Result<Option<LockGuard>>;

    /// Acquire the exclusive (write) side of the lock on `key`.
    ///
    /// Same wait/hold semantics as [`acquire_read`](RemoteCache::acquire_read).
    async fn acquire_write(
        &self,
        key: &str,
        wait: Duration,
        hold: Duration,
    ) -> anyhow::Result<Option<LockGuard>>;
}
