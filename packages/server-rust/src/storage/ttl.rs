//! Atomic TTL operations on the shared cache.
//!
//! [`TtlOps`] wraps the L2 collaborator with the four TTL primitives the
//! service uses. Each composes from at most two cache round-trips; the
//! single-call primitives lean on the collaborator's own atomicity
//! (server-side scripting on real stores).
//!
//! TTL expiry is the only mechanism that removes an entity key from L2, so
//! these defaults bound how long an untouched record stays resident:
//! 30 minutes for plain entities, one day for players.

use std::sync::Arc;
use std::time::Duration;

use super::remote_cache::{KeyTtl, RemoteCache};

/// Default residency for plain entity records.
pub const DEFAULT_ENTITY_TTL: Duration = Duration::from_secs(30 * 60);

/// Default residency for player records.
pub const DEFAULT_PLAYER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// TTL primitives over the shared cache.
#[derive(Clone)]
pub struct TtlOps {
    cache: Arc<dyn RemoteCache>,
}

impl TtlOps {
    /// Wraps a cache client.
    #[must_use]
    pub fn new(cache: Arc<dyn RemoteCache>) -> Self {
        Self { cache }
    }

    /// Atomic increment; the TTL is applied only when the increment creates
    /// the key. Returns the post-increment value. One round-trip.
    pub async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> anyhow::Result<i64> {
        self.cache.increment_with_ttl(key, ttl).await
    }

    /// Applies a TTL to an existing key; no-op on absent keys. Returns
    /// whether the TTL was applied. One round-trip.
    pub async fn set_ttl_if_exists(&self, key: &str, ttl: Duration) -> anyhow::Result<bool> {
        self.cache.expire(key, ttl).await
    }

    /// Applies a TTL only to a currently unbounded key, leaving existing
    /// TTLs untouched. Returns whether the TTL was applied. Two round-trips.
    pub async fn set_ttl_if_missing_ttl(&self, key: &str, ttl: Duration) -> anyhow::Result<bool> {
        match self.cache.ttl(key).await? {
            KeyTtl::Unbounded => self.cache.expire(key, ttl).await,
            KeyTtl::Missing | KeyTtl::Expires(_) => Ok(false),
        }
    }

    /// Idempotent ensure-TTL for bulk scans: guarantees the key carries some
    /// TTL afterwards (the existing one, or `ttl` if it had none). Returns
    /// `false` only for absent keys. At most two round-trips.
    pub async fn process_bucket_ttl(&self, key: &str, ttl: Duration) -> anyhow::Result<bool> {
        match self.cache.ttl(key).await? {
            KeyTtl::Missing => Ok(false),
            KeyTtl::Expires(_) => Ok(true),
            KeyTtl::Unbounded => self.cache.expire(key, ttl).await,
        }
    }
}
