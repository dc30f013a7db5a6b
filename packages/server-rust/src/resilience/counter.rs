//! Retry attempt counters.
//!
//! Bounding retries needs a counter per message id. Where that counter
//! lives decides the guarantee:
//!
//! - [`RetryCounterKind::Local`]: in-memory, survives only this process;
//!   every node may independently spend the full attempt budget.
//! - [`RetryCounterKind::Distributed`]: an atomic counter on the shared
//!   cache with a TTL, so the attempt budget is shared across nodes.
//! - [`RetryCounterKind::Hybrid`]: per-message routing; counter keys
//!   matching the policy's pattern go distributed, the rest stay local.
//!
//! A failed shared-cache round-trip must not wedge retries entirely, so the
//! distributed path falls back to the local counter with a warning.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use playergrid_core::keys;
use playergrid_core::task::MessageId;

use crate::storage::remote_cache::RemoteCache;

use super::policy::RetryPolicy;

/// Where the retry counter for a message lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryCounterKind {
    /// In-memory map keyed by message id.
    #[default]
    Local,
    /// Atomic counter on the shared cache, keyed per message with a TTL.
    Distributed,
    /// Route per message by the policy's key pattern.
    Hybrid,
}

/// How long distributed counter keys linger without updates.
pub const DEFAULT_COUNTER_TTL: Duration = Duration::from_secs(10 * 60);

/// Attempt counters for one service's dispatcher.
pub struct RetryCounters {
    service_name: String,
    cache: Arc<dyn RemoteCache>,
    local: DashMap<MessageId, u32>,
    counter_ttl: Duration,
}

impl RetryCounters {
    /// Creates counters bound to a service namespace.
    #[must_use]
    pub fn new(service_name: impl Into<String>, cache: Arc<dyn RemoteCache>) -> Self {
        Self {
            service_name: service_name.into(),
            cache,
            local: DashMap::new(),
            counter_ttl: DEFAULT_COUNTER_TTL,
        }
    }

    fn counter_key(&self, id: MessageId) -> String {
        keys::retry_counter_key(&self.service_name, &id.to_string())
    }

    fn routes_distributed(&self, policy: &RetryPolicy, key: &str) -> bool {
        match policy.counter {
            RetryCounterKind::Local => false,
            RetryCounterKind::Distributed => true,
            RetryCounterKind::Hybrid => policy
                .distributed_key_pattern
                .as_ref()
                .is_some_and(|pattern| pattern.is_match(key)),
        }
    }

    /// Increments and returns the attempt number (1-based) for a message.
    pub async fn next_attempt(&self, policy: &RetryPolicy, id: MessageId) -> u32 {
        let key = self.counter_key(id);
        if self.routes_distributed(policy, &key) {
            match self.cache.increment_with_ttl(&key, self.counter_ttl).await {
                Ok(count) => return u32::try_from(count).unwrap_or(u32::MAX),
                Err(error) => {
                    tracing::warn!(
                        key = %key,
                        %error,
                        "distributed retry counter unavailable, falling back to local"
                    );
                }
            }
        }
        let mut slot = self.local.entry(id).or_insert(0);
        *slot += 1;
        *slot
    }

    /// Clears the counter for a message (called on give-up and on success).
    pub async fn clear(&self, policy: &RetryPolicy, id: MessageId) {
        self.local.remove(&id);
        let key = self.counter_key(id);
        if self.routes_distributed(policy, &key) {
            if let Err(error) = self.cache.remove(&key).await {
                tracing::warn!(key = %key, %error, "failed to clear distributed retry counter");
            }
        }
    }
}
