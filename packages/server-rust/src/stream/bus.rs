//! Per-service task stream bus.
//!
//! [`StreamBus`] binds a service to its persistent task stream on the shared
//! cache: publish appends, consumer-group polls, acks, removals, and expiry
//! garbage collection. Ordering follows the underlying stream: publish order
//! within the stream, fan-out across consumer groups, exactly-one-consumer
//! ownership within a group until ack or ownership timeout.

use std::sync::Arc;
use std::time::Duration;

use playergrid_core::keys;
use playergrid_core::task::{MessageId, StreamTask};

use crate::storage::remote_cache::RemoteCache;

/// Handle to one service's task stream.
pub struct StreamBus {
    cache: Arc<dyn RemoteCache>,
    stream_key: String,
    default_task_ttl: Duration,
}

impl StreamBus {
    /// Binds to the task stream of `service_name`.
    #[must_use]
    pub fn new(
        cache: Arc<dyn RemoteCache>,
        service_name: &str,
        default_task_ttl: Duration,
    ) -> Self {
        Self {
            cache,
            stream_key: keys::task_stream_key(service_name),
            default_task_ttl,
        }
    }

    /// The underlying stream key.
    #[must_use]
    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    /// Publishes a task with the bus default expiry.
    pub async fn publish(
        &self,
        action_name: &str,
        payload: &str,
    ) -> anyhow::Result<MessageId> {
        #[allow(clippy::cast_possible_truncation)]
        let expiry_ms = self.default_task_ttl.as_millis() as u64;
        self.publish_task(&StreamTask::new(action_name, payload, expiry_ms))
            .await
    }

    /// Publishes a fully specified task. Returns the bus-assigned id.
    pub async fn publish_task(&self, task: &StreamTask) -> anyhow::Result<MessageId> {
        let id = self.cache.stream_add(&self.stream_key, task).await?;
        metrics::counter!("playergrid_stream_published").increment(1);
        Ok(id)
    }

    /// Polls up to `count` messages for `(group, consumer)`.
    pub async fn poll(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> anyhow::Result<Vec<(MessageId, StreamTask)>> {
        self.cache
            .stream_read_group(&self.stream_key, group, consumer, count)
            .await
    }

    /// Acknowledges a message for a group.
    pub async fn ack(&self, group: &str, id: MessageId) -> anyhow::Result<bool> {
        self.cache.stream_ack(&self.stream_key, group, id).await
    }

    /// Deletes a message from the stream outright.
    pub async fn remove(&self, id: MessageId) -> anyhow::Result<bool> {
        self.cache.stream_remove(&self.stream_key, id).await
    }

    /// Garbage-collects expired tasks. Returns how many were dropped.
    pub async fn gc_expired(&self) -> anyhow::Result<usize> {
        let dropped = self.cache.stream_trim_expired(&self.stream_key).await?;
        if dropped > 0 {
            tracing::debug!(stream = %self.stream_key, dropped, "expired stream tasks dropped");
        }
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryRemoteCache;

    fn bus() -> StreamBus {
        StreamBus::new(
            Arc::new(MemoryRemoteCache::new()),
            "svc1",
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn publish_assigns_increasing_ids() {
        let bus = bus();
        let a = bus.publish("inc", "1").await.unwrap();
        let b = bus.publish("inc", "2").await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn poll_ack_cycle() {
        let bus = bus();
        let id = bus.publish("inc", "1").await.unwrap();

        let polled = bus.poll("group", "node-a", 10).await.unwrap();
        assert_eq!(polled.len(), 1);
        assert_eq!(polled[0].0, id);
        assert_eq!(polled[0].1.action_name, "inc");

        assert!(bus.ack("group", id).await.unwrap());
        assert!(bus.poll("group", "node-a", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_deletes_outright() {
        let bus = bus();
        let id = bus.publish("inc", "1").await.unwrap();
        assert!(bus.remove(id).await.unwrap());
        assert!(bus.poll("group", "node-a", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stream_key_follows_namespace() {
        let bus = bus();
        assert_eq!(bus.stream_key(), "legacy:player:svc1:stream:tasks");
    }
}
