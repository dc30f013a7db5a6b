//! Stream poll loop dispatch.
//!
//! [`TaskDispatcher`] drains a service's consumer group and routes each
//! polled message to its accepter:
//!
//! - no accepter registered for the action: the message is left unacked so
//!   another node (with the accepter) can handle it until expiry GC;
//! - record-limited actions already processed on this node: acknowledged
//!   without reprocessing;
//! - otherwise the accepter runs under the resilience wrapper, inline for
//!   cooperative accepters (preserving per-consumer FIFO order) or detached
//!   onto a dedicated worker task.
//!
//! Every node polls with its own consumer group, so a message fans out to
//! every node of the service; within the group the node is the only
//! consumer.

use std::sync::Arc;

use playergrid_core::keys;

use crate::resilience::counter::RetryCounters;
use crate::resilience::wrapper::{invoke_resilient, InvocationOutcome};
use crate::stream::accepter::AccepterTable;
use crate::stream::bus::StreamBus;
use crate::stream::dedup::RecentMessageSet;

/// How many messages one poll round requests.
const POLL_BATCH: usize = 16;

/// Counters describing one poll round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Messages returned by the poll.
    pub polled: usize,
    /// Messages handed to an accepter (inline or detached).
    pub dispatched: usize,
    /// Messages left unacked because no accepter matched.
    pub unmatched: usize,
    /// Record-limited duplicates acknowledged without reprocessing.
    pub deduplicated: usize,
}

/// Routes polled stream messages to accepters.
pub struct TaskDispatcher {
    service_name: String,
    node_id: String,
    group: String,
    bus: Arc<StreamBus>,
    table: Arc<AccepterTable>,
    counters: Arc<RetryCounters>,
    dedup: Arc<RecentMessageSet>,
}

impl TaskDispatcher {
    /// Creates a dispatcher for one service on one node.
    #[must_use]
    pub fn new(
        service_name: impl Into<String>,
        node_id: impl Into<String>,
        bus: Arc<StreamBus>,
        table: Arc<AccepterTable>,
        counters: Arc<RetryCounters>,
    ) -> Self {
        let service_name = service_name.into();
        let node_id = node_id.into();
        let group = keys::consumer_group_key(&service_name, &node_id);
        Self {
            service_name,
            node_id,
            group,
            bus,
            table,
            counters,
            dedup: Arc::new(RecentMessageSet::default()),
        }
    }

    /// This node's consumer group.
    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Polls once and dispatches everything returned.
    ///
    /// Transport failures are logged and reported as an empty round; the
    /// scheduled loop retries next cycle.
    pub async fn poll_once(&self) -> PollReport {
        let mut report = PollReport::default();

        let messages = match self
            .bus
            .poll(&self.group, &self.node_id, POLL_BATCH)
            .await
        {
            Ok(messages) => messages,
            Err(error) => {
                tracing::warn!(
                    service = %self.service_name,
                    %error,
                    "stream poll failed, retrying next cycle"
                );
                return report;
            }
        };
        report.polled = messages.len();

        for (message_id, task) in messages {
            let Some(accepter) = self.table.get(&task.action_name) else {
                // Another node may carry this accepter; leave the message
                // unacked until its expiry.
                tracing::debug!(
                    service = %self.service_name,
                    action = %task.action_name,
                    message_id = %message_id,
                    "no accepter for action, leaving message pending"
                );
                report.unmatched += 1;
                continue;
            };

            let record_limit = accepter.is_record_limit();
            if record_limit && self.dedup.contains(message_id) {
                let _ = self.bus.ack(&self.group, message_id).await;
                report.deduplicated += 1;
                continue;
            }

            report.dispatched += 1;
            if accepter.use_dedicated_worker() {
                let bus = Arc::clone(&self.bus);
                let counters = Arc::clone(&self.counters);
                let dedup = Arc::clone(&self.dedup);
                let service_name = self.service_name.clone();
                let group = self.group.clone();
                tokio::spawn(async move {
                    let outcome = invoke_resilient(
                        &accepter, &bus, &group, &service_name, message_id, &task, &counters,
                    )
                    .await;
                    if record_limit && matches!(outcome, InvocationOutcome::Processed { .. }) {
                        dedup.observe(message_id);
                    }
                });
            } else {
                let outcome = invoke_resilient(
                    &accepter,
                    &self.bus,
                    &self.group,
                    &self.service_name,
                    message_id,
                    &task,
                    &self.counters,
                )
                .await;
                if record_limit && matches!(outcome, InvocationOutcome::Processed { .. }) {
                    self.dedup.observe(message_id);
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::resilience::policy::RetryPolicy;
    use crate::storage::memory::MemoryRemoteCache;
    use crate::stream::accepter::{AcceptContext, HandlerError, TaskAccepter};

    struct CountingAccepter {
        action: &'static str,
        record_limit: bool,
        invocations: AtomicU32,
    }

    #[async_trait]
    impl TaskAccepter for CountingAccepter {
        fn action_name(&self) -> &str {
            self.action
        }
        fn is_record_limit(&self) -> bool {
            self.record_limit
        }
        fn retry_policy(&self) -> RetryPolicy {
            RetryPolicy {
                base_delay: Duration::from_millis(1),
                ..RetryPolicy::default()
            }
        }
        async fn accept(&self, _ctx: AcceptContext<'_>) -> Result<(), HandlerError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        cache: Arc<MemoryRemoteCache>,
        bus: Arc<StreamBus>,
    }

    fn fixture(ownership_timeout: Duration) -> Fixture {
        let cache =
            Arc::new(MemoryRemoteCache::new().with_ownership_timeout(ownership_timeout));
        let bus = Arc::new(StreamBus::new(
            cache.clone(),
            "svc1",
            Duration::from_secs(60),
        ));
        Fixture { cache, bus }
    }

    fn dispatcher(fx: &Fixture, table: AccepterTable) -> TaskDispatcher {
        TaskDispatcher::new(
            "svc1",
            "node-a",
            Arc::clone(&fx.bus),
            Arc::new(table),
            Arc::new(RetryCounters::new("svc1", fx.cache.clone())),
        )
    }

    #[tokio::test]
    async fn dispatches_matching_action_and_acks() {
        let fx = fixture(Duration::from_secs(30));
        let accepter = Arc::new(CountingAccepter {
            action: "inc",
            record_limit: false,
            invocations: AtomicU32::new(0),
        });
        let mut table = AccepterTable::default();
        table.insert(accepter.clone());
        let dispatcher = dispatcher(&fx, table);

        fx.bus.publish("inc", "1").await.unwrap();
        let report = dispatcher.poll_once().await;
        assert_eq!(report.polled, 1);
        assert_eq!(report.dispatched, 1);
        assert_eq!(accepter.invocations.load(Ordering::SeqCst), 1);

        // Acked: nothing left pending.
        let report = dispatcher.poll_once().await;
        assert_eq!(report.polled, 0);
    }

    #[tokio::test]
    async fn unmatched_action_is_left_pending() {
        let fx = fixture(Duration::from_millis(10));
        let dispatcher = dispatcher(&fx, AccepterTable::default());

        fx.bus.publish("unknown", "1").await.unwrap();
        let report = dispatcher.poll_once().await;
        assert_eq!(report.unmatched, 1);

        // Ownership lapses and the message comes back.
        tokio::time::sleep(Duration::from_millis(40)).await;
        let report = dispatcher.poll_once().await;
        assert_eq!(report.polled, 1);
        assert_eq!(report.unmatched, 1);
    }

    /// Delegating cache whose first `stream_ack` is dropped, simulating a
    /// lost acknowledgement.
    struct LostAckCache {
        inner: MemoryRemoteCache,
        dropped: AtomicU32,
    }

    #[async_trait]
    impl crate::storage::remote_cache::RemoteCache for LostAckCache {
        async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            self.inner.get(key).await
        }
        async fn set(
            &self,
            key: &str,
            value: &str,
            ttl: Option<Duration>,
        ) -> anyhow::Result<()> {
            self.inner.set(key, value, ttl).await
        }
        async fn remove(&self, key: &str) -> anyhow::Result<bool> {
            self.inner.remove(key).await
        }
        async fn ttl(&self, key: &str) -> anyhow::Result<crate::storage::remote_cache::KeyTtl> {
            self.inner.ttl(key).await
        }
        async fn expire(&self, key: &str, ttl: Duration) -> anyhow::Result<bool> {
            self.inner.expire(key, ttl).await
        }
        async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> anyhow::Result<i64> {
            self.inner.increment_with_ttl(key, ttl).await
        }
        async fn scan_keys(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
            self.inner.scan_keys(prefix).await
        }
        async fn stream_add(
            &self,
            stream: &str,
            task: &playergrid_core::task::StreamTask,
        ) -> anyhow::Result<playergrid_core::task::MessageId> {
            self.inner.stream_add(stream, task).await
        }
        async fn stream_read_group(
            &self,
            stream: &str,
            group: &str,
            consumer: &str,
            count: usize,
        ) -> anyhow::Result<Vec<(playergrid_core::task::MessageId, playergrid_core::task::StreamTask)>>
        {
            self.inner
                .stream_read_group(stream, group, consumer, count)
                .await
        }
        async fn stream_ack(
            &self,
            stream: &str,
            group: &str,
            id: playergrid_core::task::MessageId,
        ) -> anyhow::Result<bool> {
            if self.dropped.fetch_add(1, Ordering::SeqCst) == 0 {
                // Swallow the first ack: the message stays pending.
                return Ok(false);
            }
            self.inner.stream_ack(stream, group, id).await
        }
        async fn stream_remove(
            &self,
            stream: &str,
            id: playergrid_core::task::MessageId,
        ) -> anyhow::Result<bool> {
            self.inner.stream_remove(stream, id).await
        }
        async fn stream_trim_expired(&self, stream: &str) -> anyhow::Result<usize> {
            self.inner.stream_trim_expired(stream).await
        }
        async fn acquire_read(
            &self,
            key: &str,
            wait: Duration,
            hold: Duration,
        ) -> anyhow::Result<Option<crate::storage::remote_cache::LockGuard>> {
            self.inner.acquire_read(key, wait, hold).await
        }
        async fn acquire_write(
            &self,
            key: &str,
            wait: Duration,
            hold: Duration,
        ) -> anyhow::Result<Option<crate::storage::remote_cache::LockGuard>> {
            self.inner.acquire_write(key, wait, hold).await
        }
    }

    #[tokio::test]
    async fn record_limit_suppresses_local_reprocessing_after_lost_ack() {
        let cache = Arc::new(LostAckCache {
            inner: MemoryRemoteCache::new().with_ownership_timeout(Duration::from_millis(10)),
            dropped: AtomicU32::new(0),
        });
        let bus = Arc::new(StreamBus::new(
            cache.clone(),
            "svc1",
            Duration::from_secs(60),
        ));
        let accepter = Arc::new(CountingAccepter {
            action: "once",
            record_limit: true,
            invocations: AtomicU32::new(0),
        });
        let mut table = AccepterTable::default();
        table.insert(accepter.clone());
        let dispatcher = TaskDispatcher::new(
            "svc1",
            "node-a",
            Arc::clone(&bus),
            Arc::new(table),
            Arc::new(RetryCounters::new("svc1", cache.clone())),
        );

        bus.publish("once", "1").await.unwrap();
        dispatcher.poll_once().await;
        assert_eq!(accepter.invocations.load(Ordering::SeqCst), 1);

        // The ack was lost, so ownership lapses and the message redelivers;
        // the per-node dedup set suppresses reprocessing and re-acks.
        tokio::time::sleep(Duration::from_millis(40)).await;
        let report = dispatcher.poll_once().await;
        assert_eq!(report.deduplicated, 1);
        assert_eq!(accepter.invocations.load(Ordering::SeqCst), 1);

        // This time the ack stuck.
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(dispatcher.poll_once().await.polled, 0);
    }

    #[tokio::test]
    async fn another_group_sees_its_own_copy() {
        let fx = fixture(Duration::from_secs(30));
        let accepter = Arc::new(CountingAccepter {
            action: "inc",
            record_limit: false,
            invocations: AtomicU32::new(0),
        });
        let mut table_a = AccepterTable::default();
        table_a.insert(accepter.clone());
        let node_a = dispatcher(&fx, table_a);

        let accepter_b = Arc::new(CountingAccepter {
            action: "inc",
            record_limit: false,
            invocations: AtomicU32::new(0),
        });
        let mut table_b = AccepterTable::default();
        table_b.insert(accepter_b.clone());
        let node_b = TaskDispatcher::new(
            "svc1",
            "node-b",
            Arc::clone(&fx.bus),
            Arc::new(table_b),
            Arc::new(RetryCounters::new("svc1", fx.cache.clone())),
        );

        fx.bus.publish("inc", "1").await.unwrap();
        node_a.poll_once().await;
        node_b.poll_once().await;

        // Fan-out: both nodes processed their group's copy.
        assert_eq!(accepter.invocations.load(Ordering::SeqCst), 1);
        assert_eq!(accepter_b.invocations.load(Ordering::SeqCst), 1);
    }
}
