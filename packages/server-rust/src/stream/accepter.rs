//! Accepter contract and capability registry.
//!
//! An **accepter** is a handler registered against an `action_name`. The
//! dispatcher looks accepters up in an [`AccepterTable`] built once at
//! service startup from the process-global registry: host code calls
//! [`register_accepter`] with a factory for each accepter type it ships,
//! and every service constructs its own instances, filtered by
//! [`TaskAccepter::target_service_name`].

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use parking_lot::RwLock;
use playergrid_core::task::MessageId;
use thiserror::Error;

use crate::resilience::policy::RetryPolicy;
use crate::stream::bus::StreamBus;

/// Failure of an accepter invocation.
///
/// Accepters report outcomes as values; the resilience layer pattern-matches
/// on the variant (transient failures are retryable under the transient-only
/// retry condition, domain failures are not).
#[derive(Debug, Error)]
pub enum HandlerError {
    /// I/O failure reaching a collaborator.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    /// Transient resource failure (cache, store, stream).
    #[error("resource failure: {0}")]
    Resource(#[source] anyhow::Error),
    /// Any other handler failure.
    #[error("handler failure: {0}")]
    Other(#[source] anyhow::Error),
}

impl HandlerError {
    /// Wraps a transient resource failure.
    #[must_use]
    pub fn resource(err: impl Into<anyhow::Error>) -> Self {
        Self::Resource(err.into())
    }

    /// Wraps a non-transient failure.
    #[must_use]
    pub fn other(err: impl Into<anyhow::Error>) -> Self {
        Self::Other(err.into())
    }

    /// Whether the failure class is worth retrying by default.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Resource(_))
    }
}

/// Everything an accepter invocation gets to see and do.
///
/// Successful processing must acknowledge the message; returning `Ok` from
/// [`TaskAccepter::accept`] does that implicitly, and [`AcceptContext::ack`]
/// is available for accepters that want to acknowledge early. Failures must
/// not acknowledge, so an unacked message is redelivered after the group's
/// ownership timeout.
pub struct AcceptContext<'a> {
    /// The stream the task came from.
    pub stream: &'a str,
    /// Bus-assigned id of the message being handled.
    pub message_id: MessageId,
    /// Name of the service whose dispatcher invoked this accepter; resolve
    /// it through the service registry for data access.
    pub service_name: &'a str,
    /// Opaque task payload.
    pub payload: &'a str,
    pub(crate) bus: &'a StreamBus,
    pub(crate) group: &'a str,
}

impl AcceptContext<'_> {
    /// Acknowledges the message for this consumer group.
    ///
    /// Idempotent; the dispatcher also acknowledges after a successful
    /// return.
    pub async fn ack(&self) -> Result<(), HandlerError> {
        self.bus
            .ack(self.group, self.message_id)
            .await
            .map(|_| ())
            .map_err(HandlerError::resource)
    }
}

/// A handler for stream tasks matching one action name.
#[async_trait]
pub trait TaskAccepter: Send + Sync {
    /// The action name this accepter consumes.
    fn action_name(&self) -> &str;

    /// Restricts the accepter to a single service. `None` = every service
    /// that builds a table from the registry.
    fn target_service_name(&self) -> Option<&str> {
        None
    }

    /// When `true`, a given message id is processed at most once on this
    /// node (a bounded, TTL-limited dedup set is consulted before
    /// dispatch). Other nodes may still process the same message.
    fn is_record_limit(&self) -> bool {
        false
    }

    /// Scheduling hint. `false` (the default) runs the invocation inline in
    /// the cooperative poll loop, preserving per-consumer FIFO order;
    /// `true` detaches it onto its own worker task so a long-running
    /// handler does not stall the loop.
    fn use_dedicated_worker(&self) -> bool {
        false
    }

    /// Retry/compensation policy applied by the resilience wrapper.
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    /// Handles one task. See [`AcceptContext`] for the ack contract.
    async fn accept(&self, ctx: AcceptContext<'_>) -> Result<(), HandlerError>;
}

// ---------------------------------------------------------------------------
// Capability registry
// ---------------------------------------------------------------------------

/// Constructor for accepter instances.
pub type AccepterFactory = Arc<dyn Fn() -> Arc<dyn TaskAccepter> + Send + Sync>;

static FACTORIES: OnceLock<RwLock<Vec<AccepterFactory>>> = OnceLock::new();

fn factories() -> &'static RwLock<Vec<AccepterFactory>> {
    FACTORIES.get_or_init(|| RwLock::new(Vec::new()))
}

/// Registers an accepter factory process-wide.
///
/// Call once per accepter type at startup, before services are built.
/// Services construct their own instances, so per-service accepter state is
/// never shared.
pub fn register_accepter<F>(factory: F)
where
    F: Fn() -> Arc<dyn TaskAccepter> + Send + Sync + 'static,
{
    factories().write().push(Arc::new(factory));
}

/// Immutable `action_name -> accepter` table, built once per service.
#[derive(Default)]
pub struct AccepterTable {
    by_action: HashMap<String, Arc<dyn TaskAccepter>>,
}

impl AccepterTable {
    /// Builds the table for one service from the global registry.
    ///
    /// Accepters targeting a different service are skipped. A duplicate
    /// action name replaces the earlier registration with a warning.
    #[must_use]
    pub fn build_for(service_name: &str) -> Self {
        let mut table = Self::default();
        for factory in factories().read().iter() {
            let accepter = factory();
            if accepter
                .target_service_name()
                .is_some_and(|target| target != service_name)
            {
                continue;
            }
            table.insert(accepter);
        }
        table
    }

    /// Adds an accepter instance (used for service built-ins).
    pub fn insert(&mut self, accepter: Arc<dyn TaskAccepter>) {
        let action = accepter.action_name().to_string();
        if self.by_action.insert(action.clone(), accepter).is_some() {
            tracing::warn!(action = %action, "replacing previously registered accepter");
        }
    }

    /// Looks up the accepter for an action.
    #[must_use]
    pub fn get(&self, action_name: &str) -> Option<Arc<dyn TaskAccepter>> {
        self.by_action.get(action_name).map(Arc::clone)
    }

    /// Registered action names.
    #[must_use]
    pub fn actions(&self) -> Vec<&str> {
        self.by_action.keys().map(String::as_str).collect()
    }

    /// Number of registered accepters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_action.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_action.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopAccepter {
        action: &'static str,
        target: Option<&'static str>,
    }

    #[async_trait]
    impl TaskAccepter for NoopAccepter {
        fn action_name(&self) -> &str {
            self.action
        }
        fn target_service_name(&self) -> Option<&str> {
            self.target
        }
        async fn accept(&self, _ctx: AcceptContext<'_>) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn table_insert_and_lookup() {
        let mut table = AccepterTable::default();
        table.insert(Arc::new(NoopAccepter {
            action: "noop",
            target: None,
        }));
        assert!(table.get("noop").is_some());
        assert!(table.get("other").is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn build_for_filters_by_target_service() {
        // The registry is process-global; use action names unique to this
        // test to stay independent of other tests.
        register_accepter(|| {
            Arc::new(NoopAccepter {
                action: "accepter-test-any",
                target: None,
            })
        });
        register_accepter(|| {
            Arc::new(NoopAccepter {
                action: "accepter-test-scoped",
                target: Some("accepter-test-svc"),
            })
        });

        let table = AccepterTable::build_for("accepter-test-svc");
        assert!(table.get("accepter-test-any").is_some());
        assert!(table.get("accepter-test-scoped").is_some());

        let other = AccepterTable::build_for("some-other-svc");
        assert!(other.get("accepter-test-any").is_some());
        assert!(other.get("accepter-test-scoped").is_none());
    }

    #[test]
    fn handler_error_transience() {
        assert!(HandlerError::resource(anyhow::anyhow!("cache down")).is_transient());
        assert!(HandlerError::from(std::io::Error::other("net")).is_transient());
        assert!(!HandlerError::other(anyhow::anyhow!("bad payload")).is_transient());
    }
}
