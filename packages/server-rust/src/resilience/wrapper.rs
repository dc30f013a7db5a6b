//! Resilient accepter invocation.
//!
//! [`invoke_resilient`] wraps a single stream message's handling: it runs
//! the accepter, consults the failure handler on each failure, sleeps out
//! retry delays, and executes the compensation chain once the attempt
//! budget is spent. Attempt numbers come from [`RetryCounters`], so a
//! distributed policy bounds attempts across every node that sees the
//! message.

use playergrid_core::entity::now_millis;
use playergrid_core::task::{MessageId, StreamTask};
use std::sync::Arc;
use std::time::Duration;

use crate::stream::accepter::{AcceptContext, HandlerError, TaskAccepter};
use crate::stream::bus::StreamBus;

use super::counter::RetryCounters;
use super::policy::{CompensationAction, RetryPolicy};

/// Everything a failure handler and the compensation chain get to see.
pub struct FailureContext<'a> {
    /// The failure that triggered this consultation.
    pub error: &'a HandlerError,
    /// Stream the message came from.
    pub stream: &'a str,
    /// Id of the failing message.
    pub message_id: MessageId,
    /// Opaque task payload.
    pub payload: &'a str,
    /// Action name of the task.
    pub action_name: &'a str,
    /// 1-based attempt number that just failed.
    pub attempt: u32,
    /// Attempt budget from the policy.
    pub max_attempts: u32,
    /// Wall-clock millis of the failure.
    pub failed_at: i64,
}

/// What to do about a failed attempt.
#[derive(Debug, Clone)]
pub enum FailureDecision {
    /// Sleep, then invoke again.
    Retry {
        /// How long to wait before the next attempt.
        delay: Duration,
    },
    /// Stop retrying and run the compensation chain.
    GiveUp {
        /// Actions executed left-to-right.
        actions: Vec<CompensationAction>,
    },
}

/// Maps a failure to a decision.
///
/// The default is [`PolicyFailureHandler`]; custom handlers can inspect the
/// payload or error to special-case messages.
pub trait FailureHandler: Send + Sync {
    /// Decides the fate of a failed attempt.
    fn on_failure(&self, ctx: &FailureContext<'_>) -> FailureDecision;
}

/// Policy-driven failure handler: retry while the budget and retry
/// condition allow, then give up with the policy's exhaustion actions.
pub struct PolicyFailureHandler {
    policy: RetryPolicy,
}

impl PolicyFailureHandler {
    /// Wraps a policy.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

impl FailureHandler for PolicyFailureHandler {
    fn on_failure(&self, ctx: &FailureContext<'_>) -> FailureDecision {
        if ctx.attempt >= ctx.max_attempts
            || !self.policy.retry_condition.should_retry(ctx.error)
        {
            return FailureDecision::GiveUp {
                actions: self.policy.exhaustion_actions.clone(),
            };
        }
        FailureDecision::Retry {
            delay: self.policy.delay_for(ctx.attempt),
        }
    }
}

/// Terminal result of one message's resilient handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationOutcome {
    /// The accepter succeeded; the message was acknowledged.
    Processed {
        /// How many attempts it took.
        attempts: u32,
    },
    /// The attempt budget was spent; compensation ran.
    GivenUp {
        /// How many attempts this node made.
        attempts: u32,
    },
}

/// Runs one message through the accepter under the retry policy.
///
/// Retry delays are awaited inside this future, so a dispatcher that wants
/// the poll loop to keep moving detaches it onto its own task.
pub async fn invoke_resilient(
    accepter: &Arc<dyn TaskAccepter>,
    bus: &StreamBus,
    group: &str,
    service_name: &str,
    message_id: MessageId,
    task: &StreamTask,
    counters: &RetryCounters,
) -> InvocationOutcome {
    let policy = accepter.retry_policy();
    let handler = PolicyFailureHandler::new(policy.clone());
    let mut local_attempts = 0_u32;

    loop {
        let attempt = counters.next_attempt(&policy, message_id).await;
        if attempt > policy.max_attempts {
            // The budget was spent, possibly by other nodes under a
            // distributed counter. Acknowledge so this group stops
            // redelivering a message nobody will process again.
            tracing::debug!(
                message_id = %message_id,
                action = %task.action_name,
                "attempt budget already spent, dropping message"
            );
            let _ = bus.ack(group, message_id).await;
            counters.clear(&policy, message_id).await;
            return InvocationOutcome::GivenUp {
                attempts: local_attempts,
            };
        }
        local_attempts += 1;

        let ctx = AcceptContext {
            stream: bus.stream_key(),
            message_id,
            service_name,
            payload: &task.data,
            bus,
            group,
        };
        match accepter.accept(ctx).await {
            Ok(()) => {
                let _ = bus.ack(group, message_id).await;
                counters.clear(&policy, message_id).await;
                metrics::counter!("playergrid_tasks_processed").increment(1);
                return InvocationOutcome::Processed { attempts: attempt };
            }
            Err(error) => {
                metrics::counter!("playergrid_task_failures").increment(1);
                let failure = FailureContext {
                    error: &error,
                    stream: bus.stream_key(),
                    message_id,
                    payload: &task.data,
                    action_name: &task.action_name,
                    attempt,
                    max_attempts: policy.max_attempts,
                    failed_at: now_millis(),
                };
                match handler.on_failure(&failure) {
                    FailureDecision::Retry { delay } => {
                        tracing::debug!(
                            message_id = %message_id,
                            action = %task.action_name,
                            attempt,
                            ?delay,
                            %error,
                            "accepter failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    FailureDecision::GiveUp { actions } => {
                        run_compensations(&actions, &failure, bus, group).await;
                        counters.clear(&policy, message_id).await;
                        metrics::counter!("playergrid_tasks_given_up").increment(1);
                        return InvocationOutcome::GivenUp { attempts: attempt };
                    }
                }
            }
        }
    }
}

/// Executes a compensation chain left-to-right. A failing action is logged
/// and the chain continues.
async fn run_compensations(
    actions: &[CompensationAction],
    failure: &FailureContext<'_>,
    bus: &StreamBus,
    group: &str,
) {
    for action in actions {
        match action {
            CompensationAction::LogFailure => {
                tracing::error!(
                    message_id = %failure.message_id,
                    action = %failure.action_name,
                    attempts = failure.attempt,
                    payload = %failure.payload,
                    error = %failure.error,
                    "giving up on stream task"
                );
            }
            CompensationAction::RemoveMessage => {
                if let Err(error) = bus.ack(group, failure.message_id).await {
                    tracing::warn!(message_id = %failure.message_id, %error, "compensation ack failed");
                }
                if let Err(error) = bus.remove(failure.message_id).await {
                    tracing::warn!(message_id = %failure.message_id, %error, "compensation remove failed");
                }
            }
            CompensationAction::Custom(callback) => {
                if let Err(error) = callback(failure) {
                    tracing::warn!(
                        message_id = %failure.message_id,
                        %error,
                        "custom compensation failed, continuing chain"
                    );
                }
            }
        }
    }
}
