//! Retry policy and compensation configuration.
//!
//! A [`RetryPolicy`] describes how the resilience wrapper reacts to a
//! failed accepter invocation: how many attempts, how delays grow, which
//! failures are worth retrying, where the attempt counter lives, and what
//! compensation runs once attempts are exhausted.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use crate::stream::accepter::HandlerError;

use super::counter::RetryCounterKind;
use super::wrapper::FailureContext;

/// Predicate deciding whether a failure is retried.
#[derive(Clone)]
pub enum RetryCondition {
    /// Retry every failure (the default).
    Always,
    /// Retry only transient failures (I/O and resource errors).
    TransientOnly,
    /// Never retry.
    Never,
    /// Custom predicate.
    Custom(Arc<dyn Fn(&HandlerError) -> bool + Send + Sync>),
}

impl RetryCondition {
    /// Applies the predicate.
    #[must_use]
    pub fn should_retry(&self, error: &HandlerError) -> bool {
        match self {
            Self::Always => true,
            Self::TransientOnly => error.is_transient(),
            Self::Never => false,
            Self::Custom(predicate) => predicate(error),
        }
    }
}

impl fmt::Debug for RetryCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => f.write_str("Always"),
            Self::TransientOnly => f.write_str("TransientOnly"),
            Self::Never => f.write_str("Never"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// An action run when the wrapper gives up on a message.
///
/// Actions compose left-to-right; a failing action is logged and the chain
/// continues.
#[derive(Clone)]
pub enum CompensationAction {
    /// Log the terminal failure with full context.
    LogFailure,
    /// Acknowledge and delete the message so it is never redelivered.
    RemoveMessage,
    /// Custom callback over the failure context. A returned error is logged
    /// and the remaining actions still run.
    Custom(Arc<dyn Fn(&FailureContext<'_>) -> anyhow::Result<()> + Send + Sync>),
}

impl fmt::Debug for CompensationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LogFailure => f.write_str("LogFailure"),
            Self::RemoveMessage => f.write_str("RemoveMessage"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Full retry/compensation configuration for one accepter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Cap on invocation attempts.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// `true` doubles the delay per attempt; `false` keeps it constant.
    pub exponential_backoff: bool,
    /// Ceiling on any computed delay.
    pub max_delay: Duration,
    /// Which failures are retried at all.
    pub retry_condition: RetryCondition,
    /// Where the attempt counter lives.
    pub counter: RetryCounterKind,
    /// Under [`RetryCounterKind::Hybrid`], counter keys matching this
    /// pattern use the distributed counter; the rest stay local.
    pub distributed_key_pattern: Option<Regex>,
    /// Compensation chain run on give-up.
    pub exhaustion_actions: Vec<CompensationAction>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            exponential_backoff: true,
            max_delay: Duration::from_secs(30),
            retry_condition: RetryCondition::Always,
            counter: RetryCounterKind::Local,
            distributed_key_pattern: None,
            exhaustion_actions: vec![CompensationAction::LogFailure],
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = if self.exponential_backoff {
            let doublings = attempt.saturating_sub(1).min(32);
            self.base_delay.saturating_mul(1_u32 << doublings.min(31))
        } else {
            self.base_delay
        };
        delay.min(self.max_delay)
    }
}
