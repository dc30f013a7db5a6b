//! Retry, compensation, and attempt counting around accepter invocations.

pub mod counter;
pub mod policy;
pub mod wrapper;

pub use counter::{RetryCounterKind, RetryCounters};
pub use policy::{CompensationAction, RetryCondition, RetryPolicy};
pub use wrapper::{
    invoke_resilient, FailureContext, FailureDecision, FailureHandler, InvocationOutcome,
    PolicyFailureHandler,
};
