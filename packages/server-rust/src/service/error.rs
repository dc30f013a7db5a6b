//! Caller-facing error taxonomy.
//!
//! Version conflicts never appear here: they are resolved internally by
//! merge and an on-demand operation only ever observes the merged result.
//! Scheduled tasks never propagate either; they log and rely on the next
//! cycle.

use thiserror::Error;

/// Errors surfaced by service operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Invalid service parameters. Fatal at construction; never retried.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A service with this name is already registered in the process.
    #[error("service name already registered: {name}")]
    DuplicateService {
        /// The conflicting name.
        name: String,
    },

    /// A lock wait timed out.
    #[error("timed out waiting for lock {key}")]
    LockTimeout {
        /// The contended lock key.
        key: String,
    },

    /// The operation was attempted after `shutdown()`.
    #[error("service is shut down")]
    ShutDown,

    /// Transient cache/store/stream failure, surfaced for on-demand
    /// operations so the caller may react.
    #[error("resource failure: {0}")]
    Resource(#[from] anyhow::Error),
}

/// Convenience alias for service results.
pub type ServiceResult<T> = Result<T, ServiceError>;
