//! Per-service configuration.
//!
//! [`ServiceConfig`] enumerates everything a service instance can be tuned
//! with: collaborator connection parameters, background task intervals,
//! tier TTL defaults, L1 bounds, and lock timeouts. `validate()` is called
//! at construction and rejects unusable combinations with a configuration
//! error before any resource is touched.

use std::time::Duration;

use uuid::Uuid;

use super::error::ServiceError;

/// Minimum allowed stream poll interval.
pub const MIN_STREAM_ACCEPT_INTERVAL: Duration = Duration::from_millis(100);

/// How uuids are encoded in the document store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UuidRepresentation {
    /// RFC 4122 canonical encoding.
    #[default]
    Standard,
    /// Byte-swapped legacy encoding kept for old driver compatibility.
    JavaLegacy,
}

/// Connection parameters for the document store collaborator.
#[derive(Debug, Clone)]
pub struct MongoConfig {
    /// Connection string, e.g. `mongodb://localhost:27017`.
    pub connection_string: String,
    /// Database name.
    pub database: String,
    /// Uuid encoding used by the driver.
    pub uuid_representation: UuidRepresentation,
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            connection_string: "mongodb://localhost:27017".to_string(),
            database: "playergrid".to_string(),
            uuid_representation: UuidRepresentation::Standard,
        }
    }
}

/// Connection parameters for the shared cache / stream collaborator.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Server url, e.g. `redis://localhost:6379`.
    pub url: String,
    /// Per-command response timeout.
    pub response_timeout: Duration,
    /// Initial connection timeout.
    pub connect_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            response_timeout: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Full configuration of one service instance.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Registry key; must be unique per process.
    pub service_name: String,
    /// Identifies this node in consumer groups and sync messages. Defaults
    /// to a random id per instance.
    pub node_id: String,
    /// Document store connection parameters.
    pub mongo: MongoConfig,
    /// Shared cache connection parameters.
    pub redis: RedisConfig,
    /// Period of the L2-to-DB persistence task.
    pub auto_save_interval: Duration,
    /// Period of the stream poll task. Floored at
    /// [`MIN_STREAM_ACCEPT_INTERVAL`].
    pub stream_accept_interval: Duration,
    /// Period of the L1-to-L2 sync task.
    pub l1_sync_interval: Duration,
    /// Default L2 residency for plain entity records.
    pub entity_default_ttl: Duration,
    /// Default L2 residency for player records.
    pub player_default_ttl: Duration,
    /// L1 capacity bound. 0 = unbounded.
    pub l1_max_entries: usize,
    /// Optional L1 idle expiry.
    pub l1_max_idle: Option<Duration>,
    /// How long lock acquisitions wait before failing.
    pub lock_wait_timeout: Duration,
    /// Lease granted to acquired locks.
    pub lock_hold_timeout: Duration,
    /// Upper bound on one DB persistence batch; a single run may process
    /// only a prefix of the resident entries.
    pub max_batch: usize,
    /// Expiry stamped on published stream tasks.
    pub stream_task_ttl: Duration,
    /// How long `shutdown()` waits for background tasks and drains.
    pub shutdown_timeout: Duration,
}

impl ServiceConfig {
    /// Configuration with defaults for everything but the name.
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            node_id: format!("node-{}", Uuid::new_v4().simple()),
            mongo: MongoConfig::default(),
            redis: RedisConfig::default(),
            auto_save_interval: Duration::from_secs(2 * 60 * 60),
            stream_accept_interval: Duration::from_secs(2),
            l1_sync_interval: Duration::from_secs(30),
            entity_default_ttl: crate::storage::ttl::DEFAULT_ENTITY_TTL,
            player_default_ttl: crate::storage::ttl::DEFAULT_PLAYER_TTL,
            l1_max_entries: 10_000,
            l1_max_idle: None,
            lock_wait_timeout: Duration::from_secs(5),
            lock_hold_timeout: Duration::from_secs(30),
            max_batch: 100,
            stream_task_ttl: Duration::from_secs(60 * 60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    /// Validates the configuration, normalizing values with documented
    /// floors.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Configuration`] for an empty service name or
    /// node id, a zero batch bound, or zero TTL defaults.
    pub fn validate(mut self) -> Result<Self, ServiceError> {
        if self.service_name.trim().is_empty() {
            return Err(ServiceError::Configuration(
                "service_name must not be empty".to_string(),
            ));
        }
        if self.node_id.trim().is_empty() {
            return Err(ServiceError::Configuration(
                "node_id must not be empty".to_string(),
            ));
        }
        if self.max_batch == 0 {
            return Err(ServiceError::Configuration(
                "max_batch must be at least 1".to_string(),
            ));
        }
        if self.entity_default_ttl.is_zero() || self.player_default_ttl.is_zero() {
            return Err(ServiceError::Configuration(
                "default TTLs must be non-zero".to_string(),
            ));
        }
        if self.stream_accept_interval < MIN_STREAM_ACCEPT_INTERVAL {
            self.stream_accept_interval = MIN_STREAM_ACCEPT_INTERVAL;
        }
        Ok(self)
    }
}
