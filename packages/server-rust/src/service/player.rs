//! Player data service.
//!
//! A player is an entity with the fixed type tag and the longer default
//! residency; there is no structural difference. [`PlayerDataService`]
//! wraps an [`EntityDataService`] with player-typed entry points, and the
//! full entity API stays reachable through [`entities`](PlayerDataService::entities).

use std::sync::Arc;

use playergrid_core::entity::{EntityRecord, PLAYER_ENTITY_TYPE};
use uuid::Uuid;

use crate::storage::document_store::DocumentStore;
use crate::storage::remote_cache::RemoteCache;

use super::config::ServiceConfig;
use super::data_service::EntityDataService;
use super::error::ServiceResult;

/// Player-typed facade over the entity data service.
pub struct PlayerDataService {
    inner: Arc<EntityDataService>,
}

impl PlayerDataService {
    /// Builds, registers, and starts the underlying service.
    ///
    /// # Errors
    ///
    /// Same as [`EntityDataService::start`].
    pub async fn start(
        config: ServiceConfig,
        l2: Arc<dyn RemoteCache>,
        db: Arc<dyn DocumentStore>,
    ) -> ServiceResult<Self> {
        Ok(Self {
            inner: EntityDataService::start(config, l2, db).await?,
        })
    }

    /// Wraps an already running service.
    #[must_use]
    pub fn wrap(inner: Arc<EntityDataService>) -> Self {
        Self { inner }
    }

    /// The underlying entity service, for operations without a player
    /// shorthand.
    #[must_use]
    pub fn entities(&self) -> &Arc<EntityDataService> {
        &self.inner
    }

    /// Existing player record from any tier, or a fresh unsaved one.
    ///
    /// # Errors
    ///
    /// Same as [`EntityDataService::create`].
    pub async fn create_player(&self, uuid: Uuid) -> ServiceResult<EntityRecord> {
        self.inner.create(uuid, PLAYER_ENTITY_TYPE).await
    }

    /// Read-through player lookup.
    ///
    /// # Errors
    ///
    /// Same as [`EntityDataService::get`].
    pub async fn get_player(&self, uuid: Uuid) -> ServiceResult<Option<EntityRecord>> {
        self.inner.get(uuid).await
    }

    /// Saves a player record.
    ///
    /// # Errors
    ///
    /// Same as [`EntityDataService::save`].
    pub async fn save_player(&self, record: EntityRecord) -> ServiceResult<EntityRecord> {
        self.inner.save(record).await
    }

    /// All document-store resident players.
    ///
    /// # Errors
    ///
    /// Same as [`EntityDataService::find_by_type`].
    pub async fn find_players(&self) -> ServiceResult<Vec<EntityRecord>> {
        self.inner.find_by_type(PLAYER_ENTITY_TYPE).await
    }

    /// Shuts the underlying service down.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}
