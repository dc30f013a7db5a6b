//! Process-global service registry.
//!
//! Maps service names to live [`EntityDataService`] instances so accepters
//! and host code can reach a service from anywhere in the process. The
//! registry is initialized lazily on first use and torn down by the host at
//! process exit; `shutdown()` removes the instance so the name can be
//! reused.

use std::sync::{Arc, OnceLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::data_service::EntityDataService;
use super::error::ServiceError;

static REGISTRY: OnceLock<DashMap<String, Arc<EntityDataService>>> = OnceLock::new();

fn registry() -> &'static DashMap<String, Arc<EntityDataService>> {
    REGISTRY.get_or_init(DashMap::new)
}

/// Registers a service under its name.
///
/// # Errors
///
/// Returns [`ServiceError::DuplicateService`] if the name is taken. The
/// check-and-insert is atomic: two racing registrations of the same name
/// cannot both succeed.
pub fn register(service: &Arc<EntityDataService>) -> Result<(), ServiceError> {
    match registry().entry(service.name().to_string()) {
        Entry::Occupied(_) => Err(ServiceError::DuplicateService {
            name: service.name().to_string(),
        }),
        Entry::Vacant(slot) => {
            slot.insert(Arc::clone(service));
            Ok(())
        }
    }
}

/// Looks up a registered service by name.
#[must_use]
pub fn lookup(name: &str) -> Option<Arc<EntityDataService>> {
    registry().get(name).map(|entry| Arc::clone(entry.value()))
}

/// Removes a service from the registry. Returns whether it was present.
pub fn unregister(name: &str) -> bool {
    registry().remove(name).is_some()
}

/// Names of all currently registered services.
#[must_use]
pub fn registered_names() -> Vec<String> {
    registry().iter().map(|entry| entry.key().clone()).collect()
}
