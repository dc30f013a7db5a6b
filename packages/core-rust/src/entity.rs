//! Entity record types for the data grid.
//!
//! Defines [`EntityRecord`], the unit of state managed by the service tiers:
//! a uuid-keyed document carrying free-form string attributes, typed
//! relationship sets, and the version/timestamp pair used by
//! [`merge`](crate::merge) for conflict resolution.
//!
//! # Serialization
//!
//! Records serialize to schema-tolerant JSON (`uuid`, `entityType`,
//! `attributes`, `relationships`, `version`, `lastModifiedTime`). Keys the
//! current build does not know about are captured in a flattened extras map
//! and survive a round-trip unchanged, so newer and older nodes can share
//! the same L2/DB documents.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed `entity_type` tag for player records.
///
/// A player is a plain [`EntityRecord`] with this tag; there is no
/// structural difference.
pub const PLAYER_ENTITY_TYPE: &str = "player";

/// Returns the current wall-clock time as milliseconds since the Unix epoch.
///
/// Millisecond timestamps fit comfortably in i64 until the year 292 million.
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// A versioned entity document keyed by uuid.
///
/// Attribute keys are unique; relationship targets are unordered sets, so
/// duplicate adds collapse. `version` is non-decreasing across successful
/// writes to the same uuid, and `last_modified_time` is bumped by every
/// mutator so concurrent edits can be ordered during merge.
///
/// # Examples
///
/// ```
/// use playergrid_core::entity::EntityRecord;
/// use uuid::Uuid;
///
/// let guild = Uuid::new_v4();
/// let member = Uuid::new_v4();
/// let mut record = EntityRecord::new(guild, "guild");
/// record.set_attribute("name", "Alpha");
/// record.add_relationship("has_member", member);
///
/// assert_eq!(record.attribute("name"), Some("Alpha"));
/// assert!(record.has_relationship("has_member", member));
/// assert_eq!(record.version, 0);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    /// Stable opaque identifier. Unique, immutable.
    pub uuid: Uuid,
    /// Short type tag (e.g. `"guild"`, `"player"`). Immutable after creation.
    pub entity_type: String,
    /// Free-form string attributes. Keys unique, insertion order irrelevant.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Relationship type -> set of target uuids. Pure tags: unordered, no
    /// duplicates.
    #[serde(default)]
    pub relationships: BTreeMap<String, BTreeSet<Uuid>>,
    /// Monotonically non-decreasing write version, starting at 0.
    #[serde(default)]
    pub version: u64,
    /// Milliseconds since epoch of the last mutation. Non-decreasing for a
    /// given uuid across successful writes.
    #[serde(default)]
    pub last_modified_time: i64,
    /// Unknown document keys, preserved verbatim on round-trip.
    #[serde(flatten)]
    pub extras: BTreeMap<String, serde_json::Value>,
}

impl EntityRecord {
    /// Creates a fresh record with version 0 and the current wall-clock time.
    #[must_use]
    pub fn new(uuid: Uuid, entity_type: impl Into<String>) -> Self {
        Self {
            uuid,
            entity_type: entity_type.into(),
            attributes: BTreeMap::new(),
            relationships: BTreeMap::new(),
            version: 0,
            last_modified_time: now_millis(),
            extras: BTreeMap::new(),
        }
    }

    /// Creates a fresh player record (`entity_type = "player"`).
    #[must_use]
    pub fn new_player(uuid: Uuid) -> Self {
        Self::new(uuid, PLAYER_ENTITY_TYPE)
    }

    /// Returns `true` if this record is a player record.
    #[must_use]
    pub fn is_player(&self) -> bool {
        self.entity_type == PLAYER_ENTITY_TYPE
    }

    /// Bumps `last_modified_time` to `now`, never going backwards.
    pub fn touch(&mut self, now: i64) {
        self.last_modified_time = self.last_modified_time.max(now);
    }

    // --- Attributes ---

    /// Returns the value of an attribute, if set.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Sets an attribute and bumps the modification time.
    ///
    /// Returns the previous value, if any.
    pub fn set_attribute(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Option<String> {
        let old = self.attributes.insert(key.into(), value.into());
        self.touch(now_millis());
        old
    }

    /// Removes an attribute and bumps the modification time.
    ///
    /// Note that merge never deletes fields (see [`crate::merge`]); a removal
    /// that must survive concurrent merges has to be modeled as a tombstone
    /// value interpreted by the caller.
    pub fn remove_attribute(&mut self, key: &str) -> Option<String> {
        let old = self.attributes.remove(key);
        if old.is_some() {
            self.touch(now_millis());
        }
        old
    }

    /// Builder-style attribute setter for test and seeding convenience.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attribute(key, value);
        self
    }

    // --- Relationships ---

    /// Adds `target` to the relationship set of `relationship_type`.
    ///
    /// Idempotent set-insert: returns `true` if the set changed.
    pub fn add_relationship(&mut self, relationship_type: impl Into<String>, target: Uuid) -> bool {
        let inserted = self
            .relationships
            .entry(relationship_type.into())
            .or_default()
            .insert(target);
        if inserted {
            self.touch(now_millis());
        }
        inserted
    }

    /// Removes `target` from the relationship set of `relationship_type`.
    ///
    /// Idempotent set-delete: returns `true` if the set changed. An emptied
    /// set is dropped from the map so `relationships` never carries empty
    /// entries.
    pub fn remove_relationship(&mut self, relationship_type: &str, target: Uuid) -> bool {
        let Some(targets) = self.relationships.get_mut(relationship_type) else {
            return false;
        };
        let removed = targets.remove(&target);
        if targets.is_empty() {
            self.relationships.remove(relationship_type);
        }
        if removed {
            self.touch(now_millis());
        }
        removed
    }

    /// Returns `true` if `target` is related under `relationship_type`.
    #[must_use]
    pub fn has_relationship(&self, relationship_type: &str, target: Uuid) -> bool {
        self.relationships
            .get(relationship_type)
            .is_some_and(|targets| targets.contains(&target))
    }

    /// Number of targets related under `relationship_type`.
    #[must_use]
    pub fn count_relationships(&self, relationship_type: &str) -> usize {
        self.relationships
            .get(relationship_type)
            .map_or(0, BTreeSet::len)
    }

    /// All targets related under `relationship_type`.
    #[must_use]
    pub fn related_entities(&self, relationship_type: &str) -> Vec<Uuid> {
        self.relationships
            .get(relationship_type)
            .map(|targets| targets.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Returns `true` if the records agree on attributes and relationships,
    /// ignoring version, timestamps, and extras.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.attributes == other.attributes && self.relationships == other.relationships
    }
}
