//! `PlayerGrid` Core -- entity records, merge rules, criteria, and task schemas.
//!
//! This crate provides the foundation layer for the `PlayerGrid` data service:
//!
//! - **Entity** ([`entity`]): [`EntityRecord`] with attributes, relationship
//!   sets, version, and modification time; player records as a fixed-type
//!   specialization
//! - **Merge** ([`merge`]): deterministic version/timestamp conflict
//!   resolution applied on every save
//! - **Criteria** ([`criteria`]): relationship predicates with AND/OR
//!   combination for multi-criterion queries
//! - **Task** ([`task`]): stream task schema and ordered message ids
//! - **Keys** ([`keys`]): the deterministic L2 key namespace shared by all
//!   nodes

pub mod criteria;
pub mod entity;
pub mod keys;
pub mod merge;
pub mod task;

// Entity
pub use entity::{now_millis, EntityRecord, PLAYER_ENTITY_TYPE};

// Merge
pub use merge::{merge_records, resolve_save, ResolvedSave, SaveResolution};

// Criteria
pub use criteria::{matches, CriteriaMode, RelationshipCriterion};

// Task
pub use task::{MessageId, ParseMessageIdError, StreamTask};
