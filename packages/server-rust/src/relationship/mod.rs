//! Relationship application helpers.
//!
//! Per-record set semantics live on the record itself; this module carries
//! the multi-record shapes the data service exposes: bidirectional pairs,
//! declarative N-directional batches, and the buffered
//! [`transaction`](crate::relationship::transaction) recorder.

pub mod transaction;

use std::collections::{BTreeMap, BTreeSet};

use playergrid_core::entity::EntityRecord;
use uuid::Uuid;

/// Declarative batch: source uuid -> relationship type -> targets.
pub type NDirectionalAssignments = BTreeMap<Uuid, BTreeMap<String, BTreeSet<Uuid>>>;

/// Applies both sides of a bidirectional relationship in memory.
///
/// With `type_ab == type_ba` this expresses a symmetric relation, otherwise
/// an inverse pair (e.g. `member_of` / `has_member`).
pub fn apply_bidirectional(
    a: &mut EntityRecord,
    b: &mut EntityRecord,
    type_ab: &str,
    type_ba: &str,
) {
    a.add_relationship(type_ab, b.uuid);
    b.add_relationship(type_ba, a.uuid);
}

/// Applies one source's assignments to its record.
pub fn apply_assignments(
    record: &mut EntityRecord,
    assignments: &BTreeMap<String, BTreeSet<Uuid>>,
) {
    for (relationship_type, targets) in assignments {
        for target in targets {
            record.add_relationship(relationship_type.clone(), *target);
        }
    }
}
