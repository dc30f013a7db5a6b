//! Buffered relationship transactions.
//!
//! A [`RelationshipTransaction`] records add/remove calls without touching
//! any record. On successful return from the caller's closure the service
//! replays the buffer against live records and batch-saves them; if the
//! closure fails, the buffer is simply dropped.
//!
//! Replay aborts on the first op whose source record is missing; ops after
//! the failure point are not applied, and already-applied in-memory edits
//! are not rolled back. Callers that need all-or-nothing behavior replay
//! against clones (the service does exactly that) so nothing live mutates
//! before the whole buffer is known to apply.

use std::collections::{BTreeMap, BTreeSet};

use playergrid_core::entity::EntityRecord;
use thiserror::Error;
use uuid::Uuid;

/// One buffered relationship mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationshipOp {
    /// Set-insert `target` under `relationship_type` on `source`.
    Add {
        /// Record being mutated.
        source: Uuid,
        /// Relationship type.
        relationship_type: String,
        /// Target uuid.
        target: Uuid,
    },
    /// Set-delete `target` under `relationship_type` on `source`.
    Remove {
        /// Record being mutated.
        source: Uuid,
        /// Relationship type.
        relationship_type: String,
        /// Target uuid.
        target: Uuid,
    },
}

impl RelationshipOp {
    /// The record this op mutates.
    #[must_use]
    pub fn source(&self) -> Uuid {
        match self {
            Self::Add { source, .. } | Self::Remove { source, .. } => *source,
        }
    }
}

/// Replay failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransactionError {
    /// An op referenced a record that is not loaded; replay aborted there.
    #[error("transaction references unknown record {uuid}")]
    MissingRecord {
        /// The unresolved source uuid.
        uuid: Uuid,
    },
}

/// Buffers relationship ops for deferred replay.
#[derive(Debug, Default)]
pub struct RelationshipTransaction {
    ops: Vec<RelationshipOp>,
}

impl RelationshipTransaction {
    /// Buffers an add.
    pub fn add_relationship(
        &mut self,
        source: Uuid,
        relationship_type: impl Into<String>,
        target: Uuid,
    ) -> &mut Self {
        self.ops.push(RelationshipOp::Add {
            source,
            relationship_type: relationship_type.into(),
            target,
        });
        self
    }

    /// Buffers a remove.
    pub fn remove_relationship(
        &mut self,
        source: Uuid,
        relationship_type: impl Into<String>,
        target: Uuid,
    ) -> &mut Self {
        self.ops.push(RelationshipOp::Remove {
            source,
            relationship_type: relationship_type.into(),
            target,
        });
        self
    }

    /// The buffered ops, in call order.
    #[must_use]
    pub fn ops(&self) -> &[RelationshipOp] {
        &self.ops
    }

    /// Whether anything was buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Every source uuid the buffer touches.
    #[must_use]
    pub fn referenced_uuids(&self) -> BTreeSet<Uuid> {
        self.ops.iter().map(RelationshipOp::source).collect()
    }

    /// Consumes the buffer.
    #[must_use]
    pub fn into_ops(self) -> Vec<RelationshipOp> {
        self.ops
    }
}

/// Replays ops against loaded records, aborting on the first missing
/// source.
///
/// # Errors
///
/// [`TransactionError::MissingRecord`] at the first op whose source is not
/// in `records`; subsequent ops are not applied.
pub fn replay(
    ops: &[RelationshipOp],
    records: &mut BTreeMap<Uuid, EntityRecord>,
) -> Result<(), TransactionError> {
    for op in ops {
        let record = records
            .get_mut(&op.source())
            .ok_or(TransactionError::MissingRecord { uuid: op.source() })?;
        match op {
            RelationshipOp::Add {
                relationship_type,
                target,
                ..
            } => {
                record.add_relationship(relationship_type.clone(), *target);
            }
            RelationshipOp::Remove {
                relationship_type,
                target,
                ..
            } => {
                record.remove_relationship(relationship_type, *target);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(records: &[&EntityRecord]) -> BTreeMap<Uuid, EntityRecord> {
        records.iter().map(|r| (r.uuid, (*r).clone())).collect()
    }

    #[test]
    fn buffering_does_not_touch_records() {
        let guild = EntityRecord::new(Uuid::new_v4(), "guild");
        let member = Uuid::new_v4();

        let mut txn = RelationshipTransaction::default();
        txn.add_relationship(guild.uuid, "has_member", member);

        assert_eq!(txn.ops().len(), 1);
        assert!(!guild.has_relationship("has_member", member));
    }

    #[test]
    fn replay_applies_in_call_order() {
        let guild = EntityRecord::new(Uuid::new_v4(), "guild");
        let member = Uuid::new_v4();

        let mut txn = RelationshipTransaction::default();
        txn.add_relationship(guild.uuid, "has_member", member)
            .remove_relationship(guild.uuid, "has_member", member);

        let mut records = loaded(&[&guild]);
        replay(&txn.into_ops(), &mut records).unwrap();
        assert!(!records[&guild.uuid].has_relationship("has_member", member));
    }

    #[test]
    fn replay_aborts_on_first_missing_record() {
        let known = EntityRecord::new(Uuid::new_v4(), "guild");
        let unknown = Uuid::new_v4();
        let target = Uuid::new_v4();

        let mut txn = RelationshipTransaction::default();
        txn.add_relationship(known.uuid, "pre", target)
            .add_relationship(unknown, "mid", target)
            .add_relationship(known.uuid, "post", target);

        let mut records = loaded(&[&known]);
        let err = replay(&txn.into_ops(), &mut records).unwrap_err();
        assert_eq!(err, TransactionError::MissingRecord { uuid: unknown });

        // Ops before the failure applied; ops after did not.
        assert!(records[&known.uuid].has_relationship("pre", target));
        assert!(!records[&known.uuid].has_relationship("post", target));
    }

    #[test]
    fn referenced_uuids_lists_sources_only() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let target = Uuid::new_v4();

        let mut txn = RelationshipTransaction::default();
        txn.add_relationship(a, "x", target)
            .remove_relationship(b, "y", target);

        assert_eq!(
            txn.referenced_uuids(),
            [a, b].into_iter().collect::<BTreeSet<_>>()
        );
    }
}
