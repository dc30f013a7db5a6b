//! Relationship query criteria.
//!
//! A [`RelationshipCriterion`] names a `(relationship_type, target)` pair,
//! optionally negated. Multi-criterion queries combine criteria with
//! [`CriteriaMode::All`] (conjunction) or [`CriteriaMode::Any`]
//! (disjunction) and are evaluated record-by-record by [`matches`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::EntityRecord;

/// A single relationship predicate: does the record relate to `target`
/// under `relationship_type`?
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipCriterion {
    /// Relationship type to test (e.g. `"member_of"`).
    pub relationship_type: String,
    /// Target uuid the relationship must (or must not) point at.
    pub target: Uuid,
    /// If `true`, the criterion holds when the relationship is absent.
    #[serde(default)]
    pub negated: bool,
}

impl RelationshipCriterion {
    /// Positive criterion: the relationship must be present.
    #[must_use]
    pub fn has(relationship_type: impl Into<String>, target: Uuid) -> Self {
        Self {
            relationship_type: relationship_type.into(),
            target,
            negated: false,
        }
    }

    /// Negated criterion: the relationship must be absent.
    #[must_use]
    pub fn lacks(relationship_type: impl Into<String>, target: Uuid) -> Self {
        Self {
            relationship_type: relationship_type.into(),
            target,
            negated: true,
        }
    }

    /// Evaluates this criterion against a record.
    #[must_use]
    pub fn holds(&self, record: &EntityRecord) -> bool {
        let present = record.has_relationship(&self.relationship_type, self.target);
        present != self.negated
    }
}

/// How multiple criteria combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CriteriaMode {
    /// Conjunction: every non-negated criterion must hold and every negated
    /// criterion must hold (relationship absent).
    All,
    /// Disjunction: at least one non-negated criterion must hold. Negated
    /// criteria do not participate in a disjunction.
    Any,
}

/// Evaluates a criteria list against a record.
///
/// Conjunctive evaluation short-circuits on the first failing criterion;
/// disjunctive evaluation short-circuits on the first satisfied positive
/// criterion. An empty criteria list matches everything under `All` and
/// nothing under `Any`.
#[must_use]
pub fn matches(record: &EntityRecord, criteria: &[RelationshipCriterion], mode: CriteriaMode) -> bool {
    match mode {
        CriteriaMode::All => criteria.iter().all(|criterion| criterion.holds(record)),
        CriteriaMode::Any => criteria
            .iter()
            .filter(|criterion| !criterion.negated)
            .any(|criterion| criterion.holds(record)),
    }
}
