//! Version and timestamp based conflict resolution for entity records.
//!
//! Every write of an [`EntityRecord`] goes through [`resolve_save`], which
//! compares the incoming record against the currently stored one and decides
//! between four outcomes:
//!
//! 1. No current record: store the incoming record as-is.
//! 2. Incoming version is greater: overwrite, stamping the write time.
//! 3. Same version but incoming was modified later: overwrite and bump the
//!    version by one. The incoming modification time is preserved so that a
//!    later merge on another node compares against the edit time, not the
//!    store time.
//! 4. Otherwise: deterministic [`merge_records`].
//!
//! # Merge algebra
//!
//! [`merge_records`] is commutative over attribute-union, relationship-union
//! and version-max, and repeated application converges: merging a record
//! with itself changes nothing but the version counter. Conflicting
//! attribute values are decided by the greater record-level modification
//! time, with a lexicographic value tie-break so equal-time conflicts still
//! resolve identically on every node. No field is ever deleted by merge;
//! deletions must be modeled as tombstone attribute values interpreted by
//! the caller.

use crate::entity::EntityRecord;

/// How a save was applied against the stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveResolution {
    /// No stored record existed; the incoming record was written as-is.
    Fresh,
    /// Incoming version strictly newer; stored record was replaced.
    Overwrite,
    /// Same version, later modification time; replaced with version + 1.
    FastForward,
    /// Conflicting histories; records were merged field by field.
    Merged,
}

/// Result of resolving an incoming record against the stored state.
#[derive(Debug, Clone)]
pub struct ResolvedSave {
    /// The record that must now be written to the tier.
    pub record: EntityRecord,
    /// Which rule produced it.
    pub resolution: SaveResolution,
}

/// Resolves an incoming record against the currently stored one.
///
/// `now` is the wall-clock write time in milliseconds; it is only stamped
/// onto the result where the rules call for it (fresh writes, version
/// overwrites, and merges). The returned version is non-decreasing with
/// respect to both inputs.
#[must_use]
pub fn resolve_save(
    current: Option<&EntityRecord>,
    incoming: EntityRecord,
    now: i64,
) -> ResolvedSave {
    let Some(current) = current else {
        let mut record = incoming;
        record.last_modified_time = now;
        return ResolvedSave {
            record,
            resolution: SaveResolution::Fresh,
        };
    };

    if incoming.version > current.version {
        let mut record = incoming;
        record.last_modified_time = now;
        return ResolvedSave {
            record,
            resolution: SaveResolution::Overwrite,
        };
    }

    if incoming.version == current.version
        && incoming.last_modified_time > current.last_modified_time
    {
        let mut record = incoming;
        record.version += 1;
        // Keep the caller's modification time: merges on other nodes must
        // compare against when the data changed, not when it was stored.
        return ResolvedSave {
            record,
            resolution: SaveResolution::FastForward,
        };
    }

    ResolvedSave {
        record: merge_records(current, &incoming, now),
        resolution: SaveResolution::Merged,
    }
}

/// Deterministically combines two records sharing a uuid.
///
/// Attributes: union of keys; a key present in both takes the value from the
/// record with the greater `last_modified_time` (lexicographically greater
/// value on a time tie). Relationships: per-type set union. Version:
/// `max(a, b) + 1`. Modification time: `now`.
#[must_use]
pub fn merge_records(a: &EntityRecord, b: &EntityRecord, now: i64) -> EntityRecord {
    debug_assert_eq!(a.uuid, b.uuid, "merge requires records of the same uuid");

    let a_wins = a.last_modified_time > b.last_modified_time;
    let tie = a.last_modified_time == b.last_modified_time;

    let mut merged = a.clone();

    for (key, b_value) in &b.attributes {
        match merged.attributes.get_mut(key) {
            None => {
                merged.attributes.insert(key.clone(), b_value.clone());
            }
            Some(a_value) => {
                // Conflicting key: later record wins; on a time tie take the
                // lexicographically greater value so both sides agree.
                let b_wins = if tie { b_value > &*a_value } else { !a_wins };
                if b_wins {
                    *a_value = b_value.clone();
                }
            }
        }
    }

    for (rel_type, targets) in &b.relationships {
        merged
            .relationships
            .entry(rel_type.clone())
            .or_default()
            .extend(targets.iter().copied());
    }

    for (key, b_value) in &b.extras {
        match merged.extras.get_mut(key) {
            None => {
                merged.extras.insert(key.clone(), b_value.clone());
            }
            Some(a_value) => {
                let b_newer = if tie {
                    // serde_json values have no ordering; compare the
                    // canonical encoding for a stable tie-break.
                    b_value.to_string() > a_value.to_string()
                } else {
                    !a_wins
                };
                if b_newer {
                    *a_value = b_value.clone();
                }
            }
        }
    }

    merged.version = a.version.max(b.version) + 1;
    merged.last_modified_time = now;
    merged
}


#[cfg(test)]
mod proptests {
    use proptest::prelude::*;
    use uuid::Uuid;

    use super::*;

    fn arb_record(uuid: Uuid) -> impl Strategy<Value = EntityRecord> {
        (
            proptest::collection::btree_map("[a-c]{1,2}", "[x-z]{1,3}", 0..4),
            0_u64..5,
            0_i64..10_000,
        )
            .prop_map(move |(attributes, version, lmt)| {
                let mut r = EntityRecord::new(uuid, "guild");
                r.attributes = attributes;
                r.version = version;
                r.last_modified_time = lmt;
                r
            })
    }

    proptest! {
        #[test]
        fn merge_commutes(
            (a, b) in {
                let uuid = Uuid::from_u128(7);
                (arb_record(uuid), arb_record(uuid))
            }
        ) {
            let ab = merge_records(&a, &b, 99_999);
            let ba = merge_records(&b, &a, 99_999);
            prop_assert_eq!(ab, ba);
        }

        #[test]
        fn merge_with_self_preserves_content(
            a in arb_record(Uuid::from_u128(7))
        ) {
            let merged = merge_records(&a, &a, 50_000);
            prop_assert!(merged.same_content(&a));
        }

        #[test]
        fn merge_never_drops_a_key(
            (a, b) in {
                let uuid = Uuid::from_u128(7);
                (arb_record(uuid), arb_record(uuid))
            }
        ) {
            let merged = merge_records(&a, &b, 50_000);
            for key in a.attributes.keys().chain(b.attributes.keys()) {
                prop_assert!(merged.attributes.contains_key(key));
            }
        }

        #[test]
        fn resolve_never_decreases_version(
            (current, incoming) in {
                let uuid = Uuid::from_u128(7);
                (arb_record(uuid), arb_record(uuid))
            }
        ) {
            let resolved = resolve_save(Some(&current), incoming, 99_999);
            prop_assert!(resolved.record.version >= current.version);
        }
    }
}
