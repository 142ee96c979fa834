//! Partition-Role Algebra (spec.md §4.1). Pure functions, no I/O.

use crate::error::SvgmError;
use crate::mask::PartitionMask;
use crate::seqs::SeqMap;
use crate::PartitionId;

/// The three role bitmasks plus their sequence maps, passed by mutable
/// reference so the algebra can be applied in place.
pub struct RoleState<'a> {
    pub abitmask: &'a mut PartitionMask,
    pub pbitmask: &'a mut PartitionMask,
    pub cbitmask: &'a mut PartitionMask,
    pub seqs: &'a mut SeqMap,
    pub purge_seqs: &'a mut SeqMap,
}

fn check_bounds(ids: &[PartitionId], num_partitions: u32) -> Result<(), SvgmError> {
    for &id in ids {
        if id as u32 >= num_partitions {
            return Err(SvgmError::InvalidPartitionList(id));
        }
    }
    Ok(())
}

/// Pairwise disjointness of the three lists given to a single `set_state`
/// call; duplicated intent across lists is a caller error (spec.md §4.1,
/// "Tie-break").
pub fn check_pairwise_disjoint(
    active: &[PartitionId],
    passive: &[PartitionId],
    cleanup: &[PartitionId],
) -> Result<(), SvgmError> {
    let a = PartitionMask::from_ids(active.iter().copied());
    let p = PartitionMask::from_ids(passive.iter().copied());
    let c = PartitionMask::from_ids(cleanup.iter().copied());
    if a.intersects(&p) || a.intersects(&c) || p.intersects(&c) {
        return Err(SvgmError::IntersectingLists);
    }
    Ok(())
}

/// Validates disjointness and bounds for a `set_state`-style call. The
/// order (disjointness before bounds) is a documented implementation
/// choice -- see DESIGN.md, "Open Question: validation order".
pub fn validate_role_lists(
    active: &[PartitionId],
    passive: &[PartitionId],
    cleanup: &[PartitionId],
    num_partitions: u32,
) -> Result<(), SvgmError> {
    check_pairwise_disjoint(active, passive, cleanup)?;
    check_bounds(active, num_partitions)?;
    check_bounds(passive, num_partitions)?;
    check_bounds(cleanup, num_partitions)?;
    Ok(())
}

/// Promote the given partitions to active.
pub fn promote_to_active(state: &mut RoleState<'_>, ids: &[PartitionId]) {
    for &p in ids {
        if state.abitmask.is_set(p) {
            continue;
        }
        if state.pbitmask.is_set(p) {
            state.pbitmask.clear(p);
            state.abitmask.set(p);
            // sequences preserved: already present in seqs/purge_seqs.
        } else {
            state.abitmask.set(p);
            state.seqs.entry(p).or_insert(0);
            state.purge_seqs.entry(p).or_insert(0);
        }
    }
}

/// Promote the given partitions to passive. Symmetric with
/// [`promote_to_active`]; sequences are preserved across active<->passive.
pub fn promote_to_passive(state: &mut RoleState<'_>, ids: &[PartitionId]) {
    for &p in ids {
        if state.pbitmask.is_set(p) {
            continue;
        }
        if state.abitmask.is_set(p) {
            state.abitmask.clear(p);
            state.pbitmask.set(p);
        } else {
            state.pbitmask.set(p);
            state.seqs.entry(p).or_insert(0);
            state.purge_seqs.entry(p).or_insert(0);
        }
    }
}

/// Mark the given partitions for cleanup: cleared from active/passive,
/// set in cbitmask, and their sequence entries removed (they are no
/// longer indexed).
pub fn mark_for_cleanup(state: &mut RoleState<'_>, ids: &[PartitionId]) {
    for &p in ids {
        if state.cbitmask.is_set(p) {
            continue;
        }
        state.abitmask.clear(p);
        state.pbitmask.clear(p);
        state.cbitmask.set(p);
        state.seqs.remove(&p);
        state.purge_seqs.remove(&p);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn empty_state() -> (PartitionMask, PartitionMask, PartitionMask, SeqMap, SeqMap) {
        (
            PartitionMask::empty(),
            PartitionMask::empty(),
            PartitionMask::empty(),
            BTreeMap::new(),
            BTreeMap::new(),
        )
    }

    #[test]
    fn promote_fresh_partition_to_active_seeds_seqs() {
        let (mut a, mut p, mut c, mut seqs, mut purge) = empty_state();
        let mut state = RoleState {
            abitmask: &mut a,
            pbitmask: &mut p,
            cbitmask: &mut c,
            seqs: &mut seqs,
            purge_seqs: &mut purge,
        };
        promote_to_active(&mut state, &[3]);
        assert!(a.is_set(3));
        assert_eq!(seqs.get(&3), Some(&0));
        assert_eq!(purge.get(&3), Some(&0));
    }

    #[test]
    fn promote_passive_to_active_preserves_seq() {
        let (mut a, mut p, mut c, mut seqs, mut purge) = empty_state();
        p.set(3);
        seqs.insert(3, 42);
        purge.insert(3, 7);
        let mut state = RoleState {
            abitmask: &mut a,
            pbitmask: &mut p,
            cbitmask: &mut c,
            seqs: &mut seqs,
            purge_seqs: &mut purge,
        };
        promote_to_active(&mut state, &[3]);
        assert!(a.is_set(3));
        assert!(!p.is_set(3));
        assert_eq!(seqs.get(&3), Some(&42));
        assert_eq!(purge.get(&3), Some(&7));
    }

    #[test]
    fn mark_for_cleanup_removes_seq_entries() {
        let (mut a, mut p, mut c, mut seqs, mut purge) = empty_state();
        a.set(5);
        seqs.insert(5, 10);
        purge.insert(5, 2);
        let mut state = RoleState {
            abitmask: &mut a,
            pbitmask: &mut p,
            cbitmask: &mut c,
            seqs: &mut seqs,
            purge_seqs: &mut purge,
        };
        mark_for_cleanup(&mut state, &[5]);
        assert!(!a.is_set(5));
        assert!(c.is_set(5));
        assert!(!seqs.contains_key(&5));
        assert!(!purge.contains_key(&5));
    }

    #[test]
    fn intersecting_lists_rejected() {
        let err = check_pairwise_disjoint(&[1, 2], &[2, 3], &[]).unwrap_err();
        assert_eq!(err, SvgmError::IntersectingLists);
    }

    #[test]
    fn out_of_range_partition_rejected() {
        let err = validate_role_lists(&[10], &[], &[], 4).unwrap_err();
        assert_eq!(err, SvgmError::InvalidPartitionList(10));
    }
}
