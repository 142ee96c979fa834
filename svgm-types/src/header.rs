//! The durable index header (spec.md §3, §6).

use serde::{Deserialize, Serialize};

use crate::mask::PartitionMask;
use crate::seqs::SeqMap;
use crate::PartitionId;

/// Opaque B-tree root pointer. SVGM never interprets its bytes; the
/// B-tree engine is an external collaborator (spec.md §1, Out of scope).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BtreeRootState(pub Vec<u8>);

/// A persisted role-change request deferred because some of its partitions
/// are still draining through cleanup (spec.md §3, "Transition Record").
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub active: Vec<PartitionId>,
    pub passive: Vec<PartitionId>,
    pub cleanup: Vec<PartitionId>,
}

impl TransitionRecord {
    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.passive.is_empty() && self.cleanup.is_empty()
    }

    /// Lists must be pairwise disjoint (Invariant 5).
    pub fn is_pairwise_disjoint(&self) -> bool {
        let a = PartitionMask::from_ids(self.active.iter().copied());
        let p = PartitionMask::from_ids(self.passive.iter().copied());
        let c = PartitionMask::from_ids(self.cleanup.iter().copied());
        a.is_disjoint(&p) && a.is_disjoint(&c) && p.is_disjoint(&c)
    }

    /// Union of the active/passive sides -- the partitions a waiter's
    /// `wanted_partitions` is checked against (spec.md §3, "Waiting Lists").
    pub fn active_or_passive(&self) -> PartitionMask {
        PartitionMask::from_ids(self.active.iter().copied().chain(self.passive.iter().copied()))
    }
}

/// Per-view B-tree state: its own root plus its own sequence maps, since a
/// view may lag the group-wide `seqs` while it catches up (spec.md §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViewState {
    pub btree_state: BtreeRootState,
    pub seqs: SeqMap,
    pub purge_seqs: SeqMap,
}

/// The durable record written to the index file (spec.md §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexHeader {
    pub num_partitions: Option<u32>,
    pub abitmask: PartitionMask,
    pub pbitmask: PartitionMask,
    pub cbitmask: PartitionMask,
    pub seqs: SeqMap,
    pub purge_seqs: SeqMap,
    pub has_replica: bool,
    pub replicas_on_transfer: PartitionMask,
    pub pending_transition: Option<TransitionRecord>,
    pub id_btree_state: BtreeRootState,
    pub view_states: Vec<ViewState>,
}

impl Default for IndexHeader {
    fn default() -> Self {
        Self {
            num_partitions: None,
            abitmask: PartitionMask::empty(),
            pbitmask: PartitionMask::empty(),
            cbitmask: PartitionMask::empty(),
            seqs: SeqMap::new(),
            purge_seqs: SeqMap::new(),
            has_replica: false,
            replicas_on_transfer: PartitionMask::empty(),
            pending_transition: None,
            id_btree_state: BtreeRootState::default(),
            view_states: Vec::new(),
        }
    }
}

impl IndexHeader {
    pub fn is_defined(&self) -> bool {
        self.num_partitions.is_some()
    }

    /// Invariants 1-5 (spec.md §3). Does not check Invariant 6 (role
    /// exclusivity), which is a property of the controller's state
    /// machine, not of the header alone.
    pub fn check_invariants(&self) -> Result<(), &'static str> {
        if !self.abitmask.is_disjoint(&self.pbitmask) {
            return Err("abitmask and pbitmask overlap");
        }
        if !self.abitmask.is_disjoint(&self.cbitmask) {
            return Err("abitmask and cbitmask overlap");
        }
        if !self.pbitmask.is_disjoint(&self.cbitmask) {
            return Err("pbitmask and cbitmask overlap");
        }
        let indexed = self.abitmask.union(&self.pbitmask);
        let seq_keys = crate::seqs::keys_mask(&self.seqs);
        let purge_keys = crate::seqs::keys_mask(&self.purge_seqs);
        if seq_keys != indexed {
            return Err("keys(seqs) != bits(abitmask | pbitmask)");
        }
        if purge_keys != indexed {
            return Err("keys(purge_seqs) != bits(abitmask | pbitmask)");
        }
        if self
            .replicas_on_transfer
            .iter_ones()
            .any(|p| !indexed.is_set(p))
        {
            return Err("replicas_on_transfer not subset of abitmask | pbitmask");
        }
        if let Some(t) = &self.pending_transition {
            if !t.is_pairwise_disjoint() {
                return Err("pending_transition lists are not pairwise disjoint");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_header_is_valid_and_undefined() {
        let h = IndexHeader::default();
        assert!(!h.is_defined());
        assert!(h.check_invariants().is_ok());
    }

    #[test]
    fn overlapping_masks_fail_invariants() {
        let mut h = IndexHeader::default();
        h.abitmask.set(1);
        h.pbitmask.set(1);
        assert!(h.check_invariants().is_err());
    }

    #[test]
    fn mismatched_seq_keys_fail_invariants() {
        let mut h = IndexHeader::default();
        h.abitmask.set(1);
        h.seqs.insert(1, 0);
        h.purge_seqs.insert(1, 0);
        h.abitmask.set(2);
        // seqs missing partition 2
        assert!(h.check_invariants().is_err());
    }
}
