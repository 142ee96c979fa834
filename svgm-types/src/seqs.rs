//! Per-partition sequence maps (`seqs`, `purge_seqs`).
//!
//! Keyed by partition id, kept in a `BTreeMap` so iteration is always
//! ascending by partition-id -- the order the durable header serialises
//! them in (spec.md §6).

use std::collections::BTreeMap;

use crate::mask::PartitionMask;
use crate::PartitionId;

pub type SeqMap = BTreeMap<PartitionId, u64>;

/// The set of partition ids that appear as keys, as a `PartitionMask`.
pub fn keys_mask(seqs: &SeqMap) -> PartitionMask {
    PartitionMask::from_ids(seqs.keys().copied())
}
