//! Stats & History (spec.md §2): a bounded ring of recent
//! update/cleanup/compaction records plus counters. Side-effect only --
//! nothing here feeds back into controller decisions.
//!
//! Grounded on `pbs_datastore::GarbageCollectionStatus`: a plain struct
//! updated in place after each run and handed out by value to callers.

use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum HistoryEntry {
    Update {
        partitions_indexed: u32,
        duration: Duration,
    },
    Cleanup {
        removed_count: u64,
        duration: Duration,
    },
    Compaction {
        duration: Duration,
    },
}

#[derive(Debug, Clone, Default)]
pub struct Counters {
    pub updates_run: u64,
    pub cleanups_run: u64,
    pub compactions_run: u64,
    pub updater_errors: u64,
}

/// A fixed-capacity ring buffer of recent activity plus running counters.
pub struct History {
    capacity: usize,
    ring: VecDeque<HistoryEntry>,
    counters: Counters,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ring: VecDeque::with_capacity(capacity),
            counters: Counters::default(),
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        match &entry {
            HistoryEntry::Update { .. } => self.counters.updates_run += 1,
            HistoryEntry::Cleanup { .. } => self.counters.cleanups_run += 1,
            HistoryEntry::Compaction { .. } => self.counters.compactions_run += 1,
        }
        if self.ring.len() == self.capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(entry);
    }

    pub fn record_updater_error(&mut self) {
        self.counters.updater_errors += 1;
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn recent(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.ring.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_drops_oldest_past_capacity() {
        let mut h = History::new(2);
        h.push(HistoryEntry::Update {
            partitions_indexed: 1,
            duration: Duration::from_secs(1),
        });
        h.push(HistoryEntry::Cleanup {
            removed_count: 1,
            duration: Duration::from_secs(1),
        });
        h.push(HistoryEntry::Compaction {
            duration: Duration::from_secs(1),
        });
        assert_eq!(h.recent().count(), 2);
        assert_eq!(h.counters().updates_run, 1);
        assert_eq!(h.counters().cleanups_run, 1);
        assert_eq!(h.counters().compactions_run, 1);
    }
}
