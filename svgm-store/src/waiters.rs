//! Waiter Queues (spec.md §3, §4.3): two FIFO collections of parked
//! client reply handles.

use std::collections::VecDeque;

use svgm_types::{PartitionMask, SvgmError};
use tokio::sync::oneshot;

use crate::snapshot::GroupSnapshot;

/// What a parked `request_group` call eventually receives.
#[derive(Debug)]
pub enum WaiterReply {
    Ready {
        group: GroupSnapshot,
        active_replicas: PartitionMask,
    },
    Err(SvgmError),
}

pub struct Waiter {
    pub wanted_partitions: PartitionMask,
    reply_tx: oneshot::Sender<WaiterReply>,
}

impl Waiter {
    pub fn new(wanted_partitions: PartitionMask) -> (Self, oneshot::Receiver<WaiterReply>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                wanted_partitions,
                reply_tx: tx,
            },
            rx,
        )
    }

    fn reply(self, msg: WaiterReply) {
        // The caller may have dropped its receiver (e.g. request cancelled);
        // that is not this queue's problem.
        let _ = self.reply_tx.send(msg);
    }
}

/// FIFO queue of parked waiters, drained in arrival order.
#[derive(Default)]
pub struct WaiterQueue {
    queue: VecDeque<Waiter>,
}

impl WaiterQueue {
    pub fn push(&mut self, waiter: Waiter) {
        self.queue.push_back(waiter);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Replies to every waiter with the same ready snapshot (spec.md §4.3:
    /// `waiting_list` drains in full once the updater reaches
    /// `updating_passive`).
    pub fn drain_ready(&mut self, group: &GroupSnapshot, active_replicas: &PartitionMask) {
        for waiter in self.queue.drain(..) {
            waiter.reply(WaiterReply::Ready {
                group: group.clone(),
                active_replicas: active_replicas.clone(),
            });
        }
    }

    /// Replies to every waiter with the same error and empties the queue
    /// (used on terminal collaborator errors and shutdown).
    pub fn drain_err(&mut self, err: SvgmError) {
        for waiter in self.queue.drain(..) {
            waiter.reply(WaiterReply::Err(err.clone()));
        }
    }

    /// Re-evaluates parked transition waiters against the still-pending
    /// mask: those no longer intersecting it are removed and returned for
    /// re-parking on `waiting_list` (spec.md §4.3); the rest stay parked.
    pub fn partition_by_pending(&mut self, still_pending: &PartitionMask) -> Vec<Waiter> {
        let mut satisfied = Vec::new();
        let mut remaining = VecDeque::new();
        for waiter in self.queue.drain(..) {
            if waiter.wanted_partitions.intersects(still_pending) {
                remaining.push_back(waiter);
            } else {
                satisfied.push(waiter);
            }
        }
        self.queue = remaining;
        satisfied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use svgm_types::IndexHeader;

    fn snapshot() -> GroupSnapshot {
        GroupSnapshot::new(IndexHeader::default())
    }

    #[tokio::test]
    async fn drain_ready_replies_to_all() {
        let mut q = WaiterQueue::default();
        let (w1, rx1) = Waiter::new(PartitionMask::from_ids([1]));
        let (w2, rx2) = Waiter::new(PartitionMask::from_ids([2]));
        q.push(w1);
        q.push(w2);
        q.drain_ready(&snapshot(), &PartitionMask::empty());
        assert!(matches!(rx1.await.unwrap(), WaiterReply::Ready { .. }));
        assert!(matches!(rx2.await.unwrap(), WaiterReply::Ready { .. }));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn partition_by_pending_splits_queue() {
        let mut q = WaiterQueue::default();
        let (w1, rx1) = Waiter::new(PartitionMask::from_ids([1]));
        let (w2, rx2) = Waiter::new(PartitionMask::from_ids([7]));
        q.push(w1);
        q.push(w2);
        let still_pending = PartitionMask::from_ids([7]);
        let satisfied = q.partition_by_pending(&still_pending);
        assert_eq!(satisfied.len(), 1);
        assert_eq!(q.len(), 1);
        for w in satisfied {
            w.reply(WaiterReply::Ready {
                group: snapshot(),
                active_replicas: PartitionMask::empty(),
            });
        }
        assert!(matches!(rx1.await.unwrap(), WaiterReply::Ready { .. }));
        drop(rx2);
    }
}
