//! A reference-counted view of a group at a moment in time (spec.md §3,
//! "Snapshot"; GLOSSARY).
//!
//! Grounded on `pbs_datastore::datastore::DataStore`'s `Clone`/`Drop`
//! pair, which increments/decrements a shared active-operations counter on
//! clone/drop so the owning `DataStoreImpl` knows when it is safe to
//! delete a superseded file. SVGM's reference counter plays the same role
//! for the index file a compactor swap retires.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use svgm_types::IndexHeader;

/// Shared live-reader counter for one on-disk file generation.
#[derive(Clone, Default, Debug)]
pub struct RefCounter(Arc<AtomicUsize>);

impl RefCounter {
    pub fn new() -> Self {
        Self(Arc::new(AtomicUsize::new(0)))
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn incr(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn decr(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A snapshot of group state handed to a reader. Reference-counted so the
/// controller can tell, after a compactor swap, when the retired file has
/// no readers left and can be deleted (spec.md §5, "Shared resources").
#[derive(Debug)]
pub struct GroupSnapshot {
    header: Arc<IndexHeader>,
    refcount: Option<RefCounter>,
}

impl GroupSnapshot {
    /// A snapshot not tied to any file generation's refcount (used in
    /// tests and for the header held internally by the controller, which
    /// never "reads" its own file through this counting path).
    pub fn new(header: IndexHeader) -> Self {
        Self {
            header: Arc::new(header),
            refcount: None,
        }
    }

    pub fn with_refcount(header: Arc<IndexHeader>, refcount: RefCounter) -> Self {
        refcount.incr();
        Self {
            header,
            refcount: Some(refcount),
        }
    }

    pub fn header(&self) -> &IndexHeader {
        &self.header
    }
}

impl Clone for GroupSnapshot {
    fn clone(&self) -> Self {
        if let Some(rc) = &self.refcount {
            rc.incr();
        }
        Self {
            header: self.header.clone(),
            refcount: self.refcount.clone(),
        }
    }
}

impl Drop for GroupSnapshot {
    fn drop(&mut self) {
        if let Some(rc) = &self.refcount {
            rc.decr();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_and_drop_track_refcount() {
        let rc = RefCounter::new();
        let header = Arc::new(IndexHeader::default());
        let a = GroupSnapshot::with_refcount(header.clone(), rc.clone());
        assert_eq!(rc.count(), 1);
        let b = a.clone();
        assert_eq!(rc.count(), 2);
        drop(a);
        assert_eq!(rc.count(), 1);
        drop(b);
        assert_eq!(rc.count(), 0);
    }
}
