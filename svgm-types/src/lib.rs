//! Value types and pure partition-role algebra for the set view group
//! manager. No I/O lives in this crate; see `svgm-store` for the header
//! protocol and controller that use these types.

pub mod config;
pub mod error;
pub mod header;
pub mod mask;
pub mod role_algebra;
pub mod seqs;

pub type PartitionId = u16;

pub use config::SvgmConfig;
pub use error::{DbDeletedTarget, SvgmError};
pub use header::{BtreeRootState, IndexHeader, TransitionRecord, ViewState};
pub use mask::PartitionMask;
pub use seqs::SeqMap;

/// Freshness requirement of a `request_group` call (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    /// Reply immediately from the current snapshot.
    False,
    /// Same as a stale read, but do not block for anything newer.
    Ok,
    /// Reply immediately, then kick off an update for next time.
    UpdateAfter,
}

/// A group-wide reason attached to terminal/shutdown signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReason(pub String);

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
