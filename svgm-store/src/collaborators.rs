//! Collaborator Gateways (spec.md §2, §4.6, §6): thin contracts wrapping
//! updater, cleaner, compactor, replica and db-set, each exposing
//! start/stop/partial-progress/finish signals.
//!
//! Updater/cleaner/compactor are long-running background tasks the
//! controller does not implement -- it only reacts to their events and
//! sends them commands, mirroring `src/server/gc_job.rs`'s
//! `WorkerTask::new_thread` handle plus the worker context used to signal
//! cancellation. Replica and db-set are modelled as synchronous-looking
//! async calls (spec.md §5, "Suspension points").

use std::time::Duration;

use async_trait::async_trait;
use svgm_types::{IndexHeader, PartitionId, PartitionMask, SvgmError};
use tokio::sync::{mpsc, oneshot};

/// `starting` -> `updating_active` -> `updating_passive` (spec.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdaterPhase {
    Starting,
    UpdatingActive,
    UpdatingPassive,
}

#[derive(Debug)]
pub enum UpdaterEvent {
    Phase(UpdaterPhase),
    PartialUpdate(Box<IndexHeader>),
    Finished(Box<IndexHeader>),
    Error(String),
    /// Controller must re-prepare the group from disk and restart.
    Reset,
}

#[derive(Debug, Clone, Copy)]
pub enum UpdaterCommand {
    StopAfterActive,
    StopImmediately,
}

pub struct UpdaterHandle {
    pub events: mpsc::Receiver<UpdaterEvent>,
    pub commands: mpsc::Sender<UpdaterCommand>,
}

/// Starts an updater task against the given header snapshot.
pub trait UpdaterGateway: Send + Sync {
    fn start(&self, header: IndexHeader) -> UpdaterHandle;
}

#[derive(Debug)]
pub struct CleanerResult {
    pub new_header: IndexHeader,
    pub removed_count: u64,
    pub duration: Duration,
}

#[derive(Debug)]
pub enum CleanerEvent {
    Finished(Box<CleanerResult>),
    Error(String),
}

pub struct CleanerHandle {
    pub events: mpsc::Receiver<CleanerEvent>,
    pub stop: mpsc::Sender<()>,
}

pub trait CleanerGateway: Send + Sync {
    fn start(&self, header: IndexHeader) -> CleanerHandle;
}

#[derive(Debug)]
pub enum CompactorEvent {
    /// `Ok` carries the rewritten header at the compactor's snapshot
    /// sequences; `Err` is a died-with-reason terminal signal.
    Done(Result<Box<IndexHeader>, String>),
}

pub struct CompactorHandle {
    pub events: oneshot::Receiver<CompactorEvent>,
    pub cancel: mpsc::Sender<()>,
}

pub trait CompactorGateway: Send + Sync {
    fn start(&self, header: IndexHeader) -> CompactorHandle;
}

/// The database-set reader: yields document change streams to the
/// updater (out of SVGM's scope) and is told which partitions it can
/// stop tracking once they are fully purged.
#[async_trait]
pub trait DbSetGateway: Send + Sync {
    async fn remove_partitions(&self, ids: &[PartitionId]) -> Result<(), SvgmError>;
    async fn close(&self) -> Result<(), SvgmError>;
}

/// Recursive forwarding to the replica group's own controller (spec.md
/// §4.8). The replica never calls back into the main controller
/// synchronously (spec.md §9, "Cyclic references").
#[async_trait]
pub trait ReplicaGateway: Send + Sync {
    async fn define_view(
        &self,
        num_partitions: u32,
        active: Vec<PartitionId>,
        passive: Vec<PartitionId>,
    ) -> Result<(), SvgmError>;

    async fn set_state(
        &self,
        active: Vec<PartitionId>,
        passive: Vec<PartitionId>,
        cleanup: Vec<PartitionId>,
    ) -> Result<(), SvgmError>;

    async fn add_replicas(&self, bits: PartitionMask) -> Result<(), SvgmError>;

    async fn remove_replicas(&self, ids: Vec<PartitionId>) -> Result<(), SvgmError>;
}
