//! The Controller (spec.md §4.4-§4.8, §4.5 state machine). Owns the group
//! state exclusively and drives it from a single async task reading a
//! bounded channel, per spec.md §9 "Process-per-group control loop ->
//! owned actor".

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use svgm_types::role_algebra::{self, RoleState};
use svgm_types::{
    DbDeletedTarget, ExitReason, IndexHeader, PartitionId, PartitionMask, Staleness, SvgmConfig,
    SvgmError, TransitionRecord,
};
use tokio::sync::{mpsc, oneshot};

use crate::collaborators::{
    CleanerEvent, CleanerGateway, CleanerHandle, CompactorEvent, CompactorGateway,
    CompactorHandle, DbSetGateway, ReplicaGateway, UpdaterCommand, UpdaterEvent, UpdaterGateway,
    UpdaterHandle, UpdaterPhase,
};
use crate::file_naming::{self, GroupKind};
use crate::header_io::{self, CommitKind, HeaderFile};
use crate::snapshot::{GroupSnapshot, RefCounter};
use crate::stats::{History, HistoryEntry};
use crate::waiters::{Waiter, WaiterQueue, WaiterReply};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdaterState {
    None,
    Starting,
    UpdatingActive,
    UpdatingPassive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanerState {
    None,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactorState {
    None,
    Running,
}

/// Structured snapshot of group state for external consumers (spec.md §6,
/// "Group-info object").
#[derive(Debug, Clone, serde::Serialize)]
pub struct GroupInfo {
    pub num_partitions: Option<u32>,
    pub active: Vec<PartitionId>,
    pub passive: Vec<PartitionId>,
    pub cleanup: Vec<PartitionId>,
    pub updater_running: bool,
    pub updater_state: &'static str,
    pub compaction_running: bool,
    pub cleanup_running: bool,
    pub waiting_commit: bool,
    pub has_replica: bool,
    pub replicas_on_transfer: Vec<PartitionId>,
    pub pending_transition: Option<TransitionRecord>,
    pub updates_run: u64,
    pub cleanups_run: u64,
    pub compactions_run: u64,
}

pub enum ControllerMsg {
    DefineView {
        num_partitions: u32,
        active: Vec<PartitionId>,
        passive: Vec<PartitionId>,
        use_replica: bool,
        reply: oneshot::Sender<Result<(), SvgmError>>,
    },
    IsViewDefined {
        reply: oneshot::Sender<bool>,
    },
    SetState {
        active: Vec<PartitionId>,
        passive: Vec<PartitionId>,
        cleanup: Vec<PartitionId>,
        reply: oneshot::Sender<Result<(), SvgmError>>,
    },
    AddReplicas {
        bits: PartitionMask,
        reply: oneshot::Sender<Result<(), SvgmError>>,
    },
    RemoveReplicas {
        ids: Vec<PartitionId>,
        reply: oneshot::Sender<Result<(), SvgmError>>,
    },
    RequestGroup {
        wanted_partitions: PartitionMask,
        stale: Staleness,
        reply: oneshot::Sender<WaiterReply>,
    },
    RequestGroupInfo {
        reply: oneshot::Sender<GroupInfo>,
    },
    PartitionDeleted {
        target: DbDeletedTarget,
        reply: oneshot::Sender<Result<(), SvgmError>>,
    },
    StartCompact {
        reply: oneshot::Sender<Result<(), SvgmError>>,
    },
    CancelCompact {
        reply: oneshot::Sender<Result<(), SvgmError>>,
    },
    /// The backing design document's signature changed; the group is now
    /// stale (spec.md §4.5, "Shutdown triggers").
    SignatureChanged,
}

/// Handle to a running controller task. Cheap to clone.
#[derive(Clone)]
pub struct Controller {
    tx: mpsc::Sender<ControllerMsg>,
}

impl Controller {
    pub async fn define_view(
        &self,
        num_partitions: u32,
        active: Vec<PartitionId>,
        passive: Vec<PartitionId>,
        use_replica: bool,
    ) -> Result<(), SvgmError> {
        self.call(|reply| ControllerMsg::DefineView {
            num_partitions,
            active,
            passive,
            use_replica,
            reply,
        })
        .await
    }

    pub async fn is_view_defined(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(ControllerMsg::IsViewDefined { reply: tx }).await;
        rx.await.unwrap_or(false)
    }

    pub async fn set_state(
        &self,
        active: Vec<PartitionId>,
        passive: Vec<PartitionId>,
        cleanup: Vec<PartitionId>,
    ) -> Result<(), SvgmError> {
        self.call(|reply| ControllerMsg::SetState {
            active,
            passive,
            cleanup,
            reply,
        })
        .await
    }

    pub async fn add_replicas(&self, bits: PartitionMask) -> Result<(), SvgmError> {
        self.call(|reply| ControllerMsg::AddReplicas { bits, reply }).await
    }

    pub async fn remove_replicas(&self, ids: Vec<PartitionId>) -> Result<(), SvgmError> {
        self.call(|reply| ControllerMsg::RemoveReplicas { ids, reply }).await
    }

    pub async fn request_group(
        &self,
        wanted_partitions: PartitionMask,
        stale: Staleness,
    ) -> WaiterReply {
        let (tx, rx) = oneshot::channel();
        if self
            .tx
            .send(ControllerMsg::RequestGroup {
                wanted_partitions,
                stale,
                reply: tx,
            })
            .await
            .is_err()
        {
            return WaiterReply::Err(SvgmError::Shutdown("controller gone".into()));
        }
        rx.await
            .unwrap_or(WaiterReply::Err(SvgmError::Shutdown("controller gone".into())))
    }

    pub async fn request_group_info(&self) -> Option<GroupInfo> {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(ControllerMsg::RequestGroupInfo { reply: tx }).await;
        rx.await.ok()
    }

    pub async fn partition_deleted(&self, target: DbDeletedTarget) -> Result<(), SvgmError> {
        self.call(|reply| ControllerMsg::PartitionDeleted { target, reply }).await
    }

    pub async fn start_compact(&self) -> Result<(), SvgmError> {
        self.call(|reply| ControllerMsg::StartCompact { reply }).await
    }

    pub async fn cancel_compact(&self) -> Result<(), SvgmError> {
        self.call(|reply| ControllerMsg::CancelCompact { reply }).await
    }

    pub async fn signature_changed(&self) {
        let _ = self.tx.send(ControllerMsg::SignatureChanged).await;
    }

    async fn call<F>(&self, make_msg: F) -> Result<(), SvgmError>
    where
        F: FnOnce(oneshot::Sender<Result<(), SvgmError>>) -> ControllerMsg,
    {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(make_msg(tx)).await.is_err() {
            return Err(SvgmError::Shutdown("controller gone".into()));
        }
        rx.await.unwrap_or(Err(SvgmError::Shutdown("controller gone".into())))
    }
}

/// Collaborator gateways a controller is wired to at construction time.
pub struct Gateways {
    pub updater: Arc<dyn UpdaterGateway>,
    pub cleaner: Arc<dyn CleanerGateway>,
    pub compactor: Arc<dyn CompactorGateway>,
    pub db_set: Arc<dyn DbSetGateway>,
    pub replica: Option<Arc<dyn ReplicaGateway>>,
}

struct RoleSlots {
    updater_state: UpdaterState,
    updater_handle: Option<UpdaterHandle>,
    cleaner_state: CleanerState,
    cleaner_handle: Option<CleanerHandle>,
    compactor_state: CompactorState,
    compactor_handle: Option<CompactorHandle>,
}

impl RoleSlots {
    fn new() -> Self {
        Self {
            updater_state: UpdaterState::None,
            updater_handle: None,
            cleaner_state: CleanerState::None,
            cleaner_handle: None,
            compactor_state: CompactorState::None,
            compactor_handle: None,
        }
    }
}

struct Actor {
    kind: GroupKind,
    view_dir: PathBuf,
    current_suffix: u64,
    signature: Vec<u8>,
    config: SvgmConfig,
    file: Box<dyn HeaderFile>,
    header: IndexHeader,
    roles: RoleSlots,
    waiting_list: WaiterQueue,
    pending_transition_waiters: WaiterQueue,
    history: History,
    refcount: RefCounter,
    commit_timer_set: bool,
    shutdown: Option<ExitReason>,
    gateways: Gateways,
}

impl Actor {
    fn indexed(&self) -> PartitionMask {
        self.header.abitmask.union(&self.header.pbitmask)
    }

    fn commit(&mut self, kind: CommitKind) -> Result<(), SvgmError> {
        header_io::commit(&mut *self.file, &self.signature, &self.header, kind).map_err(|e| {
            log::error!("header commit failed: {e}");
            SvgmError::Shutdown(e.to_string())
        })?;
        if kind == CommitKind::Hard {
            self.commit_timer_set = false;
        }
        Ok(())
    }

    fn schedule_checkpoint(&mut self, tx: mpsc::Sender<ControllerMsgInternal>) {
        if self.commit_timer_set {
            return;
        }
        self.commit_timer_set = true;
        let delay = self.config.delayed_commit_period;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(ControllerMsgInternal::CommitTimer).await;
        });
    }

    fn start_updater(&mut self) {
        if !matches!(self.roles.updater_state, UpdaterState::None) {
            return;
        }
        self.roles.updater_handle = Some(self.gateways.updater.start(self.header.clone()));
        self.roles.updater_state = UpdaterState::Starting;
    }

    fn stop_updater(&mut self, immediately: bool) {
        if let Some(handle) = &self.roles.updater_handle {
            let cmd = if immediately {
                UpdaterCommand::StopImmediately
            } else {
                UpdaterCommand::StopAfterActive
            };
            let _ = handle.commands.try_send(cmd);
        }
    }

    fn maybe_start_cleaner(&mut self) {
        let can_run = matches!(self.roles.updater_state, UpdaterState::None)
            && matches!(self.roles.compactor_state, CompactorState::None)
            && matches!(self.roles.cleaner_state, CleanerState::None)
            && !self.header.cbitmask.is_empty();
        if can_run {
            self.roles.cleaner_handle = Some(self.gateways.cleaner.start(self.header.clone()));
            self.roles.cleaner_state = CleanerState::Running;
        }
    }

    /// spec.md §4.7 step 5.
    fn persist_partition_states(
        &mut self,
        active: &[PartitionId],
        passive: &[PartitionId],
        cleanup: &[PartitionId],
    ) -> Result<(), SvgmError> {
        {
            let mut state = RoleState {
                abitmask: &mut self.header.abitmask,
                pbitmask: &mut self.header.pbitmask,
                cbitmask: &mut self.header.cbitmask,
                seqs: &mut self.header.seqs,
                purge_seqs: &mut self.header.purge_seqs,
            };
            role_algebra::promote_to_active(&mut state, active);
            role_algebra::promote_to_passive(&mut state, passive);
            role_algebra::mark_for_cleanup(&mut state, cleanup);
        }
        for p in cleanup {
            self.header.replicas_on_transfer.clear(*p);
        }
        if !cleanup.is_empty() {
            let db_set = self.gateways.db_set.clone();
            let ids = cleanup.to_vec();
            tokio::spawn(async move {
                let _ = db_set.remove_partitions(&ids).await;
            });
        }
        self.commit(CommitKind::Hard)
    }

    /// spec.md §4.7 step 6.
    fn after_update_restart(&mut self) {
        if matches!(self.kind, GroupKind::Main) {
            if matches!(self.roles.updater_state, UpdaterState::Starting | UpdaterState::UpdatingActive | UpdaterState::UpdatingPassive) {
                // already running against stale masks; restart against the new ones.
                self.roles.updater_state = UpdaterState::None;
                self.roles.updater_handle = None;
                self.start_updater();
            }
            if matches!(self.roles.compactor_state, CompactorState::Running) {
                self.roles.compactor_handle = Some(self.gateways.compactor.start(self.header.clone()));
            }
            self.maybe_start_cleaner();
        } else {
            if matches!(self.roles.compactor_state, CompactorState::Running) {
                self.roles.compactor_handle = Some(self.gateways.compactor.start(self.header.clone()));
            } else if matches!(self.roles.updater_state, UpdaterState::None) {
                self.maybe_auto_update();
            }
        }
    }

    /// spec.md SPEC_FULL.md §4.10: replica groups auto-start the updater
    /// once the held-back sequence gap exceeds the configured threshold.
    fn maybe_auto_update(&mut self) {
        if !matches!(self.kind, GroupKind::Replica) {
            return;
        }
        if !matches!(self.roles.updater_state, UpdaterState::None) {
            return;
        }
        let gap: u64 = self.header.seqs.values().copied().sum();
        if gap >= self.config.auto_update_threshold {
            self.start_updater();
        }
    }

    fn handle_define_view(
        &mut self,
        num_partitions: u32,
        active: Vec<PartitionId>,
        passive: Vec<PartitionId>,
        use_replica: bool,
    ) -> Result<(), SvgmError> {
        if self.header.is_defined() {
            return Err(SvgmError::ViewAlreadyDefined);
        }
        role_algebra::validate_role_lists(&active, &passive, &[], num_partitions)?;
        self.header.num_partitions = Some(num_partitions);
        self.header.has_replica = use_replica;
        let result = self.persist_partition_states(&active, &passive, &[]);
        if result.is_ok() && use_replica {
            if let Some(replica) = self.gateways.replica.clone() {
                tokio::spawn(async move {
                    let _ = replica.define_view(num_partitions, vec![], vec![]).await;
                });
            }
        }
        result
    }

    fn handle_set_state(
        &mut self,
        active: Vec<PartitionId>,
        passive: Vec<PartitionId>,
        cleanup: Vec<PartitionId>,
    ) -> Result<(), SvgmError> {
        if !self.header.is_defined() {
            return Err(SvgmError::ViewUndefined);
        }
        let num_partitions = self.header.num_partitions.unwrap();
        // Open Question (spec.md §9): disjointness is validated before
        // bounds, so callers that pass intersecting lists always get
        // `IntersectingLists`, even if one of the ids is also out of
        // range. See DESIGN.md.
        role_algebra::validate_role_lists(&active, &passive, &cleanup, num_partitions)?;

        let a_mask = PartitionMask::from_ids(active.iter().copied());
        let p_mask = PartitionMask::from_ids(passive.iter().copied());
        let c_mask = PartitionMask::from_ids(cleanup.iter().copied());
        // Laws (spec.md §8, "No-op set_state"): A subset of abitmask,
        // P subset of pbitmask, C subset of cbitmask leaves the group
        // byte-identical.
        let is_noop = a_mask.union(&self.header.abitmask) == self.header.abitmask
            && p_mask.union(&self.header.pbitmask) == self.header.pbitmask
            && c_mask.union(&self.header.cbitmask) == self.header.cbitmask;
        if is_noop {
            return Ok(());
        }

        if let Some(existing) = &mut self.header.pending_transition {
            // merge: union into this side, subtract from the other two.
            let mut merged = existing.clone();
            merge_side(&mut merged.active, &mut merged.passive, &mut merged.cleanup, &active, 0);
            merge_side(&mut merged.passive, &mut merged.active, &mut merged.cleanup, &passive, 1);
            merge_side(&mut merged.cleanup, &mut merged.active, &mut merged.passive, &cleanup, 2);
            *existing = merged;
            self.commit(CommitKind::Hard)?;
            self.reevaluate_pending_waiters();
            return Ok(());
        }

        if let Some(handle) = &self.roles.cleaner_handle {
            let _ = handle.stop.try_send(());
        }
        self.roles.cleaner_handle = None;
        self.roles.cleaner_state = CleanerState::None;
        self.stop_updater(true);

        let union_ap = a_mask.union(&p_mask);
        let in_cleanup = union_ap.intersects(&self.header.cbitmask);

        if !in_cleanup {
            self.persist_partition_states(&active, &passive, &cleanup)?;
            self.after_update_restart();
        } else {
            self.header.pending_transition = Some(TransitionRecord {
                active,
                passive,
                cleanup,
            });
            self.commit(CommitKind::Hard)?;
        }
        Ok(())
    }

    /// Applies the pending transition once none of its active/passive
    /// partitions remain in cbitmask (spec.md §4.7 step 3, "Pending
    /// application" law, §8).
    fn try_apply_pending_transition(&mut self) {
        let still_blocked = match &self.header.pending_transition {
            Some(t) => t.active_or_passive().intersects(&self.header.cbitmask),
            None => return,
        };
        if still_blocked {
            return;
        }
        let t = self.header.pending_transition.take().unwrap();
        if self.persist_partition_states(&t.active, &t.passive, &t.cleanup).is_ok() {
            self.after_update_restart();
        }
        self.reevaluate_pending_waiters();
    }

    fn reevaluate_pending_waiters(&mut self) {
        let still_pending = self
            .header
            .pending_transition
            .as_ref()
            .map(|t| t.active_or_passive())
            .unwrap_or_else(PartitionMask::empty);
        let satisfied = self.pending_transition_waiters.partition_by_pending(&still_pending);
        if !satisfied.is_empty() {
            let mut needs_updater = false;
            for w in satisfied {
                self.waiting_list.push(w);
                needs_updater = true;
            }
            if needs_updater {
                self.start_updater();
            }
        }
    }

    fn handle_request_group(
        &mut self,
        wanted_partitions: PartitionMask,
        stale: Staleness,
    ) -> Option<WaiterReply> {
        if let Some(reason) = &self.shutdown {
            return Some(WaiterReply::Err(SvgmError::Shutdown(reason.to_string())));
        }
        if !self.header.is_defined() {
            return Some(WaiterReply::Err(SvgmError::ViewUndefined));
        }

        let blocked_by_pending = self
            .header
            .pending_transition
            .as_ref()
            .map(|t| t.active_or_passive().intersects(&wanted_partitions))
            .unwrap_or(false);

        if blocked_by_pending {
            let (waiter, _) = Waiter::new(wanted_partitions);
            self.pending_transition_waiters.push(waiter);
            return None;
        }

        match stale {
            Staleness::Ok => {
                let active_replicas = self.header.replicas_on_transfer.clone();
                let group = GroupSnapshot::with_refcount(Arc::new(self.header.clone()), self.refcount.clone());
                Some(WaiterReply::Ready { group, active_replicas })
            }
            Staleness::UpdateAfter => {
                self.start_updater();
                let active_replicas = self.header.replicas_on_transfer.clone();
                let group = GroupSnapshot::with_refcount(Arc::new(self.header.clone()), self.refcount.clone());
                Some(WaiterReply::Ready { group, active_replicas })
            }
            Staleness::False => {
                if matches!(self.roles.updater_state, UpdaterState::UpdatingPassive) {
                    let active_replicas = self.header.replicas_on_transfer.clone();
                    let group = GroupSnapshot::with_refcount(Arc::new(self.header.clone()), self.refcount.clone());
                    Some(WaiterReply::Ready { group, active_replicas })
                } else {
                    let (waiter, _) = Waiter::new(wanted_partitions);
                    self.waiting_list.push(waiter);
                    self.start_updater();
                    None
                }
            }
        }
    }

    fn group_info(&self) -> GroupInfo {
        GroupInfo {
            num_partitions: self.header.num_partitions,
            active: self.header.abitmask.iter_ones().collect(),
            passive: self.header.pbitmask.iter_ones().collect(),
            cleanup: self.header.cbitmask.iter_ones().collect(),
            updater_running: !matches!(self.roles.updater_state, UpdaterState::None),
            updater_state: match self.roles.updater_state {
                UpdaterState::None => "none",
                UpdaterState::Starting => "starting",
                UpdaterState::UpdatingActive => "updating_active",
                UpdaterState::UpdatingPassive => "updating_passive",
            },
            compaction_running: matches!(self.roles.compactor_state, CompactorState::Running),
            cleanup_running: matches!(self.roles.cleaner_state, CleanerState::Running),
            waiting_commit: self.commit_timer_set,
            has_replica: self.header.has_replica,
            replicas_on_transfer: self.header.replicas_on_transfer.iter_ones().collect(),
            pending_transition: self.header.pending_transition.clone(),
            updates_run: self.history.counters().updates_run,
            cleanups_run: self.history.counters().cleanups_run,
            compactions_run: self.history.counters().compactions_run,
        }
    }

    fn handle_partition_deleted(&mut self, target: DbDeletedTarget) -> Result<(), SvgmError> {
        let owns = match target {
            DbDeletedTarget::Master => true,
            DbDeletedTarget::Partition(p) => {
                self.header.abitmask.is_set(p) || self.header.pbitmask.is_set(p)
            }
        };
        if owns {
            self.begin_shutdown(ExitReason(format!("db deleted: {target:?}")));
            Err(SvgmError::DbDeleted(target))
        } else {
            Ok(())
        }
    }

    fn handle_start_compact(&mut self) -> Result<(), SvgmError> {
        if matches!(self.roles.compactor_state, CompactorState::Running) {
            return Ok(());
        }
        self.roles.compactor_handle = Some(self.gateways.compactor.start(self.header.clone()));
        self.roles.compactor_state = CompactorState::Running;
        Ok(())
    }

    fn handle_cancel_compact(&mut self) -> Result<(), SvgmError> {
        if let Some(handle) = &self.roles.compactor_handle {
            let _ = handle.cancel.try_send(());
        }
        self.roles.compactor_handle = None;
        self.roles.compactor_state = CompactorState::None;
        self.maybe_start_cleaner();
        Ok(())
    }

    fn handle_compact_done(&mut self, result: Result<Box<IndexHeader>, String>) {
        self.roles.compactor_handle = None;
        self.roles.compactor_state = CompactorState::None;
        match result {
            Err(reason) => {
                log::error!("compactor died: {reason}");
                self.begin_shutdown(ExitReason(format!("compactor died: {reason}")));
            }
            Ok(new_header) => {
                let behind = new_header
                    .seqs
                    .iter()
                    .any(|(p, seq)| self.header.seqs.get(p).map_or(false, |cur| cur > seq));
                if behind {
                    log::debug!("compactor result is behind current sequences, discarding");
                    return;
                }
                let had_updater = !matches!(self.roles.updater_state, UpdaterState::None);
                self.stop_updater(true);

                let compact_path = file_naming::compact_file_name(self.file.path());
                let mut new_file = match header_io::LocalHeaderFile::open_or_create(compact_path) {
                    Ok(f) => f,
                    Err(e) => {
                        log::error!("failed to open compacted file: {e}");
                        self.begin_shutdown(ExitReason(format!("compaction swap failed: {e}")));
                        return;
                    }
                };
                if let Err(e) =
                    header_io::commit(&mut new_file, &self.signature, &new_header, CommitKind::Hard)
                {
                    log::error!("failed to commit compacted header: {e}");
                    self.begin_shutdown(ExitReason(format!("compaction swap failed: {e}")));
                    return;
                }
                let next_suffix = self.current_suffix + 1;
                let next_path =
                    file_naming::increment(&self.view_dir, self.kind, &self.signature, self.current_suffix);
                if let Err(e) = new_file.rename_to(&next_path) {
                    log::error!("failed to rename compacted file into place: {e}");
                    self.begin_shutdown(ExitReason(format!("compaction swap failed: {e}")));
                    return;
                }

                let old_file: Box<dyn HeaderFile> =
                    std::mem::replace(&mut self.file, Box::new(new_file));
                let old_refcount = std::mem::replace(&mut self.refcount, RefCounter::new());
                self.current_suffix = next_suffix;
                self.header = *new_header;
                retire_old_file(old_file, old_refcount);

                self.history.push(HistoryEntry::Compaction {
                    duration: Duration::from_secs(0),
                });
                if had_updater {
                    self.start_updater();
                }
            }
        }
    }

    fn handle_updater_event(&mut self, event: UpdaterEvent) {
        match event {
            UpdaterEvent::Phase(UpdaterPhase::Starting) => {
                self.roles.updater_state = UpdaterState::Starting;
            }
            UpdaterEvent::Phase(UpdaterPhase::UpdatingActive) => {
                self.roles.updater_state = UpdaterState::UpdatingActive;
            }
            UpdaterEvent::Phase(UpdaterPhase::UpdatingPassive) => {
                self.roles.updater_state = UpdaterState::UpdatingPassive;
                let snapshot = GroupSnapshot::with_refcount(
                    Arc::new(self.header.clone()),
                    self.refcount.clone(),
                );
                let active_replicas = self.header.replicas_on_transfer.clone();
                self.waiting_list.drain_ready(&snapshot, &active_replicas);
            }
            UpdaterEvent::PartialUpdate(new_header) => {
                self.absorb_transfer_progress(&new_header);
                self.header = *new_header;
            }
            UpdaterEvent::Finished(new_header) => {
                self.absorb_transfer_progress(&new_header);
                self.header = *new_header;
                self.roles.updater_state = UpdaterState::None;
                self.roles.updater_handle = None;
                let _ = self.commit(CommitKind::Hard);
                self.history.push(HistoryEntry::Update {
                    partitions_indexed: self.indexed().count_ones(),
                    duration: Duration::from_secs(0),
                });
                self.maybe_start_cleaner();
            }
            UpdaterEvent::Error(reason) => {
                log::warn!("updater failed, dropping waiters: {reason}");
                self.roles.updater_state = UpdaterState::None;
                self.roles.updater_handle = None;
                self.history.record_updater_error();
                self.waiting_list.drain_err(SvgmError::UpdaterError(reason));
                self.maybe_start_cleaner();
            }
            UpdaterEvent::Reset => {
                self.roles.updater_state = UpdaterState::None;
                self.roles.updater_handle = None;
                self.start_updater();
            }
        }
    }

    /// spec.md §4.8: once a `replicas_on_transfer` partition's sequence
    /// catches up to the replica-absorbed value, commit and tell the
    /// replica to clean it up.
    fn absorb_transfer_progress(&mut self, new_header: &IndexHeader) {
        if self.header.replicas_on_transfer.is_empty() {
            return;
        }
        let absorbed: Vec<PartitionId> = self
            .header
            .replicas_on_transfer
            .iter_ones()
            .filter(|p| new_header.seqs.get(p) > self.header.seqs.get(p))
            .collect();
        if absorbed.is_empty() {
            return;
        }
        for p in &absorbed {
            self.header.replicas_on_transfer.clear(*p);
        }
        let _ = self.commit(CommitKind::Hard);
        if let Some(replica) = self.gateways.replica.clone() {
            let ids = absorbed;
            tokio::spawn(async move {
                let _ = replica.remove_replicas(ids).await;
            });
        }
    }

    fn handle_cleaner_event(&mut self, event: CleanerEvent) {
        self.roles.cleaner_handle = None;
        self.roles.cleaner_state = CleanerState::None;
        match event {
            CleanerEvent::Finished(result) => {
                self.header = result.new_header;
                let _ = self.commit(CommitKind::Hard);
                self.history.push(HistoryEntry::Cleanup {
                    removed_count: result.removed_count,
                    duration: result.duration,
                });
                self.try_apply_pending_transition();
            }
            CleanerEvent::Error(reason) => {
                log::error!("cleaner died: {reason}");
                self.begin_shutdown(ExitReason(format!("cleaner died: {reason}")));
            }
        }
    }

    fn handle_add_replicas(&mut self, bits: PartitionMask) -> Result<(), SvgmError> {
        if !matches!(self.kind, GroupKind::Main) || !self.header.has_replica {
            return Err(SvgmError::ViewUndefined);
        }
        let replica = self.gateways.replica.clone().ok_or(SvgmError::ViewUndefined)?;
        let already_owned = self.header.abitmask.union(&self.header.pbitmask);
        let new_passive: Vec<PartitionId> =
            bits.iter_ones().filter(|p| !already_owned.is_set(*p)).collect();
        if new_passive.is_empty() {
            return Ok(());
        }
        tokio::spawn(async move {
            let _ = replica.set_state(vec![], new_passive, vec![]).await;
        });
        Ok(())
    }

    fn handle_remove_replicas(&mut self, ids: Vec<PartitionId>) -> Result<(), SvgmError> {
        if !matches!(self.kind, GroupKind::Main) {
            return Err(SvgmError::ViewUndefined);
        }
        let (on_transfer, not_on_transfer): (Vec<_>, Vec<_>) = ids
            .into_iter()
            .partition(|p| self.header.replicas_on_transfer.is_set(*p));

        if !on_transfer.is_empty() {
            for p in &on_transfer {
                self.header.replicas_on_transfer.clear(*p);
                self.header.pbitmask.clear(*p);
            }
            if matches!(self.roles.compactor_state, CompactorState::Running) {
                self.roles.compactor_handle = Some(self.gateways.compactor.start(self.header.clone()));
            }
            self.commit(CommitKind::Hard)?;
        }

        if !not_on_transfer.is_empty() {
            if let Some(replica) = self.gateways.replica.clone() {
                tokio::spawn(async move {
                    let _ = replica.set_state(vec![], vec![], not_on_transfer).await;
                });
            }
        }
        Ok(())
    }

    fn begin_shutdown(&mut self, reason: ExitReason) {
        if self.shutdown.is_some() {
            return;
        }
        log::info!("group controller shutting down: {reason}");
        self.shutdown = Some(reason.clone());
        self.pending_transition_waiters.drain_err(SvgmError::Shutdown(reason.to_string()));
        self.waiting_list.drain_err(SvgmError::Shutdown(reason.to_string()));
        let db_set = self.gateways.db_set.clone();
        tokio::spawn(async move {
            let _ = db_set.close().await;
        });
        self.stop_updater(true);
        if let Some(h) = &self.roles.compactor_handle {
            let _ = h.cancel.try_send(());
        }
        let _ = self.file.mark_read_only();
    }
}

/// Marks a superseded header file read-only immediately and deletes it once
/// every outstanding `GroupSnapshot` against it has dropped (spec.md §4.6,
/// §5 "Shared resources") so a reader mid-flight never loses its backing file.
fn retire_old_file(mut old_file: Box<dyn HeaderFile>, refcount: RefCounter) {
    let _ = old_file.mark_read_only();
    tokio::spawn(async move {
        while refcount.count() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let _ = old_file.delete();
    });
}

fn merge_side(
    side: &mut Vec<PartitionId>,
    other_a: &mut Vec<PartitionId>,
    other_b: &mut Vec<PartitionId>,
    incoming: &[PartitionId],
    _which: u8,
) {
    for &p in incoming {
        if !side.contains(&p) {
            side.push(p);
        }
        other_a.retain(|x| *x != p);
        other_b.retain(|x| *x != p);
    }
}

enum ControllerMsgInternal {
    External(ControllerMsg),
    Updater(UpdaterEvent),
    Cleaner(CleanerEvent),
    Compactor(CompactorEvent),
    CommitTimer,
}

async fn recv_updater(h: Option<&mut UpdaterHandle>) -> Option<UpdaterEvent> {
    match h {
        Some(h) => h.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_cleaner(h: Option<&mut CleanerHandle>) -> Option<CleanerEvent> {
    match h {
        Some(h) => h.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_compactor(h: Option<&mut CompactorHandle>) -> Option<CompactorEvent> {
    use std::future::poll_fn;
    use std::pin::Pin;
    match h {
        Some(h) => poll_fn(|cx| Pin::new(&mut h.events).poll(cx)).await.ok(),
        None => std::future::pending().await,
    }
}

/// Runs the actor loop to completion (until the channel closes or the
/// group shuts down).
async fn run(mut actor: Actor, mut external_rx: mpsc::Receiver<ControllerMsg>) {
    let (internal_tx, mut internal_rx) = mpsc::channel::<ControllerMsgInternal>(64);

    loop {
        let msg = tokio::select! {
            biased;
            Some(internal) = internal_rx.recv() => internal,
            Some(external) = external_rx.recv() => ControllerMsgInternal::External(external),
            Some(ev) = recv_updater(actor.roles.updater_handle.as_mut()) => ControllerMsgInternal::Updater(ev),
            Some(ev) = recv_cleaner(actor.roles.cleaner_handle.as_mut()) => ControllerMsgInternal::Cleaner(ev),
            Some(ev) = recv_compactor(actor.roles.compactor_handle.as_mut()) => ControllerMsgInternal::Compactor(ev),
            else => break,
        };

        match msg {
            ControllerMsgInternal::External(ext) => {
                if dispatch_external(&mut actor, ext, &internal_tx).await {
                    break;
                }
            }
            ControllerMsgInternal::Updater(ev) => actor.handle_updater_event(ev),
            ControllerMsgInternal::Cleaner(ev) => actor.handle_cleaner_event(ev),
            ControllerMsgInternal::Compactor(CompactorEvent::Done(result)) => {
                actor.handle_compact_done(result)
            }
            ControllerMsgInternal::CommitTimer => {
                if actor.commit_timer_set {
                    let _ = actor.commit(CommitKind::Checkpoint);
                }
            }
        }

        if actor.shutdown.is_some() {
            break;
        }
    }
}

async fn dispatch_external(
    actor: &mut Actor,
    msg: ControllerMsg,
    internal_tx: &mpsc::Sender<ControllerMsgInternal>,
) -> bool {
    match msg {
        ControllerMsg::DefineView {
            num_partitions,
            active,
            passive,
            use_replica,
            reply,
        } => {
            let result = actor.handle_define_view(num_partitions, active, passive, use_replica);
            if result.is_ok() && actor.config.delayed_commit_period > Duration::ZERO {
                actor.schedule_checkpoint(internal_tx.clone());
            }
            let _ = reply.send(result);
            false
        }
        ControllerMsg::IsViewDefined { reply } => {
            let _ = reply.send(actor.header.is_defined());
            false
        }
        ControllerMsg::SetState {
            active,
            passive,
            cleanup,
            reply,
        } => {
            let result = actor.handle_set_state(active, passive, cleanup);
            let _ = reply.send(result);
            false
        }
        ControllerMsg::AddReplicas { bits, reply } => {
            let _ = reply.send(actor.handle_add_replicas(bits));
            false
        }
        ControllerMsg::RemoveReplicas { ids, reply } => {
            let _ = reply.send(actor.handle_remove_replicas(ids));
            false
        }
        ControllerMsg::RequestGroup {
            wanted_partitions,
            stale,
            reply,
        } => {
            if let Some(result) = actor.handle_request_group(wanted_partitions, stale) {
                let _ = reply.send(result);
            }
            // else: parked; the waiter holds its own reply sender.
            false
        }
        ControllerMsg::RequestGroupInfo { reply } => {
            let _ = reply.send(actor.group_info());
            false
        }
        ControllerMsg::PartitionDeleted { target, reply } => {
            let result = actor.handle_partition_deleted(target);
            let stop = result.is_err();
            let _ = reply.send(result);
            stop
        }
        ControllerMsg::StartCompact { reply } => {
            let _ = reply.send(actor.handle_start_compact());
            false
        }
        ControllerMsg::CancelCompact { reply } => {
            let _ = reply.send(actor.handle_cancel_compact());
            false
        }
        ControllerMsg::SignatureChanged => {
            actor.begin_shutdown(ExitReason("design document signature changed".into()));
            true
        }
    }
}

/// Opens (or creates) the backing file, loads/resets its header, and
/// spawns the controller's actor task.
pub fn spawn(
    view_dir: PathBuf,
    kind: GroupKind,
    signature: Vec<u8>,
    config: SvgmConfig,
    gateways: Gateways,
) -> Result<Controller, SvgmError> {
    let (path, current_suffix) = match crate::file_naming::find_current(&view_dir, kind, &signature) {
        Ok(Some((p, n))) => (p, n),
        Ok(None) => (crate::file_naming::file_name(&view_dir, kind, &signature, 1), 1),
        Err(e) => return Err(SvgmError::Shutdown(e.to_string())),
    };
    let mut file: Box<dyn HeaderFile> = Box::new(
        crate::header_io::LocalHeaderFile::open_or_create(path)
            .map_err(|e| SvgmError::Shutdown(e.to_string()))?,
    );
    let header =
        header_io::load_or_reset(&mut *file, &signature).map_err(|e| SvgmError::Shutdown(e.to_string()))?;

    let history_size = config.history_size;
    let actor = Actor {
        kind,
        view_dir,
        current_suffix,
        signature,
        config,
        file,
        header,
        roles: RoleSlots::new(),
        waiting_list: WaiterQueue::default(),
        pending_transition_waiters: WaiterQueue::default(),
        history: History::new(history_size),
        refcount: RefCounter::new(),
        commit_timer_set: false,
        shutdown: None,
        gateways,
    };

    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(run(actor, rx));
    Ok(Controller { tx })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use svgm_types::PartitionMask;

    use super::*;

    struct MockUpdater {
        last_tx: Mutex<Option<mpsc::Sender<UpdaterEvent>>>,
    }

    impl MockUpdater {
        fn new() -> Self {
            Self {
                last_tx: Mutex::new(None),
            }
        }
    }

    impl UpdaterGateway for MockUpdater {
        fn start(&self, _header: IndexHeader) -> UpdaterHandle {
            let (events_tx, events_rx) = mpsc::channel(8);
            let (commands_tx, _commands_rx) = mpsc::channel(8);
            *self.last_tx.lock().unwrap() = Some(events_tx);
            UpdaterHandle {
                events: events_rx,
                commands: commands_tx,
            }
        }
    }

    struct MockCleaner {
        last_tx: Mutex<Option<mpsc::Sender<CleanerEvent>>>,
    }

    impl MockCleaner {
        fn new() -> Self {
            Self {
                last_tx: Mutex::new(None),
            }
        }
    }

    impl CleanerGateway for MockCleaner {
        fn start(&self, _header: IndexHeader) -> CleanerHandle {
            let (events_tx, events_rx) = mpsc::channel(8);
            let (stop_tx, _stop_rx) = mpsc::channel(8);
            *self.last_tx.lock().unwrap() = Some(events_tx);
            CleanerHandle {
                events: events_rx,
                stop: stop_tx,
            }
        }
    }

    struct MockCompactor {
        last_tx: Mutex<Option<oneshot::Sender<CompactorEvent>>>,
    }

    impl MockCompactor {
        fn new() -> Self {
            Self {
                last_tx: Mutex::new(None),
            }
        }
    }

    impl CompactorGateway for MockCompactor {
        fn start(&self, _header: IndexHeader) -> CompactorHandle {
            let (events_tx, events_rx) = oneshot::channel();
            let (cancel_tx, _cancel_rx) = mpsc::channel(8);
            *self.last_tx.lock().unwrap() = Some(events_tx);
            CompactorHandle {
                events: events_rx,
                cancel: cancel_tx,
            }
        }
    }

    struct MockDbSet;

    #[async_trait]
    impl DbSetGateway for MockDbSet {
        async fn remove_partitions(&self, _ids: &[PartitionId]) -> Result<(), SvgmError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), SvgmError> {
            Ok(())
        }
    }

    fn test_gateways() -> Gateways {
        Gateways {
            updater: Arc::new(MockUpdater::new()),
            cleaner: Arc::new(MockCleaner::new()),
            compactor: Arc::new(MockCompactor::new()),
            db_set: Arc::new(MockDbSet),
            replica: None,
        }
    }

    fn spawn_test_controller(dir: &std::path::Path) -> Controller {
        spawn(
            dir.to_path_buf(),
            GroupKind::Main,
            vec![1, 2, 3],
            SvgmConfig::default(),
            test_gateways(),
        )
        .unwrap()
    }

    /// End-to-end scenario 1 (spec.md §8, "Fresh define"): defining a
    /// group persists the requested masks and seeds `seqs`/`purge_seqs`
    /// for every partition it now owns.
    #[tokio::test]
    async fn define_view_persists_masks_and_seqs() {
        let dir = tempfile::tempdir().unwrap();
        let controller = spawn_test_controller(dir.path());

        controller
            .define_view(8, vec![0, 1, 2, 3], vec![4, 5], true)
            .await
            .unwrap();

        let info = controller.request_group_info().await.unwrap();
        assert_eq!(info.num_partitions, Some(8));
        assert_eq!(info.active, vec![0, 1, 2, 3]);
        assert_eq!(info.passive, vec![4, 5]);
        assert!(info.cleanup.is_empty());
        assert!(info.has_replica);
        assert!(info.replicas_on_transfer.is_empty());
    }

    /// *Idempotent define* (spec.md §8): a second `define_view` on an
    /// already-defined group is rejected and leaves state untouched.
    #[tokio::test]
    async fn second_define_view_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let controller = spawn_test_controller(dir.path());

        controller.define_view(4, vec![0], vec![], false).await.unwrap();
        let err = controller
            .define_view(4, vec![1], vec![], false)
            .await
            .unwrap_err();
        assert_eq!(err, SvgmError::ViewAlreadyDefined);

        let info = controller.request_group_info().await.unwrap();
        assert_eq!(info.active, vec![0]);
    }

    /// End-to-end scenario 2 (spec.md §8, "Transition with cleanup in
    /// flight"): a `set_state` call whose active/passive side overlaps
    /// `cbitmask` is deferred as a pending transition instead of applied.
    #[tokio::test]
    async fn set_state_defers_when_target_partition_is_cleaning_up() {
        let dir = tempfile::tempdir().unwrap();
        let controller = spawn_test_controller(dir.path());

        controller
            .define_view(7, vec![0, 1, 2, 3], vec![4, 5], false)
            .await
            .unwrap();
        controller.set_state(vec![], vec![], vec![6]).await.unwrap();

        controller.set_state(vec![6], vec![], vec![4]).await.unwrap();

        let info = controller.request_group_info().await.unwrap();
        assert_eq!(info.active, vec![0, 1, 2, 3]);
        assert_eq!(info.passive, vec![4, 5]);
        assert_eq!(info.cleanup, vec![6]);
        let pending = info.pending_transition.unwrap();
        assert_eq!(pending.active, vec![6]);
        assert_eq!(pending.passive, Vec::<PartitionId>::new());
        assert_eq!(pending.cleanup, vec![4]);
    }

    /// *No-op set_state* (spec.md §8): a call whose lists are subsets of
    /// the current masks leaves the group untouched.
    #[tokio::test]
    async fn set_state_subset_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let controller = spawn_test_controller(dir.path());

        controller.define_view(4, vec![0, 1], vec![2], false).await.unwrap();
        controller.set_state(vec![0], vec![], vec![]).await.unwrap();

        let info = controller.request_group_info().await.unwrap();
        assert_eq!(info.active, vec![0, 1]);
        assert_eq!(info.passive, vec![2]);
        assert!(info.pending_transition.is_none());
    }

    #[tokio::test]
    async fn request_group_stale_ok_replies_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let controller = spawn_test_controller(dir.path());
        controller.define_view(4, vec![0, 1], vec![], false).await.unwrap();

        let reply = controller
            .request_group(PartitionMask::from_ids([0]), Staleness::Ok)
            .await;
        assert!(matches!(reply, WaiterReply::Ready { .. }));
    }

    /// End-to-end scenario 6 (spec.md §8, "Design-doc signature change"):
    /// once the backing document's signature changes the controller exits
    /// and further requests observe it is gone.
    #[tokio::test]
    async fn signature_changed_shuts_down_the_controller() {
        let dir = tempfile::tempdir().unwrap();
        let controller = spawn_test_controller(dir.path());
        controller.define_view(4, vec![0], vec![], false).await.unwrap();

        controller.signature_changed().await;

        let info = controller.request_group_info().await;
        assert!(info.is_none());
    }
}
