//! Set View Group Manager: public facade over `svgm-store`'s per-group
//! controller actor, plus the in-process registry of running groups.
//!
//! Embedding applications call [`init_logger`] once at startup, then use
//! [`GroupRegistry`] to spawn or look up a [`Controller`] by group key and
//! drive it through its async API.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use once_cell::sync::Lazy;

pub use svgm_store::{
    controller, spawn, Controller, Counters, Gateways, GroupInfo, GroupKind, GroupSnapshot,
    History, HistoryEntry,
};
pub use svgm_types::{
    BtreeRootState, DbDeletedTarget, IndexHeader, PartitionId, PartitionMask, SeqMap, Staleness,
    SvgmConfig, SvgmError, TransitionRecord, ViewState,
};

/// Sets up `env_logger` from `RUST_LOG`, defaulting to `info`. Grounded on
/// the teacher's daemon entrypoints (`proxmox-restore-daemon/src/main.rs`);
/// SVGM is embedded rather than its own binary, so this is opt-in for
/// applications that have not already installed a `log` backend.
pub fn init_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}

/// Process-wide map of running group controllers, keyed by group name.
/// Grounded on `pbs_datastore::datastore::DATASTORE_MAP`: a
/// `Mutex<HashMap<String, Arc<..>>>` guarding a cache of live handles, so a
/// second `lookup_or_spawn` for the same name reuses the running actor
/// instead of opening the backing file twice (spec.md §9, "One controller
/// per group").
static GROUP_MAP: Lazy<Mutex<HashMap<String, Controller>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Looks up a running controller by name, or spawns a new one rooted at
/// `view_dir` if none is running yet.
pub fn lookup_or_spawn(
    name: &str,
    view_dir: PathBuf,
    kind: GroupKind,
    signature: Vec<u8>,
    config: SvgmConfig,
    gateways: Gateways,
) -> Result<Controller, SvgmError> {
    let mut map = GROUP_MAP.lock().unwrap();
    if let Some(controller) = map.get(name) {
        return Ok(controller.clone());
    }
    let controller = spawn(view_dir, kind, signature, config, gateways)?;
    map.insert(name.to_string(), controller.clone());
    Ok(controller)
}

/// Drops the registry's handle to `name`'s controller, if any. Does not
/// itself shut the controller down -- its task exits once every `Controller`
/// clone (including any still held by callers) is dropped and its channel
/// closes, or it shuts itself down on a terminal collaborator error
/// (spec.md §4.5, "Shutdown triggers").
pub fn forget(name: &str) {
    GROUP_MAP.lock().unwrap().remove(name);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forget_on_unknown_name_is_a_noop() {
        forget("does-not-exist");
    }
}
