use std::time::Duration;

/// Tunable constants (spec.md §6), overridable by the embedding application.
///
/// Grounded on the teacher's small `*Tuning` structs (`pbs_api_types::DatastoreTuning`)
/// deserialised with `serde(default)` fields -- SVGM is an embedded library
/// rather than a daemon with its own config file, so these are constructed
/// programmatically instead of parsed from `/etc`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SvgmConfig {
    /// Delay before a non-critical checkpoint (non-fsync header write) is issued.
    pub delayed_commit_period: Duration,
    /// Pending-change threshold past which a replica group auto-starts its updater.
    pub auto_update_threshold: u64,
    /// B-tree chunk threshold in bytes, forwarded to the B-tree engine.
    pub btree_chunk_threshold: usize,
    /// Number of entries kept in the update/cleanup/compaction history ring.
    pub history_size: usize,
    /// Default timeout for non-critical synchronous collaborator calls.
    pub default_call_timeout: Duration,
}

impl Default for SvgmConfig {
    fn default() -> Self {
        Self {
            delayed_commit_period: Duration::from_secs(5),
            auto_update_threshold: 20_000,
            btree_chunk_threshold: 5_120,
            history_size: 20,
            default_call_timeout: Duration::from_secs(3),
        }
    }
}
