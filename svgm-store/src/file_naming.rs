//! On-disk file naming (spec.md §6):
//! `<view_dir>/<type>_<hex(signature)>.view.<N>`, `N` a positive integer.
//!
//! Grounded on `pbs_datastore::chunk_store`'s directory-scan-for-latest
//! pattern and the teacher's monotonic-suffix rename-on-compact idiom used
//! throughout `pbs-datastore` (atomic rename after fsync).

use std::path::{Path, PathBuf};

use std::fs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    Main,
    Replica,
}

impl GroupKind {
    fn tag(self) -> &'static str {
        match self {
            GroupKind::Main => "main",
            GroupKind::Replica => "replica",
        }
    }
}

pub fn signature_hex(signature: &[u8]) -> String {
    signature.iter().map(|b| format!("{b:02x}")).collect()
}

fn base_name(kind: GroupKind, signature: &[u8]) -> String {
    format!("{}_{}.view", kind.tag(), signature_hex(signature))
}

/// Builds `<view_dir>/<type>_<hex(signature)>.view.<n>`.
pub fn file_name(view_dir: &Path, kind: GroupKind, signature: &[u8], n: u64) -> PathBuf {
    view_dir.join(format!("{}.{}", base_name(kind, signature), n))
}

/// The compactor's staging file before it is renamed into the sequence.
pub fn compact_file_name(current: &Path) -> PathBuf {
    let mut s = current.as_os_str().to_owned();
    s.push(".compact");
    PathBuf::from(s)
}

/// Scans `view_dir` for the highest existing suffix `N` for this group's
/// base name, returning `(path, n)`.
pub fn find_current(
    view_dir: &Path,
    kind: GroupKind,
    signature: &[u8],
) -> std::io::Result<Option<(PathBuf, u64)>> {
    let base = base_name(kind, signature);
    let prefix = format!("{base}.");
    let mut best: Option<u64> = None;

    if !view_dir.exists() {
        return Ok(None);
    }

    for entry in fs::read_dir(view_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(n) => n,
            None => continue,
        };
        if let Some(suffix) = name.strip_prefix(&prefix) {
            if let Ok(n) = suffix.parse::<u64>() {
                if best.map_or(true, |b| n > b) {
                    best = Some(n);
                }
            }
        }
    }

    Ok(best.map(|n| (file_name(view_dir, kind, signature, n), n)))
}

/// `basename.N+1`, used by the compactor to atomically swap in a
/// rewritten file.
pub fn increment(view_dir: &Path, kind: GroupKind, signature: &[u8], current_n: u64) -> PathBuf {
    file_name(view_dir, kind, signature, current_n + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_highest_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let sig = [0xabu8, 0xcd];
        for n in [1, 3, 2] {
            fs::write(file_name(dir.path(), GroupKind::Main, &sig, n), b"").unwrap();
        }
        let (path, n) = find_current(dir.path(), GroupKind::Main, &sig).unwrap().unwrap();
        assert_eq!(n, 3);
        assert_eq!(path, file_name(dir.path(), GroupKind::Main, &sig, 3));
    }

    #[test]
    fn missing_dir_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(find_current(&missing, GroupKind::Main, &[1]).unwrap().is_none());
    }

    #[test]
    fn increments_past_highest() {
        let next = increment(Path::new("/v"), GroupKind::Replica, &[1, 2], 5);
        assert_eq!(next, file_name(Path::new("/v"), GroupKind::Replica, &[1, 2], 6));
    }
}
