//! Header & File Protocol (spec.md §4.2).
//!
//! The durable file is an append-only log of `(signature, header)` records;
//! loading scans for the latest record, committing appends a new one and
//! optionally fsyncs. Grounded on the teacher's `proxmox_sys::fs::replace_file`
//! / `open_file_locked` idiom (`pbs-datastore/src/task_tracking.rs`), adapted
//! from "replace whole file" to "append a record" because headers are a log,
//! not a single overwritten value.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use svgm_types::IndexHeader;

use crate::file_naming;

/// One `(signature, header)` record as persisted on disk. `header` is
/// `None` for the empty record written by `reset`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct HeaderRecord {
    signature_hex: String,
    header: Option<IndexHeader>,
}

/// The append-a-header / fsync / truncate / rename / delete contract the
/// controller needs from the backing file (spec.md §1, Out of scope: "only
/// header-write/sync/rename/truncate/delete ops are contracted").
pub trait HeaderFile: Send + Sync {
    fn append_header(&mut self, signature: &[u8], header: Option<&IndexHeader>) -> Result<()>;
    fn fsync(&mut self) -> Result<()>;
    fn read_latest(&mut self) -> Result<Option<(Vec<u8>, Option<IndexHeader>)>>;
    fn truncate(&mut self) -> Result<()>;
    fn delete(self: Box<Self>) -> Result<()>;
    fn mark_read_only(&mut self) -> Result<()>;
    fn rename_to(&mut self, new_path: &Path) -> Result<()>;
    fn path(&self) -> &Path;
}

/// A `HeaderFile` backed by a local newline-delimited-JSON log.
pub struct LocalHeaderFile {
    path: PathBuf,
    file: File,
}

impl LocalHeaderFile {
    pub fn open_or_create(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening header file {}", path.display()))?;
        Ok(Self { path, file })
    }
}

impl HeaderFile for LocalHeaderFile {
    fn append_header(&mut self, signature: &[u8], header: Option<&IndexHeader>) -> Result<()> {
        let record = HeaderRecord {
            signature_hex: file_naming::signature_hex(signature),
            header: header.cloned(),
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        Ok(())
    }

    fn fsync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn read_latest(&mut self) -> Result<Option<(Vec<u8>, Option<IndexHeader>)>> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut buf = String::new();
        BufReader::new(&mut self.file).read_to_string(&mut buf)?;
        let mut latest = None;
        for line in buf.lines() {
            // A torn final write after a crash is skipped, not fatal --
            // the record before it is still a valid commit point.
            if let Ok(record) = serde_json::from_str::<HeaderRecord>(line) {
                let sig = hex_decode(&record.signature_hex);
                latest = Some((sig, record.header));
            }
        }
        self.file.seek(SeekFrom::End(0))?;
        Ok(latest)
    }

    fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    fn delete(self: Box<Self>) -> Result<()> {
        std::fs::remove_file(&self.path)
            .with_context(|| format!("deleting header file {}", self.path.display()))?;
        Ok(())
    }

    fn mark_read_only(&mut self) -> Result<()> {
        let mut perms = self.file.metadata()?.permissions();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            perms.set_mode(0o440);
        }
        #[cfg(not(unix))]
        {
            perms.set_readonly(true);
        }
        std::fs::set_permissions(&self.path, perms)?;
        Ok(())
    }

    fn rename_to(&mut self, new_path: &Path) -> Result<()> {
        std::fs::rename(&self.path, new_path)
            .with_context(|| format!("renaming {} -> {}", self.path.display(), new_path.display()))?;
        self.path = new_path.to_path_buf();
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

fn hex_decode(s: &str) -> Vec<u8> {
    (0..s.len())
        .step_by(2)
        .filter_map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

/// A hard commit (fsync) or a checkpoint (write without fsync) -- spec.md
/// §4.5, "Commit policy".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitKind {
    Checkpoint,
    Hard,
}

pub fn commit(
    file: &mut dyn HeaderFile,
    signature: &[u8],
    header: &IndexHeader,
    kind: CommitKind,
) -> Result<()> {
    file.append_header(signature, Some(header))?;
    if kind == CommitKind::Hard {
        file.fsync()?;
    }
    Ok(())
}

/// Startup load (spec.md §4.2): read the latest header; if its signature
/// doesn't match or none exists, reset to an empty header.
pub fn load_or_reset(file: &mut dyn HeaderFile, expected_signature: &[u8]) -> Result<IndexHeader> {
    match file.read_latest()? {
        Some((sig, Some(header))) if sig == expected_signature => Ok(header),
        _ => reset(file, expected_signature),
    }
}

/// Truncate to zero, write an empty header, and return it -- all B-tree
/// roots reinitialised as empty by virtue of `IndexHeader::default()`.
pub fn reset(file: &mut dyn HeaderFile, signature: &[u8]) -> Result<IndexHeader> {
    file.truncate()?;
    let header = IndexHeader::default();
    file.append_header(signature, None)?;
    file.fsync()?;
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_written_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = LocalHeaderFile::open_or_create(dir.path().join("h")).unwrap();
        let sig = vec![1, 2, 3];
        let mut header = IndexHeader::default();
        header.num_partitions = Some(4);
        commit(&mut f, &sig, &header, CommitKind::Hard).unwrap();
        let (read_sig, read_header) = f.read_latest().unwrap().unwrap();
        assert_eq!(read_sig, sig);
        assert_eq!(read_header.unwrap().num_partitions, Some(4));
    }

    #[test]
    fn signature_mismatch_triggers_reset() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = LocalHeaderFile::open_or_create(dir.path().join("h")).unwrap();
        let mut header = IndexHeader::default();
        header.num_partitions = Some(4);
        commit(&mut f, &[1], &header, CommitKind::Hard).unwrap();

        let loaded = load_or_reset(&mut f, &[9, 9]).unwrap();
        assert!(!loaded.is_defined());
    }

    #[test]
    fn fresh_file_loads_as_reset() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = LocalHeaderFile::open_or_create(dir.path().join("h")).unwrap();
        let loaded = load_or_reset(&mut f, &[1, 2]).unwrap();
        assert!(!loaded.is_defined());
    }
}
