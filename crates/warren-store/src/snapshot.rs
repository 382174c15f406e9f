//! Self-contained snapshot files.
//!
//! A snapshot is one framed record holding an opaque payload (the consensus
//! runtime serializes log position, membership, and the kernel state
//! together). Files are named by the log index they cover, written to a
//! temp file and renamed, so a crash never leaves a half-snapshot behind.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::{read_state_file, write_state_file, StoreError};

fn snapshot_filename(index: u64) -> String {
    format!("{index:018}.snap")
}

/// Writes a snapshot covering the log through `index`.
pub fn write_snapshot(dir: &Path, index: u64, payload: &[u8]) -> Result<(), StoreError> {
    let path = dir.join(snapshot_filename(index));
    write_state_file(&path, payload)?;
    debug!(index, bytes = payload.len(), "snapshot written");
    Ok(())
}

/// Loads the newest snapshot, if any, as `(index, payload)`.
pub fn latest_snapshot(dir: &Path) -> Result<Option<(u64, Vec<u8>)>, StoreError> {
    let Some(index) = newest_index(dir)? else {
        return Ok(None);
    };
    let path = dir.join(snapshot_filename(index));
    match read_state_file(&path)? {
        Some(payload) => Ok(Some((index, payload))),
        None => Ok(None),
    }
}

/// Deletes snapshots older than `keep_index`.
pub fn purge_snapshots_below(dir: &Path, keep_index: u64) -> Result<(), StoreError> {
    for (index, name) in list(dir)? {
        if index < keep_index {
            let path = dir.join(name);
            fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))?;
        }
    }
    Ok(())
}

fn newest_index(dir: &Path) -> Result<Option<u64>, StoreError> {
    Ok(list(dir)?.into_iter().map(|(index, _)| index).max())
}

fn list(dir: &Path) -> Result<Vec<(u64, String)>, StoreError> {
    let mut found = Vec::new();
    let entries = fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(stem) = name.strip_suffix(".snap") {
            if let Ok(index) = stem.parse::<u64>() {
                found.push((index, name.to_string()));
            }
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_wins() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(latest_snapshot(tmp.path()).unwrap().is_none());

        write_snapshot(tmp.path(), 42, b"old").unwrap();
        write_snapshot(tmp.path(), 117, b"new").unwrap();

        let (index, payload) = latest_snapshot(tmp.path()).unwrap().unwrap();
        assert_eq!(index, 117);
        assert_eq!(payload, b"new");
    }

    #[test]
    fn purge_keeps_newest() {
        let tmp = tempfile::tempdir().unwrap();
        write_snapshot(tmp.path(), 1, b"a").unwrap();
        write_snapshot(tmp.path(), 2, b"b").unwrap();
        write_snapshot(tmp.path(), 3, b"c").unwrap();

        purge_snapshots_below(tmp.path(), 3).unwrap();
        assert_eq!(list(tmp.path()).unwrap().len(), 1);
        let (index, _) = latest_snapshot(tmp.path()).unwrap().unwrap();
        assert_eq!(index, 3);
    }
}
