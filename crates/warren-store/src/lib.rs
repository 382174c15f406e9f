//! # warren-store: durable state for a manager
//!
//! Everything a manager must not lose across a restart lives under its data
//! directory:
//!
//! ```text
//! {data_dir}/
//! ├── node_id                 <- this process's stable identity
//! ├── raft/
//! │   ├── hard_state          <- current term + vote, atomically replaced
//! │   ├── wal-000001.log      <- framed log records (one per raft entry)
//! │   └── wal-000002.log      <- newer generation after a snapshot
//! └── snapshots/
//!     ├── 000000000000000042.snap
//!     └── 000000000000000117.snap
//! ```
//!
//! Records are framed `length || checksum || payload` with a blake3-derived
//! checksum. A torn tail (crash mid-write) is truncated on recovery; a
//! checksum mismatch anywhere before the tail is corruption and fatal.

mod paths;
mod record;
mod snapshot;
mod wal;

pub use paths::DataDir;
pub use record::{read_all_records, write_record};
pub use snapshot::{latest_snapshot, purge_snapshots_below, write_snapshot};
pub use wal::Wal;

use std::io::Write;
use std::path::Path;

use warren_types::NodeId;

/// Errors from the durable layer. All of these are fatal at startup; at
/// runtime an append failure stalls consensus rather than corrupting it.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt record in {path} at byte {offset}")]
    Corrupt { path: String, offset: u64 },

    #[error("encoding error: {0}")]
    Encoding(#[from] postcard::Error),

    #[error("malformed node id file {path}")]
    BadNodeId { path: String },
}

impl StoreError {
    /// Wraps an I/O error with the path it happened on.
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    pub fn kind(&self) -> warren_types::ErrorKind {
        warren_types::ErrorKind::Fatal
    }
}

/// Loads this process's stable node identity, creating it on first start.
pub fn load_or_create_node_id(data_dir: &DataDir) -> Result<NodeId, StoreError> {
    let path = data_dir.node_id_file();
    match std::fs::read_to_string(&path) {
        Ok(text) => text
            .trim()
            .parse()
            .map_err(|_| StoreError::BadNodeId {
                path: path.display().to_string(),
            }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let id = NodeId::generate();
            let mut file =
                std::fs::File::create(&path).map_err(|e| StoreError::io(&path, e))?;
            writeln!(file, "{id}").map_err(|e| StoreError::io(&path, e))?;
            file.sync_all().map_err(|e| StoreError::io(&path, e))?;
            Ok(id)
        }
        Err(e) => Err(StoreError::io(&path, e)),
    }
}

/// Atomically replaces a small state file (write temp, fsync, rename).
pub fn write_state_file(path: &Path, payload: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
        write_record(&mut file, payload).map_err(|e| StoreError::io(&tmp, e))?;
        file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
    }
    std::fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))?;
    Ok(())
}

/// Reads a state file written by [`write_state_file`]. `None` if absent.
pub fn read_state_file(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    let mut records = read_all_records(&bytes, path)?;
    match records.pop() {
        Some(payload) if records.is_empty() => Ok(Some(payload)),
        _ => Err(StoreError::Corrupt {
            path: path.display().to_string(),
            offset: 0,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_is_stable_across_restarts() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::new(tmp.path()).unwrap();
        let first = load_or_create_node_id(&dir).unwrap();
        let second = load_or_create_node_id(&dir).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn state_file_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("hard_state");
        assert!(read_state_file(&path).unwrap().is_none());

        write_state_file(&path, b"term=3").unwrap();
        assert_eq!(read_state_file(&path).unwrap().unwrap(), b"term=3");

        // Replacement is atomic and total.
        write_state_file(&path, b"term=4").unwrap();
        assert_eq!(read_state_file(&path).unwrap().unwrap(), b"term=4");
    }
}
