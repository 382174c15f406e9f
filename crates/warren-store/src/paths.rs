//! Data-directory layout.

use std::path::{Path, PathBuf};

use crate::StoreError;

/// A manager's data directory, with the subdirectories created.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Opens (and creates, if needed) the directory tree under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = Self { root: root.into() };
        for path in [
            dir.root.clone(),
            dir.raft_dir(),
            dir.snapshot_dir(),
            dir.pki_dir(),
        ] {
            std::fs::create_dir_all(&path).map_err(|e| StoreError::io(&path, e))?;
        }
        Ok(dir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Consensus log and hard state.
    pub fn raft_dir(&self) -> PathBuf {
        self.root.join("raft")
    }

    pub fn hard_state_file(&self) -> PathBuf {
        self.raft_dir().join("hard_state")
    }

    /// Self-contained state snapshots.
    pub fn snapshot_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    /// Stable process identity.
    pub fn node_id_file(&self) -> PathBuf {
        self.root.join("node_id")
    }

    /// This node's TLS material (leaf cert, key, cluster CA).
    pub fn pki_dir(&self) -> PathBuf {
        self.root.join("pki")
    }

    pub fn cert_file(&self) -> PathBuf {
        self.pki_dir().join("node.crt")
    }

    pub fn key_file(&self) -> PathBuf {
        self.pki_dir().join("node.key")
    }

    pub fn ca_file(&self) -> PathBuf {
        self.pki_dir().join("ca.crt")
    }
}
