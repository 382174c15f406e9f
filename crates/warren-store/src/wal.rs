//! Append-only write-ahead log for consensus entries.
//!
//! The WAL stores opaque payloads (the consensus runtime serializes its own
//! entry type). Generations rotate when a snapshot makes the prefix
//! disposable: `rotate` opens `wal-<gen+1>.log`, `purge_below` deletes the
//! older files. On a rare log-conflict truncation the surviving entries are
//! rewritten into a fresh generation (`reset`).

use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::record::{scan_records, write_record};
use crate::StoreError;

fn wal_filename(generation: u64) -> String {
    format!("wal-{generation:06}.log")
}

/// An open write-ahead log.
pub struct Wal {
    dir: PathBuf,
    generation: u64,
    file: File,
}

impl Wal {
    /// Opens the WAL in `dir`, replaying every surviving record.
    ///
    /// Torn tails (crash mid-append) are truncated away; checksum failures
    /// before the tail are fatal.
    pub fn open(dir: &Path) -> Result<(Self, Vec<Vec<u8>>), StoreError> {
        let mut generations = list_generations(dir)?;
        generations.sort_unstable();

        let mut records = Vec::new();
        for (pos, generation) in generations.iter().enumerate() {
            let path = dir.join(wal_filename(*generation));
            let bytes = fs::read(&path).map_err(|e| StoreError::io(&path, e))?;
            let scan = scan_records(&bytes, &path)?;

            if scan.torn_tail {
                // Only the newest generation may legally be torn.
                if pos + 1 != generations.len() {
                    return Err(StoreError::Corrupt {
                        path: path.display().to_string(),
                        offset: scan.clean_len,
                    });
                }
                warn!(
                    path = %path.display(),
                    clean_len = scan.clean_len,
                    "truncating torn tail from crash"
                );
                let file = OpenOptions::new()
                    .write(true)
                    .open(&path)
                    .map_err(|e| StoreError::io(&path, e))?;
                file.set_len(scan.clean_len)
                    .map_err(|e| StoreError::io(&path, e))?;
                file.sync_all().map_err(|e| StoreError::io(&path, e))?;
            }
            records.extend(scan.records);
        }

        let generation = generations.last().copied().unwrap_or(1);
        let path = dir.join(wal_filename(generation));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;

        debug!(generation, records = records.len(), "wal opened");
        Ok((
            Self {
                dir: dir.to_path_buf(),
                generation,
                file,
            },
            records,
        ))
    }

    /// Appends one record and syncs it to disk.
    ///
    /// Consensus requires the entry to be durable before any message about
    /// it leaves the process, so there is no buffered variant.
    pub fn append(&mut self, payload: &[u8]) -> Result<(), StoreError> {
        let path = self.dir.join(wal_filename(self.generation));
        write_record(&mut self.file, payload).map_err(|e| StoreError::io(&path, e))?;
        self.file.flush().map_err(|e| StoreError::io(&path, e))?;
        self.file
            .sync_data()
            .map_err(|e| StoreError::io(&path, e))?;
        Ok(())
    }

    /// Starts a new generation. Appends go to the new file; older
    /// generations survive until [`Wal::purge_below`].
    pub fn rotate(&mut self) -> Result<(), StoreError> {
        self.generation += 1;
        let path = self.dir.join(wal_filename(self.generation));
        self.file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        debug!(generation = self.generation, "wal rotated");
        Ok(())
    }

    /// Deletes every generation older than the current one.
    pub fn purge_below_current(&self) -> Result<(), StoreError> {
        for generation in list_generations(&self.dir)? {
            if generation < self.generation {
                let path = self.dir.join(wal_filename(generation));
                fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))?;
            }
        }
        Ok(())
    }

    /// Replaces the whole log with `records` in a fresh generation.
    ///
    /// Used after a log-conflict truncation or a snapshot install, where
    /// the on-disk suffix no longer matches the in-memory log.
    pub fn reset<'a>(
        &mut self,
        records: impl IntoIterator<Item = &'a [u8]>,
    ) -> Result<(), StoreError> {
        self.rotate()?;
        for payload in records {
            self.append(payload)?;
        }
        self.purge_below_current()
    }
}

fn list_generations(dir: &Path) -> Result<Vec<u64>, StoreError> {
    let mut generations = Vec::new();
    let entries = fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(stem) = name.strip_prefix("wal-").and_then(|s| s.strip_suffix(".log")) {
            if let Ok(generation) = stem.parse::<u64>() {
                generations.push(generation);
            }
        }
    }
    Ok(generations)
}
