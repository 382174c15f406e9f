//! In-memory replicated log with a compacted prefix.
//!
//! Entries before (and including) `snapshot_index` have been folded into a
//! snapshot and discarded; `entries[0]`, when present, is the entry at
//! `snapshot_index + 1`.

use crate::types::{LogEntry, LogIndex, Term};

/// The replicated log.
#[derive(Debug, Clone, Default)]
pub struct RaftLog {
    snapshot_index: LogIndex,
    snapshot_term: Term,
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the log from recovered state.
    pub fn restore(snapshot_index: LogIndex, snapshot_term: Term, entries: Vec<LogEntry>) -> Self {
        debug_assert!(entries
            .iter()
            .enumerate()
            .all(|(i, e)| e.index == snapshot_index + (i as u64 + 1)));
        Self {
            snapshot_index,
            snapshot_term,
            entries,
        }
    }

    pub fn snapshot_index(&self) -> LogIndex {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> Term {
        self.snapshot_term
    }

    pub fn last_index(&self) -> LogIndex {
        self.snapshot_index + self.entries.len() as u64
    }

    pub fn last_term(&self) -> Term {
        self.entries
            .last()
            .map_or(self.snapshot_term, |e| e.term)
    }

    /// Term of the entry at `index`, if the log still knows it.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        let offset = (index - self.snapshot_index) as usize - 1;
        self.entries.get(offset)
    }

    /// Entries from `from` (inclusive) through the end, bounded by `max`.
    pub fn slice_from(&self, from: LogIndex, max: usize) -> Vec<LogEntry> {
        if from > self.last_index() || from <= self.snapshot_index {
            return Vec::new();
        }
        let offset = (from - self.snapshot_index) as usize - 1;
        self.entries[offset..]
            .iter()
            .take(max)
            .cloned()
            .collect()
    }

    /// Appends one entry; its index must be `last_index + 1`.
    pub fn append(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index().next());
        self.entries.push(entry);
    }

    /// Drops every entry at `from` and beyond (conflict resolution).
    pub fn truncate_from(&mut self, from: LogIndex) {
        if from <= self.snapshot_index {
            // Never truncate into the compacted prefix.
            debug_assert!(from > self.snapshot_index, "truncate into snapshot");
            return;
        }
        let keep = (from - self.snapshot_index) as usize - 1;
        self.entries.truncate(keep);
    }

    /// Folds the prefix through `index` into a snapshot boundary.
    pub fn compact_through(&mut self, index: LogIndex) {
        if index <= self.snapshot_index {
            return;
        }
        let term = self
            .term_at(index)
            .expect("compaction point must be in the log");
        let drop = (index - self.snapshot_index) as usize;
        self.entries.drain(..drop.min(self.entries.len()));
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// Replaces the whole log with a snapshot boundary (snapshot install).
    pub fn reset_to_snapshot(&mut self, index: LogIndex, term: Term) {
        self.snapshot_index = index;
        self.snapshot_term = term;
        self.entries.clear();
    }

    /// Every retained entry, oldest first.
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntryPayload;

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry {
            term: Term::new(term),
            index: LogIndex::new(index),
            payload: EntryPayload::Noop,
        }
    }

    #[test]
    fn append_and_lookup() {
        let mut log = RaftLog::new();
        log.append(entry(1, 1));
        log.append(entry(1, 2));
        log.append(entry(2, 3));

        assert_eq!(log.last_index(), LogIndex::new(3));
        assert_eq!(log.last_term(), Term::new(2));
        assert_eq!(log.term_at(LogIndex::new(2)), Some(Term::new(1)));
        assert_eq!(log.term_at(LogIndex::ZERO), Some(Term::ZERO));
        assert_eq!(log.term_at(LogIndex::new(4)), None);
    }

    #[test]
    fn truncate_drops_conflicts() {
        let mut log = RaftLog::new();
        for i in 1..=4 {
            log.append(entry(1, i));
        }
        log.truncate_from(LogIndex::new(3));
        assert_eq!(log.last_index(), LogIndex::new(2));
        assert!(log.get(LogIndex::new(3)).is_none());
    }

    #[test]
    fn compaction_moves_the_boundary() {
        let mut log = RaftLog::new();
        for i in 1..=5 {
            log.append(entry(2, i));
        }
        log.compact_through(LogIndex::new(3));

        assert_eq!(log.snapshot_index(), LogIndex::new(3));
        assert_eq!(log.snapshot_term(), Term::new(2));
        assert_eq!(log.last_index(), LogIndex::new(5));
        assert!(log.get(LogIndex::new(3)).is_none());
        assert_eq!(log.term_at(LogIndex::new(3)), Some(Term::new(2)));
        assert_eq!(
            log.slice_from(LogIndex::new(4), 10).len(),
            2,
        );
    }

    #[test]
    fn slice_respects_bounds() {
        let mut log = RaftLog::new();
        for i in 1..=5 {
            log.append(entry(1, i));
        }
        assert_eq!(log.slice_from(LogIndex::new(2), 2).len(), 2);
        assert_eq!(log.slice_from(LogIndex::new(6), 2).len(), 0);
        assert_eq!(log.slice_from(LogIndex::new(1), 100).len(), 5);
    }
}
