//! Consensus value types.

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::ops::{Add, AddAssign, Sub};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use warren_types::NodeId;

// ============================================================================
// Term and log index
// ============================================================================

/// A raft term. Strictly increases across elections.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Term(u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub const fn new(term: u64) -> Self {
        Self(term)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position in the replicated log. Index 0 is "before the first entry".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct LogIndex(u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub const fn new(index: u64) -> Self {
        Self(index)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub const fn prev(&self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<u64> for LogIndex {
    type Output = LogIndex;
    fn add(self, rhs: u64) -> LogIndex {
        LogIndex(self.0 + rhs)
    }
}

impl AddAssign<u64> for LogIndex {
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub<LogIndex> for LogIndex {
    type Output = u64;
    fn sub(self, rhs: LogIndex) -> u64 {
        self.0.saturating_sub(rhs.0)
    }
}

// ============================================================================
// Log entries
// ============================================================================

/// What a log entry carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Committed by a fresh leader to pin down the commit index.
    Noop,
    /// An opaque, serialized kernel command.
    Command(Bytes),
    /// A single-server membership change.
    ConfChange(ConfChange),
}

/// One replicated log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub payload: EntryPayload,
}

/// Single-server membership changes, one at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfChange {
    AddVoter { id: NodeId, addr: String },
    RemoveVoter { id: NodeId },
}

// ============================================================================
// Membership
// ============================================================================

/// The voting members of the consensus group and their raft addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Membership {
    voters: BTreeMap<NodeId, String>,
}

impl Membership {
    pub fn bootstrap(id: NodeId, addr: impl Into<String>) -> Self {
        let mut voters = BTreeMap::new();
        voters.insert(id, addr.into());
        Self { voters }
    }

    pub fn voters(&self) -> &BTreeMap<NodeId, String> {
        &self.voters
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.voters.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.voters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voters.is_empty()
    }

    /// Votes needed for a majority.
    pub fn quorum(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    pub fn apply(&mut self, change: &ConfChange) {
        match change {
            ConfChange::AddVoter { id, addr } => {
                self.voters.insert(*id, addr.clone());
            }
            ConfChange::RemoveVoter { id } => {
                self.voters.remove(id);
            }
        }
    }
}

// ============================================================================
// Durable state
// ============================================================================

/// The part of a replica's state that must hit disk before any message
/// about it leaves the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HardState {
    pub term: Term,
    pub voted_for: Option<NodeId>,
}

/// A self-contained snapshot: everything a far-behind follower needs to
/// catch up without the compacted log prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotBlob {
    /// Last log index the snapshot covers.
    pub index: LogIndex,
    /// Term of that entry.
    pub term: Term,
    /// Membership as of `index`.
    pub membership: Membership,
    /// Opaque application state (the serialized kernel state).
    pub data: Bytes,
}
