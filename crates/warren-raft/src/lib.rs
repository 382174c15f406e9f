//! # warren-raft: the consensus core
//!
//! This crate implements Raft as a pure, tick-driven state machine. The
//! runtime owns the wall clock, the disk, and the network; the
//! [`RaftNode`] only consumes [`RaftEvent`]s and returns [`RaftOutput`]s:
//!
//! ```text
//! Runtime ──Tick / Receive(msg) / Propose──► RaftNode::step
//!    ▲                                           │
//!    │   RaftOutput { persist, messages,         │
//!    └── committed entries, snapshot install } ◄─┘
//! ```
//!
//! No I/O, no clocks, no ambient randomness (timeout jitter comes from a
//! seeded RNG injected at construction). This is what makes the
//! multi-node election and replication tests in this crate deterministic.
//!
//! # Persistence contract
//!
//! The runtime MUST, for each output and in this order:
//! 1. persist `hard_state` if set (term/vote changes)
//! 2. append `append_entries` to the WAL (and honor `truncate_log_from`)
//! 3. only then send `messages`
//!
//! Sending before persisting can elect two leaders for one term after a
//! crash, which is the one unforgivable raft sin.

mod log;
mod message;
mod node;
mod types;

#[cfg(test)]
mod tests;

pub use log::RaftLog;
pub use message::{Message, MessagePayload};
pub use node::{RaftConfig, RaftError, RaftEvent, RaftNode, RaftOutput, Role};
pub use types::{
    ConfChange, EntryPayload, HardState, LogEntry, LogIndex, Membership, SnapshotBlob, Term,
};
