//! Messages exchanged between raft peers.

use serde::{Deserialize, Serialize};
use warren_types::NodeId;

use crate::types::{LogEntry, LogIndex, SnapshotBlob, Term};

/// An addressed raft message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub from: NodeId,
    pub to: NodeId,
    pub term: Term,
    pub payload: MessagePayload,
}

/// The raft protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessagePayload {
    RequestVote {
        last_log_index: LogIndex,
        last_log_term: Term,
    },
    RequestVoteReply {
        granted: bool,
    },
    AppendEntries {
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    },
    AppendEntriesReply {
        success: bool,
        /// On success: the follower's new last replicated index.
        /// On failure: the follower's last log index, as a hint for how
        /// far the leader must back up.
        match_index: LogIndex,
    },
    InstallSnapshot {
        snapshot: SnapshotBlob,
    },
    InstallSnapshotReply {
        /// Index the follower now holds.
        match_index: LogIndex,
    },
}

impl MessagePayload {
    /// Short name for tracing.
    pub const fn name(&self) -> &'static str {
        match self {
            MessagePayload::RequestVote { .. } => "request_vote",
            MessagePayload::RequestVoteReply { .. } => "request_vote_reply",
            MessagePayload::AppendEntries { .. } => "append_entries",
            MessagePayload::AppendEntriesReply { .. } => "append_entries_reply",
            MessagePayload::InstallSnapshot { .. } => "install_snapshot",
            MessagePayload::InstallSnapshotReply { .. } => "install_snapshot_reply",
        }
    }
}
