//! The raft replica state machine.
//!
//! Pure and tick-driven: the runtime feeds [`RaftEvent`]s in and executes
//! the returned [`RaftOutput`] (persist, send, apply) — see the crate docs
//! for the ordering contract. Timeout jitter comes from a seeded RNG so
//! multi-node tests are reproducible.

use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, trace};
use warren_types::NodeId;

use crate::log::RaftLog;
use crate::message::{Message, MessagePayload};
use crate::types::{
    EntryPayload, HardState, LogEntry, LogIndex, Membership, SnapshotBlob, Term,
};

// ============================================================================
// Configuration
// ============================================================================

/// Timing is expressed in ticks; the runtime picks the tick length.
/// With 50 ms ticks the defaults give 100 ms heartbeats and 500–1000 ms
/// election timeouts: sub-second failure detection, elections well under
/// the 2–3 s budget on a LAN.
#[derive(Debug, Clone, Copy)]
pub struct RaftConfig {
    pub heartbeat_tick: u32,
    pub election_tick_min: u32,
    pub election_tick_max: u32,
    pub max_entries_per_append: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_tick: 2,
            election_tick_min: 10,
            election_tick_max: 20,
            max_entries_per_append: 64,
        }
    }
}

// ============================================================================
// Events and outputs
// ============================================================================

/// Input to the state machine.
#[derive(Debug, Clone)]
pub enum RaftEvent {
    /// One unit of wall time elapsed.
    Tick,
    /// A message arrived from a peer.
    Receive(Message),
    /// The local process wants to replicate an entry. Leader only.
    Propose(EntryPayload),
}

/// Output produced by one step. The runtime must persist before sending.
#[derive(Debug, Default)]
pub struct RaftOutput {
    /// Changed term/vote that must be durable before `messages` go out.
    pub hard_state: Option<HardState>,
    /// Entries to append to the WAL, in order.
    pub append_entries: Vec<LogEntry>,
    /// If set, the on-disk log must be cut back before appending; the
    /// surviving in-memory log is authoritative.
    pub truncate_log_from: Option<LogIndex>,
    /// Messages to send after persistence.
    pub messages: Vec<Message>,
    /// Entries newly committed, oldest first, to apply to the kernel.
    pub committed: Vec<LogEntry>,
    /// A snapshot from the leader that replaces local state wholesale.
    pub install_snapshot: Option<SnapshotBlob>,
    /// `(term, index)` assigned to a successful proposal.
    pub proposed: Option<(Term, LogIndex)>,
}

impl RaftOutput {
    pub fn is_empty(&self) -> bool {
        self.hard_state.is_none()
            && self.append_entries.is_empty()
            && self.truncate_log_from.is_none()
            && self.messages.is_empty()
            && self.committed.is_empty()
            && self.install_snapshot.is_none()
            && self.proposed.is_none()
    }
}

/// Errors surfaced to proposers.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RaftError {
    #[error("not the leader")]
    NotLeader {
        /// Best guess at who is, for client redirects.
        leader: Option<NodeId>,
    },
}

// ============================================================================
// Roles
// ============================================================================

/// Public view of the replica's role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug)]
enum RoleState {
    Follower {
        leader: Option<NodeId>,
    },
    Candidate {
        votes: BTreeSet<NodeId>,
    },
    Leader {
        progress: BTreeMap<NodeId, Progress>,
    },
}

/// Leader-side replication bookkeeping per follower.
#[derive(Debug, Clone, Copy)]
struct Progress {
    /// Next index to send.
    next: LogIndex,
    /// Highest index known replicated.
    matched: LogIndex,
    /// Heartbeat rounds to wait before re-sending a snapshot, so a lost
    /// reply cannot wedge catch-up.
    snapshot_cooldown: u32,
}

// ============================================================================
// The replica
// ============================================================================

/// A raft replica.
pub struct RaftNode {
    id: NodeId,
    config: RaftConfig,

    term: Term,
    voted_for: Option<NodeId>,
    role: RoleState,

    log: RaftLog,
    commit_index: LogIndex,
    /// Through where `committed` entries have been handed to the runtime.
    emitted_index: LogIndex,

    membership: Membership,
    /// Latest local snapshot, for catching up far-behind followers.
    snapshot: Option<SnapshotBlob>,

    election_elapsed: u32,
    heartbeat_elapsed: u32,
    election_deadline: u32,
    rng: SmallRng,
}

impl RaftNode {
    /// A fresh replica with an empty log.
    ///
    /// `membership` may or may not include `id`: a joining manager starts
    /// from the membership it was told at join time and only campaigns
    /// once its own AddVoter entry arrives.
    pub fn new(id: NodeId, membership: Membership, config: RaftConfig, seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let election_deadline = rng.gen_range(config.election_tick_min..=config.election_tick_max);
        Self {
            id,
            config,
            term: Term::ZERO,
            voted_for: None,
            role: RoleState::Follower { leader: None },
            log: RaftLog::new(),
            commit_index: LogIndex::ZERO,
            emitted_index: LogIndex::ZERO,
            membership,
            snapshot: None,
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            election_deadline,
            rng,
        }
    }

    /// Rebuilds a replica from durable state.
    ///
    /// The commit index is not persisted; it is relearned from the next
    /// leader (or re-established by winning an election). Membership is
    /// the snapshot's, folded with every retained conf-change entry.
    pub fn restore(
        id: NodeId,
        hard_state: HardState,
        snapshot: Option<SnapshotBlob>,
        entries: Vec<LogEntry>,
        config: RaftConfig,
        seed: u64,
    ) -> Self {
        let (snap_index, snap_term, mut membership) = match &snapshot {
            Some(snap) => (snap.index, snap.term, snap.membership.clone()),
            None => (LogIndex::ZERO, Term::ZERO, Membership::default()),
        };
        for entry in &entries {
            if let EntryPayload::ConfChange(change) = &entry.payload {
                membership.apply(change);
            }
        }

        let mut node = Self::new(id, membership, config, seed);
        node.term = hard_state.term;
        node.voted_for = hard_state.voted_for;
        node.log = RaftLog::restore(snap_index, snap_term, entries);
        node.commit_index = snap_index;
        node.emitted_index = snap_index;
        node.snapshot = snapshot;
        node
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn role(&self) -> Role {
        match self.role {
            RoleState::Follower { .. } => Role::Follower,
            RoleState::Candidate { .. } => Role::Candidate,
            RoleState::Leader { .. } => Role::Leader,
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, RoleState::Leader { .. })
    }

    /// Best current guess at the leader, for client redirects.
    pub fn leader_hint(&self) -> Option<NodeId> {
        match &self.role {
            RoleState::Leader { .. } => Some(self.id),
            RoleState::Follower { leader } => *leader,
            RoleState::Candidate { .. } => None,
        }
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_log_index(&self) -> LogIndex {
        self.log.last_index()
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    /// Called by the runtime after it writes a snapshot: compacts the log
    /// and retains the blob for follower catch-up.
    pub fn compact(&mut self, snapshot: SnapshotBlob) {
        debug_assert!(snapshot.index <= self.commit_index);
        self.log.compact_through(snapshot.index);
        self.snapshot = Some(snapshot);
    }

    // ========================================================================
    // Step
    // ========================================================================

    /// Advances the state machine by one event.
    pub fn step(&mut self, event: RaftEvent) -> Result<RaftOutput, RaftError> {
        let mut output = RaftOutput::default();
        match event {
            RaftEvent::Tick => {
                self.tick(&mut output);
                Ok(output)
            }
            RaftEvent::Receive(msg) => {
                self.receive(msg, &mut output);
                Ok(output)
            }
            RaftEvent::Propose(payload) => {
                self.propose(payload, &mut output)?;
                Ok(output)
            }
        }
    }

    // ========================================================================
    // Ticks and elections
    // ========================================================================

    fn tick(&mut self, output: &mut RaftOutput) {
        match self.role {
            RoleState::Leader { .. } => {
                self.heartbeat_elapsed += 1;
                if self.heartbeat_elapsed >= self.config.heartbeat_tick {
                    self.heartbeat_elapsed = 0;
                    self.broadcast_append(output);
                }
            }
            RoleState::Follower { .. } | RoleState::Candidate { .. } => {
                self.election_elapsed += 1;
                if self.election_elapsed >= self.election_deadline
                    && self.membership.contains(&self.id)
                {
                    self.become_candidate(output);
                }
            }
        }
    }

    fn reset_election_timer(&mut self) {
        self.election_elapsed = 0;
        self.election_deadline = self
            .rng
            .gen_range(self.config.election_tick_min..=self.config.election_tick_max);
    }

    fn become_candidate(&mut self, output: &mut RaftOutput) {
        self.term = self.term.next();
        self.voted_for = Some(self.id);
        self.reset_election_timer();

        let mut votes = BTreeSet::new();
        votes.insert(self.id);
        self.role = RoleState::Candidate { votes };
        output.hard_state = Some(self.hard_state());

        info!(id = %self.id, term = %self.term, "starting election");

        if self.membership.quorum() <= 1 {
            self.become_leader(output);
            return;
        }

        for peer in self.peer_ids() {
            output.messages.push(Message {
                from: self.id,
                to: peer,
                term: self.term,
                payload: MessagePayload::RequestVote {
                    last_log_index: self.log.last_index(),
                    last_log_term: self.log.last_term(),
                },
            });
        }
    }

    fn become_follower(&mut self, term: Term, leader: Option<NodeId>, output: &mut RaftOutput) {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
            output.hard_state = Some(self.hard_state());
        }
        if !matches!(self.role, RoleState::Follower { .. }) {
            info!(id = %self.id, term = %self.term, "stepping down to follower");
        }
        self.role = RoleState::Follower { leader };
        self.reset_election_timer();
    }

    fn become_leader(&mut self, output: &mut RaftOutput) {
        info!(id = %self.id, term = %self.term, "became leader");

        let next = self.log.last_index().next();
        let mut progress = BTreeMap::new();
        for peer in self.peer_ids() {
            progress.insert(
                peer,
                Progress {
                    next,
                    matched: LogIndex::ZERO,
                    snapshot_cooldown: 0,
                },
            );
        }
        self.role = RoleState::Leader { progress };
        self.heartbeat_elapsed = 0;

        // A no-op pins the commit index into the new term.
        self.append_as_leader(EntryPayload::Noop, output);
        self.broadcast_append(output);
    }

    fn peer_ids(&self) -> Vec<NodeId> {
        self.membership
            .voters()
            .keys()
            .copied()
            .filter(|peer| *peer != self.id)
            .collect()
    }

    fn hard_state(&self) -> HardState {
        HardState {
            term: self.term,
            voted_for: self.voted_for,
        }
    }

    // ========================================================================
    // Proposals
    // ========================================================================

    fn propose(
        &mut self,
        payload: EntryPayload,
        output: &mut RaftOutput,
    ) -> Result<(), RaftError> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader {
                leader: self.leader_hint(),
            });
        }

        let index = self.append_as_leader(payload, output);
        output.proposed = Some((self.term, index));
        // Push to followers right away instead of waiting for a heartbeat.
        self.broadcast_append(output);
        Ok(())
    }

    fn append_as_leader(&mut self, payload: EntryPayload, output: &mut RaftOutput) -> LogIndex {
        let entry = LogEntry {
            term: self.term,
            index: self.log.last_index().next(),
            payload,
        };
        if let EntryPayload::ConfChange(change) = &entry.payload {
            // Membership applies at append time; new voters start
            // replicating immediately.
            self.membership.apply(change);
            self.sync_progress_to_membership();
        }
        self.log.append(entry.clone());
        output.append_entries.push(entry.clone());

        let index = entry.index;
        // Single-node clusters commit without any network round trip.
        self.maybe_advance_commit(output);
        index
    }

    fn sync_progress_to_membership(&mut self) {
        let next = self.log.last_index().next();
        let members: Vec<NodeId> = self.peer_ids();
        if let RoleState::Leader { progress } = &mut self.role {
            progress.retain(|peer, _| members.contains(peer));
            for peer in members {
                progress.entry(peer).or_insert(Progress {
                    next,
                    matched: LogIndex::ZERO,
                    snapshot_cooldown: 0,
                });
            }
        }
    }

    // ========================================================================
    // Replication (leader side)
    // ========================================================================

    fn broadcast_append(&mut self, output: &mut RaftOutput) {
        for peer in self.peer_ids() {
            self.send_append(peer, output);
        }
    }

    fn send_append(&mut self, peer: NodeId, output: &mut RaftOutput) {
        let RoleState::Leader { progress } = &mut self.role else {
            return;
        };
        let Some(prog) = progress.get_mut(&peer) else {
            return;
        };

        // The follower needs entries we have already compacted away.
        if prog.next <= self.log.snapshot_index() {
            if prog.snapshot_cooldown > 0 {
                prog.snapshot_cooldown -= 1;
                return;
            }
            if let Some(snapshot) = &self.snapshot {
                prog.snapshot_cooldown = 20;
                trace!(to = %peer, index = %snapshot.index, "sending snapshot");
                output.messages.push(Message {
                    from: self.id,
                    to: peer,
                    term: self.term,
                    payload: MessagePayload::InstallSnapshot {
                        snapshot: snapshot.clone(),
                    },
                });
            }
            return;
        }

        let prev_log_index = prog.next.prev();
        let prev_log_term = self
            .log
            .term_at(prev_log_index)
            .expect("prev index is at or after the snapshot boundary");
        let entries = self
            .log
            .slice_from(prog.next, self.config.max_entries_per_append);

        output.messages.push(Message {
            from: self.id,
            to: peer,
            term: self.term,
            payload: MessagePayload::AppendEntries {
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.commit_index,
            },
        });
    }

    fn maybe_advance_commit(&mut self, output: &mut RaftOutput) {
        let RoleState::Leader { progress } = &self.role else {
            return;
        };

        // Highest N replicated on a quorum with an entry from this term.
        let quorum = self.membership.quorum();
        let mut candidate = self.commit_index;
        let last = self.log.last_index();
        let mut n = self.commit_index.next();
        while n <= last {
            let mut count = usize::from(self.membership.contains(&self.id));
            for (peer, prog) in progress {
                if self.membership.contains(peer) && prog.matched >= n {
                    count += 1;
                }
            }
            if count >= quorum && self.log.term_at(n) == Some(self.term) {
                candidate = n;
            }
            n = n.next();
        }

        if candidate > self.commit_index {
            self.commit_index = candidate;
            self.emit_committed(output);
        }
    }

    fn emit_committed(&mut self, output: &mut RaftOutput) {
        while self.emitted_index < self.commit_index {
            let next = self.emitted_index.next();
            let entry = self
                .log
                .get(next)
                .expect("committed entry present in log")
                .clone();
            self.emitted_index = next;
            output.committed.push(entry);
        }
    }

    // ========================================================================
    // Message handling
    // ========================================================================

    fn receive(&mut self, msg: Message, output: &mut RaftOutput) {
        trace!(
            id = %self.id,
            from = %msg.from,
            kind = msg.payload.name(),
            term = %msg.term,
            "receive"
        );

        if msg.term > self.term {
            // A newer term always demotes us before the payload is handled.
            let leader = match msg.payload {
                MessagePayload::AppendEntries { .. } | MessagePayload::InstallSnapshot { .. } => {
                    Some(msg.from)
                }
                _ => None,
            };
            self.become_follower(msg.term, leader, output);
        }

        match msg.payload {
            MessagePayload::RequestVote {
                last_log_index,
                last_log_term,
            } => self.on_request_vote(msg.from, msg.term, last_log_index, last_log_term, output),

            MessagePayload::RequestVoteReply { granted } => {
                self.on_vote_reply(msg.from, msg.term, granted, output);
            }

            MessagePayload::AppendEntries {
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => self.on_append_entries(
                msg.from,
                msg.term,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
                output,
            ),

            MessagePayload::AppendEntriesReply {
                success,
                match_index,
            } => self.on_append_reply(msg.from, msg.term, success, match_index, output),

            MessagePayload::InstallSnapshot { snapshot } => {
                self.on_install_snapshot(msg.from, msg.term, snapshot, output);
            }

            MessagePayload::InstallSnapshotReply { match_index } => {
                self.on_snapshot_reply(msg.from, msg.term, match_index, output);
            }
        }
    }

    fn on_request_vote(
        &mut self,
        from: NodeId,
        term: Term,
        last_log_index: LogIndex,
        last_log_term: Term,
        output: &mut RaftOutput,
    ) {
        let up_to_date = (last_log_term, last_log_index)
            >= (self.log.last_term(), self.log.last_index());
        let granted = term == self.term
            && up_to_date
            && (self.voted_for.is_none() || self.voted_for == Some(from));

        if granted {
            self.voted_for = Some(from);
            output.hard_state = Some(self.hard_state());
            self.reset_election_timer();
            debug!(id = %self.id, candidate = %from, term = %self.term, "vote granted");
        }

        output.messages.push(Message {
            from: self.id,
            to: from,
            term: self.term,
            payload: MessagePayload::RequestVoteReply { granted },
        });
    }

    fn on_vote_reply(
        &mut self,
        from: NodeId,
        term: Term,
        granted: bool,
        output: &mut RaftOutput,
    ) {
        if term < self.term || !granted {
            return;
        }
        let RoleState::Candidate { votes } = &mut self.role else {
            return;
        };
        votes.insert(from);
        if votes.len() >= self.membership.quorum() {
            self.become_leader(output);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_append_entries(
        &mut self,
        from: NodeId,
        term: Term,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
        output: &mut RaftOutput,
    ) {
        if term < self.term {
            output.messages.push(Message {
                from: self.id,
                to: from,
                term: self.term,
                payload: MessagePayload::AppendEntriesReply {
                    success: false,
                    match_index: self.log.last_index(),
                },
            });
            return;
        }

        // Same term: a candidate yields to the established leader.
        self.become_follower(term, Some(from), output);

        // Log consistency check at prev.
        let prev_ok = prev_log_index <= self.log.last_index()
            && (prev_log_index < self.log.snapshot_index()
                || self.log.term_at(prev_log_index) == Some(prev_log_term));
        if !prev_ok {
            output.messages.push(Message {
                from: self.id,
                to: from,
                term: self.term,
                payload: MessagePayload::AppendEntriesReply {
                    success: false,
                    match_index: self.log.last_index().min(prev_log_index.prev()),
                },
            });
            return;
        }

        let match_through = prev_log_index + entries.len() as u64;
        for entry in entries {
            if entry.index <= self.log.snapshot_index() {
                continue; // already folded into our snapshot
            }
            match self.log.term_at(entry.index) {
                Some(existing) if existing == entry.term => continue,
                Some(_) => {
                    // Conflict: drop our suffix, then take the leader's.
                    self.log.truncate_from(entry.index);
                    self.rebuild_membership_from_log();
                    output.truncate_log_from = Some(entry.index);
                }
                None => {}
            }
            if let EntryPayload::ConfChange(change) = &entry.payload {
                self.membership.apply(change);
            }
            self.log.append(entry.clone());
            output.append_entries.push(entry);
        }

        let new_commit = leader_commit.min(self.log.last_index());
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            self.emit_committed(output);
        }

        output.messages.push(Message {
            from: self.id,
            to: from,
            term: self.term,
            payload: MessagePayload::AppendEntriesReply {
                success: true,
                match_index: match_through,
            },
        });
    }

    fn rebuild_membership_from_log(&mut self) {
        let mut membership = self
            .snapshot
            .as_ref()
            .map(|s| s.membership.clone())
            .unwrap_or_default();
        for entry in self.log.entries() {
            if let EntryPayload::ConfChange(change) = &entry.payload {
                membership.apply(change);
            }
        }
        // A bootstrap member that never appears in the log keeps its seed
        // membership (the log may simply not contain conf entries yet).
        if membership.is_empty() {
            return;
        }
        self.membership = membership;
    }

    fn on_append_reply(
        &mut self,
        from: NodeId,
        term: Term,
        success: bool,
        match_index: LogIndex,
        output: &mut RaftOutput,
    ) {
        if term < self.term || !self.is_leader() {
            return;
        }
        let RoleState::Leader { progress } = &mut self.role else {
            return;
        };
        let Some(prog) = progress.get_mut(&from) else {
            return;
        };

        if success {
            if match_index > prog.matched {
                prog.matched = match_index;
            }
            prog.next = prog.matched.next();
            self.maybe_advance_commit(output);
        } else {
            // Back up and retry immediately.
            prog.next = prog.next.prev().min(match_index.next()).max(LogIndex::new(1));
            self.send_append(from, output);
        }
    }

    fn on_install_snapshot(
        &mut self,
        from: NodeId,
        term: Term,
        snapshot: SnapshotBlob,
        output: &mut RaftOutput,
    ) {
        if term < self.term {
            return;
        }
        self.become_follower(term, Some(from), output);

        if snapshot.index <= self.commit_index {
            // Stale snapshot; just tell the leader where we are.
            output.messages.push(Message {
                from: self.id,
                to: from,
                term: self.term,
                payload: MessagePayload::InstallSnapshotReply {
                    match_index: self.commit_index,
                },
            });
            return;
        }

        info!(id = %self.id, index = %snapshot.index, "installing snapshot");
        self.log.reset_to_snapshot(snapshot.index, snapshot.term);
        self.membership = snapshot.membership.clone();
        self.commit_index = snapshot.index;
        self.emitted_index = snapshot.index;
        self.snapshot = Some(snapshot.clone());

        output.messages.push(Message {
            from: self.id,
            to: from,
            term: self.term,
            payload: MessagePayload::InstallSnapshotReply {
                match_index: snapshot.index,
            },
        });
        output.install_snapshot = Some(snapshot);
    }

    fn on_snapshot_reply(
        &mut self,
        from: NodeId,
        term: Term,
        match_index: LogIndex,
        output: &mut RaftOutput,
    ) {
        if term < self.term || !self.is_leader() {
            return;
        }
        let RoleState::Leader { progress } = &mut self.role else {
            return;
        };
        if let Some(prog) = progress.get_mut(&from) {
            prog.snapshot_cooldown = 0;
            if match_index > prog.matched {
                prog.matched = match_index;
            }
            prog.next = prog.matched.next();
        }
        self.maybe_advance_commit(output);
    }
}
