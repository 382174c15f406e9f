//! The consensus runtime: the imperative shell around the pure raft core.
//!
//! One task owns the `RaftNode`, the WAL, and the applied kernel state.
//! Everything else talks to it through the [`Gateway`]:
//!
//! ```text
//! handlers / loops ──Propose──► runtime task ──► wal (persist)
//!        ▲                         │       └──► transport (send)
//!        │                         ▼
//!   watch<Arc<State>> ◄── apply committed ──► broadcast<ClusterEvent>
//! ```
//!
//! The persistence contract from `warren-raft` is honored here: hard state
//! and entries hit disk before any message leaves the process.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use warren_config::RaftTimingConfig;
use warren_kernel::{apply_committed, Command, Effect, State};
use warren_raft::{
    EntryPayload, HardState, LogEntry, LogIndex, Membership, Message, RaftConfig, RaftError,
    RaftEvent, RaftNode, RaftOutput, SnapshotBlob,
};
use warren_store::{DataDir, StoreError, Wal};
use warren_types::{ClusterEvent, NodeId};

use crate::error::ManagerError;

/// Capacity of the runtime mailbox and the event fan-out.
const MAILBOX_DEPTH: usize = 256;
const EVENT_DEPTH: usize = 1024;

/// What the rest of the process knows about leadership.
#[derive(Debug, Clone, Default)]
pub struct LeaderView {
    pub is_leader: bool,
    pub leader_id: Option<NodeId>,
    pub leader_addr: Option<String>,
    pub term: u64,
}

/// Messages into the runtime task.
pub enum RuntimeMsg {
    Propose {
        payload: EntryPayload,
        reply: oneshot::Sender<Result<(), ManagerError>>,
    },
    Peer(Message),
}

/// Cloneable handle to the consensus runtime.
#[derive(Clone)]
pub struct Gateway {
    node_id: NodeId,
    tx: mpsc::Sender<RuntimeMsg>,
    state_rx: watch::Receiver<Arc<State>>,
    leader_rx: watch::Receiver<LeaderView>,
    events: broadcast::Sender<ClusterEvent>,
}

impl Gateway {
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Current applied state (bounded staleness on followers).
    pub fn state(&self) -> Arc<State> {
        self.state_rx.borrow().clone()
    }

    pub fn leader(&self) -> LeaderView {
        self.leader_rx.borrow().clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    /// Waits until this node has observed a leader (used at startup).
    pub async fn wait_for_leader(&self) {
        let mut rx = self.leader_rx.clone();
        loop {
            if rx.borrow().leader_id.is_some() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Proposes one kernel command and waits for it to commit and apply.
    pub async fn propose(&self, cmd: Command) -> Result<(), ManagerError> {
        let bytes = postcard::to_allocvec(&cmd)
            .map_err(|e| ManagerError::Validation(format!("unencodable command: {e}")))?;
        self.propose_payload(EntryPayload::Command(Bytes::from(bytes)))
            .await
    }

    /// Proposes a membership change (manager join/leave).
    pub async fn propose_conf_change(
        &self,
        change: warren_raft::ConfChange,
    ) -> Result<(), ManagerError> {
        self.propose_payload(EntryPayload::ConfChange(change)).await
    }

    async fn propose_payload(&self, payload: EntryPayload) -> Result<(), ManagerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RuntimeMsg::Propose { payload, reply })
            .await
            .map_err(|_| ManagerError::Unavailable("consensus runtime stopped".into()))?;
        rx.await
            .map_err(|_| ManagerError::Unavailable("proposal dropped".into()))?
    }

    /// Feeds a raft message received from a peer.
    pub async fn deliver_peer_message(&self, msg: Message) -> Result<(), ManagerError> {
        self.tx
            .send(RuntimeMsg::Peer(msg))
            .await
            .map_err(|_| ManagerError::Unavailable("consensus runtime stopped".into()))
    }
}

/// The runtime task state.
pub struct RaftRuntime {
    node: RaftNode,
    wal: Wal,
    data_dir: DataDir,
    kernel: State,
    last_applied: LogIndex,
    applied_since_snapshot: u64,
    timing: RaftTimingConfig,

    mailbox: mpsc::Receiver<RuntimeMsg>,
    outbound: mpsc::Sender<(String, Message)>,
    state_tx: watch::Sender<Arc<State>>,
    leader_tx: watch::Sender<LeaderView>,
    events: broadcast::Sender<ClusterEvent>,

    /// Proposals waiting for commit+apply, keyed by assigned log index.
    pending: BTreeMap<LogIndex, (u64, oneshot::Sender<Result<(), ManagerError>>)>,
    was_leader: bool,
}

impl RaftRuntime {
    /// Opens durable state and builds the runtime plus its gateway.
    ///
    /// `seed_membership` is written as a bootstrap snapshot when the data
    /// directory has none yet (first start of a bootstrapped or joining
    /// manager).
    pub fn open(
        node_id: NodeId,
        data_dir: DataDir,
        seed_membership: Option<Membership>,
        timing: RaftTimingConfig,
        outbound: mpsc::Sender<(String, Message)>,
    ) -> Result<(Self, Gateway), ManagerError> {
        // Snapshot: every data dir carries one so membership survives
        // restarts that happen before the first real compaction.
        let snapshot = match warren_store::latest_snapshot(&data_dir.snapshot_dir())? {
            Some((_, bytes)) => {
                postcard::from_bytes::<SnapshotBlob>(&bytes).map_err(StoreError::Encoding)?
            }
            None => {
                let membership = seed_membership.ok_or_else(|| {
                    ManagerError::Validation(
                        "data directory is empty and no seed membership was provided".into(),
                    )
                })?;
                let blob = SnapshotBlob {
                    index: LogIndex::ZERO,
                    term: warren_raft::Term::ZERO,
                    membership,
                    data: Bytes::from(
                        postcard::to_allocvec(&State::new()).map_err(StoreError::Encoding)?,
                    ),
                };
                let bytes = postcard::to_allocvec(&blob).map_err(StoreError::Encoding)?;
                warren_store::write_snapshot(&data_dir.snapshot_dir(), 0, &bytes)?;
                blob
            }
        };

        let hard_state = match warren_store::read_state_file(&data_dir.hard_state_file())? {
            Some(bytes) => postcard::from_bytes(&bytes).map_err(StoreError::Encoding)?,
            None => HardState::default(),
        };

        let (wal, records) = Wal::open(&data_dir.raft_dir())?;
        let entries = fold_wal_records(&records, snapshot.index)?;

        let kernel: State =
            postcard::from_bytes(&snapshot.data).map_err(StoreError::Encoding)?;
        let last_applied = snapshot.index;

        let seed = u64::from_le_bytes(node_id.as_bytes()[..8].try_into().expect("8 bytes"));
        let raft_config = RaftConfig {
            heartbeat_tick: timing.heartbeat_tick,
            election_tick_min: timing.election_tick_min,
            election_tick_max: timing.election_tick_max,
            ..RaftConfig::default()
        };
        let node = RaftNode::restore(
            node_id,
            hard_state,
            Some(snapshot),
            entries,
            raft_config,
            seed,
        );

        let (tx, mailbox) = mpsc::channel(MAILBOX_DEPTH);
        let (state_tx, state_rx) = watch::channel(Arc::new(kernel.clone()));
        let (leader_tx, leader_rx) = watch::channel(LeaderView::default());
        let (events, _) = broadcast::channel(EVENT_DEPTH);

        let gateway = Gateway {
            node_id,
            tx,
            state_rx,
            leader_rx,
            events: events.clone(),
        };

        info!(
            id = %node_id,
            last_index = %node.last_log_index(),
            term = %node.term(),
            "consensus runtime opened"
        );

        Ok((
            Self {
                node,
                wal,
                data_dir,
                kernel,
                last_applied,
                applied_since_snapshot: 0,
                timing,
                mailbox,
                outbound,
                state_tx,
                leader_tx,
                events,
                pending: BTreeMap::new(),
                was_leader: false,
            },
            gateway,
        ))
    }

    /// Runs until the mailbox closes.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.timing.tick_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let result = tokio::select! {
                _ = ticker.tick() => self.step(RaftEvent::Tick),
                msg = self.mailbox.recv() => match msg {
                    Some(RuntimeMsg::Peer(m)) => self.step(RaftEvent::Receive(m)),
                    Some(RuntimeMsg::Propose { payload, reply }) => {
                        self.handle_propose(payload, reply)
                    }
                    None => return,
                },
            };
            if let Err(err) = result {
                // Durable-layer failures must not let consensus advance on
                // phantom state.
                error!(error = %err, "consensus runtime halting");
                self.fail_all_pending("consensus runtime halted");
                return;
            }
        }
    }

    fn handle_propose(
        &mut self,
        payload: EntryPayload,
        reply: oneshot::Sender<Result<(), ManagerError>>,
    ) -> Result<(), StoreError> {
        match self.node.step(RaftEvent::Propose(payload)) {
            Ok(output) => {
                if let Some((term, index)) = output.proposed {
                    self.pending.insert(index, (term.as_u64(), reply));
                } else {
                    // Proposal accepted but not assigned: cannot happen,
                    // but never leave a caller hanging.
                    let _ = reply.send(Err(ManagerError::Unavailable(
                        "proposal was not assigned a log index".into(),
                    )));
                }
                self.handle_output(output)
            }
            Err(RaftError::NotLeader { leader }) => {
                let leader_addr = leader
                    .and_then(|id| self.node.membership().voters().get(&id).cloned());
                let _ = reply.send(Err(ManagerError::NotLeader { leader_addr }));
                Ok(())
            }
        }
    }

    fn step(&mut self, event: RaftEvent) -> Result<(), StoreError> {
        match self.node.step(event) {
            Ok(output) => self.handle_output(output),
            Err(RaftError::NotLeader { .. }) => Ok(()),
        }
    }

    fn handle_output(&mut self, output: RaftOutput) -> Result<(), StoreError> {
        let RaftOutput {
            hard_state,
            append_entries,
            truncate_log_from,
            messages,
            committed,
            install_snapshot,
            proposed: _,
        } = output;

        // 1. Persist before anything can be observed remotely.
        if let Some(hs) = hard_state {
            let bytes = postcard::to_allocvec(&hs).map_err(StoreError::Encoding)?;
            warren_store::write_state_file(&self.data_dir.hard_state_file(), &bytes)?;
        }
        if truncate_log_from.is_some() {
            // The in-memory log is authoritative after a conflict; rewrite.
            self.rewrite_wal()?;
        } else {
            for entry in &append_entries {
                let bytes = postcard::to_allocvec(entry).map_err(StoreError::Encoding)?;
                self.wal.append(&bytes)?;
            }
        }

        // 2. A leader-sent snapshot replaces local state wholesale.
        if let Some(blob) = install_snapshot {
            self.install_snapshot(blob)?;
        }

        // 3. Apply committed entries to the kernel.
        for entry in committed {
            self.apply_entry(entry);
        }
        self.maybe_compact()?;

        // 4. Only now let messages out.
        for msg in messages {
            let Some(addr) = self.node.membership().voters().get(&msg.to).cloned() else {
                continue;
            };
            if self.outbound.try_send((addr, msg)).is_err() {
                debug!("outbound raft queue full; dropping message");
            }
        }

        self.publish_leader_view();
        Ok(())
    }

    fn apply_entry(&mut self, entry: LogEntry) {
        self.last_applied = entry.index;
        self.applied_since_snapshot += 1;

        let result = match &entry.payload {
            EntryPayload::Noop | EntryPayload::ConfChange(_) => Ok(()),
            EntryPayload::Command(bytes) => match postcard::from_bytes::<Command>(bytes) {
                Ok(cmd) => {
                    // The kernel consumes its input; keep ours for the
                    // rejection path.
                    match apply_committed(self.kernel.clone(), cmd) {
                        Ok((next, effects)) => {
                            self.kernel = next;
                            self.state_tx.send_replace(Arc::new(self.kernel.clone()));
                            for Effect::Emit(event) in effects {
                                let _ = self.events.send(event);
                            }
                            Ok(())
                        }
                        Err(err) => Err(ManagerError::Kernel(err)),
                    }
                }
                Err(err) => {
                    // A command that cannot decode is a replicated bug; it
                    // must reject identically on every node.
                    warn!(index = %entry.index, error = %err, "undecodable committed command");
                    Err(ManagerError::Validation("undecodable command".into()))
                }
            },
        };

        if let Some((term, reply)) = self.pending.remove(&entry.index) {
            if term == entry.term.as_u64() {
                let _ = reply.send(result);
            } else {
                // Our proposal lost its slot to another leader's entry.
                let _ = reply.send(Err(ManagerError::Unavailable(
                    "proposal displaced by leadership change".into(),
                )));
            }
        }
    }

    fn install_snapshot(&mut self, blob: SnapshotBlob) -> Result<(), StoreError> {
        match postcard::from_bytes::<State>(&blob.data) {
            Ok(state) => {
                self.kernel = state;
                self.state_tx.send_replace(Arc::new(self.kernel.clone()));
            }
            Err(err) => {
                error!(error = %err, "undecodable snapshot from leader");
                return Err(StoreError::Encoding(err));
            }
        }
        self.last_applied = blob.index;
        self.applied_since_snapshot = 0;

        let bytes = postcard::to_allocvec(&blob).map_err(StoreError::Encoding)?;
        warren_store::write_snapshot(&self.data_dir.snapshot_dir(), blob.index.as_u64(), &bytes)?;
        warren_store::purge_snapshots_below(&self.data_dir.snapshot_dir(), blob.index.as_u64())?;
        self.rewrite_wal()?;
        Ok(())
    }

    fn maybe_compact(&mut self) -> Result<(), StoreError> {
        if self.applied_since_snapshot < self.timing.snapshot_interval {
            return Ok(());
        }
        let index = self.last_applied;
        let Some(term) = self.node.log().term_at(index) else {
            return Ok(());
        };

        let blob = SnapshotBlob {
            index,
            term,
            membership: self.node.membership().clone(),
            data: Bytes::from(
                postcard::to_allocvec(&self.kernel).map_err(StoreError::Encoding)?,
            ),
        };
        let bytes = postcard::to_allocvec(&blob).map_err(StoreError::Encoding)?;
        warren_store::write_snapshot(&self.data_dir.snapshot_dir(), index.as_u64(), &bytes)?;

        self.node.compact(blob);
        self.rewrite_wal()?;
        warren_store::purge_snapshots_below(&self.data_dir.snapshot_dir(), index.as_u64())?;
        self.applied_since_snapshot = 0;
        info!(index = %index, "log compacted into snapshot");
        Ok(())
    }

    fn rewrite_wal(&mut self) -> Result<(), StoreError> {
        let serialized: Vec<Vec<u8>> = self
            .node
            .log()
            .entries()
            .iter()
            .map(|entry| postcard::to_allocvec(entry).map_err(StoreError::Encoding))
            .collect::<Result<_, _>>()?;
        self.wal.reset(serialized.iter().map(Vec::as_slice))
    }

    fn publish_leader_view(&mut self) {
        let is_leader = self.node.is_leader();
        if self.was_leader && !is_leader {
            self.fail_all_pending("leadership lost");
        }
        self.was_leader = is_leader;

        let leader_id = self.node.leader_hint();
        let leader_addr =
            leader_id.and_then(|id| self.node.membership().voters().get(&id).cloned());
        let view = LeaderView {
            is_leader,
            leader_id,
            leader_addr,
            term: self.node.term().as_u64(),
        };
        self.leader_tx.send_if_modified(|current| {
            let changed = current.is_leader != view.is_leader
                || current.leader_id != view.leader_id
                || current.term != view.term;
            if changed {
                *current = view;
            }
            changed
        });
    }

    fn fail_all_pending(&mut self, reason: &str) {
        for (_, (_, reply)) in std::mem::take(&mut self.pending) {
            let _ = reply.send(Err(ManagerError::Unavailable(reason.into())));
        }
    }
}

/// Replays WAL records into a contiguous entry list.
///
/// Handles the crash window where an old generation survived a reset: a
/// record whose index rewinds truncates the accumulated suffix first, the
/// same way a live follower would have.
fn fold_wal_records(
    records: &[Vec<u8>],
    snapshot_index: LogIndex,
) -> Result<Vec<LogEntry>, ManagerError> {
    let mut entries: Vec<LogEntry> = Vec::with_capacity(records.len());
    for record in records {
        let entry: LogEntry = postcard::from_bytes(record).map_err(StoreError::Encoding)?;
        if entry.index <= snapshot_index {
            continue;
        }
        let offset = (entry.index - snapshot_index) as usize - 1;
        entries.truncate(offset);
        entries.push(entry);
    }
    Ok(entries)
}

/// Lazily-dialed raft client fan-out. Sends are fire-and-forget with a
/// short deadline; a dead peer costs nothing but a debug line.
pub async fn run_transport(
    mut rx: mpsc::Receiver<(String, Message)>,
    tls: Option<tonic::transport::ClientTlsConfig>,
) {
    use warren_proto::pb::raft_client::RaftClient;
    use warren_proto::pb::RaftEnvelope;

    let mut channels: HashMap<String, tonic::transport::Channel> = HashMap::new();

    while let Some((addr, msg)) = rx.recv().await {
        let channel = match channels.get(&addr) {
            Some(channel) => channel.clone(),
            None => {
                let scheme = if tls.is_some() { "https" } else { "http" };
                let endpoint = match tonic::transport::Channel::from_shared(format!(
                    "{scheme}://{addr}"
                )) {
                    Ok(endpoint) => endpoint,
                    Err(err) => {
                        warn!(addr, error = %err, "bad peer address");
                        continue;
                    }
                };
                let endpoint = endpoint
                    .connect_timeout(Duration::from_secs(2))
                    .timeout(Duration::from_secs(2));
                let endpoint = match &tls {
                    Some(tls) => match endpoint.tls_config(tls.clone()) {
                        Ok(endpoint) => endpoint,
                        Err(err) => {
                            warn!(addr, error = %err, "peer tls config failed");
                            continue;
                        }
                    },
                    None => endpoint,
                };
                let channel = endpoint.connect_lazy();
                channels.insert(addr.clone(), channel.clone());
                channel
            }
        };

        let payload = match postcard::to_allocvec(&msg) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "unencodable raft message");
                continue;
            }
        };

        tokio::spawn(async move {
            let mut client = RaftClient::new(channel);
            if let Err(status) = client
                .deliver(RaftEnvelope {
                    payload: Bytes::from(payload),
                })
                .await
            {
                debug!(code = ?status.code(), "raft delivery failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_handles_generation_overlap() {
        fn entry(term: u64, index: u64) -> LogEntry {
            LogEntry {
                term: warren_raft::Term::new(term),
                index: LogIndex::new(index),
                payload: EntryPayload::Noop,
            }
        }
        let records: Vec<Vec<u8>> = [
            entry(1, 1),
            entry(1, 2),
            entry(1, 3),
            // A surviving older generation replays from the start; the
            // newer copy must win.
            entry(1, 1),
            entry(1, 2),
            entry(2, 3),
            entry(2, 4),
        ]
        .iter()
        .map(|e| postcard::to_allocvec(e).unwrap())
        .collect();

        let entries = fold_wal_records(&records, LogIndex::ZERO).unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[2].term, warren_raft::Term::new(2));
        assert_eq!(entries[3].index, LogIndex::new(4));
    }

    #[test]
    fn fold_skips_snapshotted_prefix() {
        let records: Vec<Vec<u8>> = (1..=5)
            .map(|i| {
                postcard::to_allocvec(&LogEntry {
                    term: warren_raft::Term::new(1),
                    index: LogIndex::new(i),
                    payload: EntryPayload::Noop,
                })
                .unwrap()
            })
            .collect();
        let entries = fold_wal_records(&records, LogIndex::new(3)).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].index, LogIndex::new(4));
    }
}
