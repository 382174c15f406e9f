//! Deterministic multi-node raft tests.
//!
//! The harness runs real `RaftNode`s over an in-memory message queue with
//! scripted ticks and partitions. Seeds are fixed, so every run takes the
//! same elections and the assertions are exact.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use bytes::Bytes;
use warren_types::NodeId;

use crate::{
    ConfChange, EntryPayload, HardState, LogEntry, Membership, Message, RaftConfig, RaftError,
    RaftEvent, RaftNode, RaftOutput, SnapshotBlob,
};

fn node_id(n: u8) -> NodeId {
    NodeId::from_bytes([n; 16])
}

fn cmd(tag: u8) -> EntryPayload {
    EntryPayload::Command(Bytes::copy_from_slice(&[tag]))
}

struct Cluster {
    nodes: BTreeMap<NodeId, RaftNode>,
    queue: VecDeque<Message>,
    partitioned: BTreeSet<NodeId>,
    /// Commands applied per node, in commit order.
    applied: BTreeMap<NodeId, Vec<LogEntry>>,
}

impl Cluster {
    fn new(count: u8) -> Self {
        let mut membership = Membership::default();
        for n in 1..=count {
            membership.apply(&ConfChange::AddVoter {
                id: node_id(n),
                addr: format!("10.0.0.{n}:7000"),
            });
        }

        let mut nodes = BTreeMap::new();
        let mut applied = BTreeMap::new();
        for n in 1..=count {
            let id = node_id(n);
            nodes.insert(
                id,
                RaftNode::new(id, membership.clone(), RaftConfig::default(), u64::from(n) * 7919),
            );
            applied.insert(id, Vec::new());
        }

        Self {
            nodes,
            queue: VecDeque::new(),
            partitioned: BTreeSet::new(),
            applied,
        }
    }

    fn absorb(&mut self, id: NodeId, output: RaftOutput) {
        self.applied.get_mut(&id).unwrap().extend(output.committed);
        if !self.partitioned.contains(&id) {
            self.queue.extend(output.messages);
        }
    }

    /// Delivers queued messages until the network is quiet.
    fn settle(&mut self) {
        while let Some(msg) = self.queue.pop_front() {
            if self.partitioned.contains(&msg.from) || self.partitioned.contains(&msg.to) {
                continue;
            }
            let Some(node) = self.nodes.get_mut(&msg.to) else {
                continue;
            };
            let to = msg.to;
            let output = node.step(RaftEvent::Receive(msg)).unwrap();
            self.absorb(to, output);
        }
    }

    /// One tick on every node, then full message settlement.
    fn tick(&mut self) {
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for id in ids {
            let output = self
                .nodes
                .get_mut(&id)
                .unwrap()
                .step(RaftEvent::Tick)
                .unwrap();
            self.absorb(id, output);
        }
        self.settle();
    }

    fn tick_n(&mut self, n: u32) {
        for _ in 0..n {
            self.tick();
        }
    }

    fn leaders(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.is_leader() && !self.partitioned.contains(&n.id()))
            .map(RaftNode::id)
            .collect()
    }

    fn run_until_leader(&mut self) -> NodeId {
        for _ in 0..200 {
            self.tick();
            let leaders = self.leaders();
            if leaders.len() == 1 {
                return leaders[0];
            }
        }
        panic!("no leader elected within 200 ticks");
    }

    fn propose(&mut self, on: NodeId, payload: EntryPayload) -> Result<(), RaftError> {
        let output = self
            .nodes
            .get_mut(&on)
            .unwrap()
            .step(RaftEvent::Propose(payload))?;
        self.absorb(on, output);
        self.settle();
        Ok(())
    }

    fn applied_commands(&self, id: NodeId) -> Vec<Bytes> {
        self.applied[&id]
            .iter()
            .filter_map(|e| match &e.payload {
                EntryPayload::Command(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }
}

// ============================================================================
// Elections
// ============================================================================

#[test]
fn single_node_elects_itself_and_commits() {
    let mut cluster = Cluster::new(1);
    let leader = cluster.run_until_leader();

    cluster.propose(leader, cmd(1)).unwrap();
    cluster.propose(leader, cmd(2)).unwrap();

    assert_eq!(
        cluster.applied_commands(leader),
        vec![Bytes::from_static(&[1]), Bytes::from_static(&[2])]
    );
}

#[test]
fn three_nodes_elect_exactly_one_leader() {
    let mut cluster = Cluster::new(3);
    let leader = cluster.run_until_leader();

    // Stability: more ticks never produce a second leader.
    cluster.tick_n(50);
    assert_eq!(cluster.leaders(), vec![leader]);

    // Everyone agrees on the term.
    let term = cluster.nodes[&leader].term();
    for node in cluster.nodes.values() {
        assert_eq!(node.term(), term);
    }
}

#[test]
fn followers_redirect_proposals() {
    let mut cluster = Cluster::new(3);
    let leader = cluster.run_until_leader();

    let follower = cluster
        .nodes
        .keys()
        .copied()
        .find(|id| *id != leader)
        .unwrap();

    let err = cluster.propose(follower, cmd(1)).unwrap_err();
    assert_eq!(err, RaftError::NotLeader { leader: Some(leader) });
}

#[test]
fn leader_failure_triggers_reelection() {
    let mut cluster = Cluster::new(3);
    let old_leader = cluster.run_until_leader();
    let old_term = cluster.nodes[&old_leader].term();

    cluster.partitioned.insert(old_leader);
    let new_leader = cluster.run_until_leader();

    assert_ne!(new_leader, old_leader);
    assert!(cluster.nodes[&new_leader].term() > old_term);

    // The healed old leader steps down on first contact.
    cluster.partitioned.clear();
    cluster.tick_n(5);
    assert_eq!(cluster.leaders(), vec![new_leader]);
    assert!(!cluster.nodes[&old_leader].is_leader());
}

// ============================================================================
// Replication
// ============================================================================

#[test]
fn committed_entries_reach_every_node() {
    let mut cluster = Cluster::new(3);
    let leader = cluster.run_until_leader();

    for tag in 1..=5 {
        cluster.propose(leader, cmd(tag)).unwrap();
    }
    cluster.tick_n(3);

    let expected: Vec<Bytes> = (1..=5).map(|t| Bytes::copy_from_slice(&[t])).collect();
    for id in cluster.nodes.keys() {
        assert_eq!(cluster.applied_commands(*id), expected, "node {id}");
    }
}

#[test]
fn entries_survive_leader_change() {
    let mut cluster = Cluster::new(3);
    let first = cluster.run_until_leader();
    cluster.propose(first, cmd(1)).unwrap();

    cluster.partitioned.insert(first);
    let second = cluster.run_until_leader();
    cluster.propose(second, cmd(2)).unwrap();
    cluster.partitioned.clear();
    cluster.tick_n(10);

    for id in cluster.nodes.keys() {
        assert_eq!(
            cluster.applied_commands(*id),
            vec![Bytes::from_static(&[1]), Bytes::from_static(&[2])],
            "node {id}"
        );
    }
}

#[test]
fn uncommitted_entries_from_a_deposed_leader_are_discarded() {
    let mut cluster = Cluster::new(3);
    let old_leader = cluster.run_until_leader();
    cluster.propose(old_leader, cmd(1)).unwrap();

    // Cut the leader off, then feed it a proposal that can never commit.
    cluster.partitioned.insert(old_leader);
    let output = cluster
        .nodes
        .get_mut(&old_leader)
        .unwrap()
        .step(RaftEvent::Propose(cmd(99)))
        .unwrap();
    drop(output); // messages go nowhere: partitioned

    let new_leader = cluster.run_until_leader();
    cluster.propose(new_leader, cmd(2)).unwrap();

    cluster.partitioned.clear();
    cluster.tick_n(10);

    // The stale entry is gone everywhere, including the old leader.
    for id in cluster.nodes.keys() {
        assert_eq!(
            cluster.applied_commands(*id),
            vec![Bytes::from_static(&[1]), Bytes::from_static(&[2])],
            "node {id}"
        );
    }
}

// ============================================================================
// Snapshots
// ============================================================================

#[test]
fn lagging_follower_catches_up_via_snapshot() {
    let mut cluster = Cluster::new(3);
    let leader = cluster.run_until_leader();

    let laggard = cluster
        .nodes
        .keys()
        .copied()
        .find(|id| *id != leader)
        .unwrap();
    cluster.partitioned.insert(laggard);

    for tag in 1..=6 {
        cluster.propose(leader, cmd(tag)).unwrap();
    }

    // The runtime takes a snapshot of applied state and compacts.
    let leader_node = cluster.nodes.get_mut(&leader).unwrap();
    let index = leader_node.commit_index();
    let term = leader_node.term();
    let membership = leader_node.membership().clone();
    leader_node.compact(SnapshotBlob {
        index,
        term,
        membership,
        data: Bytes::from_static(b"state-at-6"),
    });

    cluster.partitioned.clear();
    cluster.tick_n(10);

    let follower = &cluster.nodes[&laggard];
    assert_eq!(follower.commit_index(), index);
    assert_eq!(follower.log().snapshot_index(), index);
}

// ============================================================================
// Membership
// ============================================================================

#[test]
fn add_voter_extends_the_quorum() {
    let mut cluster = Cluster::new(1);
    let leader = cluster.run_until_leader();
    cluster.propose(leader, cmd(1)).unwrap();

    // A joining manager starts with the membership it was told at join.
    let joiner = node_id(9);
    let seed_membership = cluster.nodes[&leader].membership().clone();
    cluster.nodes.insert(
        joiner,
        RaftNode::new(joiner, seed_membership, RaftConfig::default(), 424_242),
    );
    cluster.applied.insert(joiner, Vec::new());

    cluster
        .propose(
            leader,
            EntryPayload::ConfChange(ConfChange::AddVoter {
                id: joiner,
                addr: "10.0.0.9:7000".into(),
            }),
        )
        .unwrap();
    cluster.tick_n(5);

    // The joiner has replicated history and counts toward the quorum.
    assert_eq!(cluster.nodes[&leader].membership().len(), 2);
    assert_eq!(
        cluster.applied_commands(joiner),
        vec![Bytes::from_static(&[1])]
    );

    cluster.propose(leader, cmd(2)).unwrap();
    cluster.tick_n(3);
    assert_eq!(
        cluster.applied_commands(joiner),
        vec![Bytes::from_static(&[1]), Bytes::from_static(&[2])]
    );
}

// ============================================================================
// Wire encoding
// ============================================================================

#[test]
fn messages_round_trip_through_postcard() {
    let msg = Message {
        from: node_id(1),
        to: node_id(2),
        term: crate::Term::new(3),
        payload: crate::MessagePayload::AppendEntries {
            prev_log_index: crate::LogIndex::new(7),
            prev_log_term: crate::Term::new(2),
            entries: vec![LogEntry {
                term: crate::Term::new(3),
                index: crate::LogIndex::new(8),
                payload: cmd(42),
            }],
            leader_commit: crate::LogIndex::new(7),
        },
    };
    let bytes = postcard::to_allocvec(&msg).unwrap();
    let back: Message = postcard::from_bytes(&bytes).unwrap();
    assert_eq!(back, msg);
}

// ============================================================================
// Restore
// ============================================================================

#[test]
fn restore_preserves_term_vote_and_log() {
    let mut cluster = Cluster::new(3);
    let leader = cluster.run_until_leader();
    cluster.propose(leader, cmd(1)).unwrap();
    cluster.propose(leader, cmd(2)).unwrap();

    let node = &cluster.nodes[&leader];
    let hard_state = HardState {
        term: node.term(),
        voted_for: Some(leader),
    };
    let entries = node.log().entries().to_vec();
    // Every data dir starts from a membership-bearing snapshot (written at
    // bootstrap or join), so membership always survives a restart.
    let bootstrap_snapshot = SnapshotBlob {
        index: crate::LogIndex::ZERO,
        term: crate::Term::ZERO,
        membership: node.membership().clone(),
        data: Bytes::new(),
    };

    let restored = RaftNode::restore(
        leader,
        hard_state,
        Some(bootstrap_snapshot),
        entries.clone(),
        RaftConfig::default(),
        1,
    );

    assert_eq!(restored.term(), node.term());
    assert_eq!(restored.last_log_index(), node.last_log_index());
    assert_eq!(restored.log().entries(), entries.as_slice());
    // Commit is not persisted; it is relearned from the next leader.
    assert_eq!(restored.commit_index().as_u64(), 0);
    assert!(restored.membership().contains(&leader));
}
