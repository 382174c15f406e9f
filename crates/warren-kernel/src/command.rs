//! Commands consumed by the kernel.
//!
//! A command is one deterministic state transition. Commands are proposed by
//! the leader, replicated through the consensus log, and applied on every
//! manager by [`crate::apply_committed`]. Anything non-deterministic (wall
//! time, fresh IDs) is resolved by the proposer and carried in the command.

use serde::{Deserialize, Serialize};
use warren_types::{
    ActualState, ClusterMeta, Container, ContainerHealth, ContainerId, DesiredState, Ingress,
    JoinToken, Node, NodeId, NodeResources, NodeStatus, RolloutState, Secret, SecretId,
    ServiceId, ServiceSpec, Timestamp, TlsCertificate, TokenId, Volume, VolumeId,
};

/// A state transition request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    // ========================================================================
    // Cluster bootstrap
    // ========================================================================
    /// Seed the cluster-wide configuration. Valid exactly once.
    InitCluster { meta: ClusterMeta },

    // ========================================================================
    // Nodes
    // ========================================================================
    /// Insert or replace a node record (join, re-join, label edits).
    UpsertNode { node: Node },

    /// Heartbeat from a worker: refresh liveness and advertised resources.
    NodeHeartbeat {
        node_id: NodeId,
        now: Timestamp,
        resources: Option<NodeResources>,
    },

    /// Liveness verdict from the reconciler.
    SetNodeStatus { node_id: NodeId, status: NodeStatus },

    /// Remove a node. Only legal while the node is `Down`; its containers
    /// are deleted in the same apply (they are unreachable anyway).
    RemoveNode { node_id: NodeId },

    // ========================================================================
    // Services
    // ========================================================================
    CreateService {
        service_id: ServiceId,
        spec: ServiceSpec,
        now: Timestamp,
    },

    /// Replace the spec, bump the version, and open a rollout.
    UpdateService {
        service_id: ServiceId,
        spec: ServiceSpec,
        now: Timestamp,
    },

    /// Change only the replica count. No version bump, no rollout.
    ScaleService {
        service_id: ServiceId,
        replicas: u32,
        now: Timestamp,
    },

    /// Revert to the previous spec and version.
    RollbackService { service_id: ServiceId, now: Timestamp },

    /// Rollout-progress bookkeeping from the reconciler.
    SetServiceRollout {
        service_id: ServiceId,
        rollout: Option<RolloutState>,
        now: Timestamp,
    },

    DeleteService { service_id: ServiceId },

    // ========================================================================
    // Containers
    // ========================================================================
    /// Insert or replace a container record (scheduler placements).
    UpsertContainer { container: Container },

    /// Control-plane intent flip (scale-down, replacement, drain).
    SetContainerDesired {
        container_id: ContainerId,
        desired: DesiredState,
        now: Timestamp,
    },

    /// Worker status report for a container it owns.
    SetContainerActualState {
        container_id: ContainerId,
        actual: ActualState,
        runtime_handle: Option<String>,
        now: Timestamp,
    },

    /// Worker health report for a container it owns.
    SetContainerHealth {
        container_id: ContainerId,
        health: ContainerHealth,
        now: Timestamp,
    },

    DeleteContainer { container_id: ContainerId },

    // ========================================================================
    // Secrets
    // ========================================================================
    UpsertSecret { secret: Secret },
    DeleteSecret { secret_id: SecretId },

    // ========================================================================
    // Volumes
    // ========================================================================
    UpsertVolume { volume: Volume },

    /// Record the node a volume was first realized on. Monotonic.
    BindVolume { volume_id: VolumeId, node_id: NodeId },

    DeleteVolume { volume_id: VolumeId },

    // ========================================================================
    // Collaborator blobs
    // ========================================================================
    UpsertIngress { ingress: Ingress },
    DeleteIngress { name: String },
    UpsertTlsCertificate { cert: TlsCertificate },
    DeleteTlsCertificate { name: String },

    // ========================================================================
    // Join tokens
    // ========================================================================
    PutJoinToken { token: JoinToken },

    /// Mark a token used (single-use tokens become invalid).
    ConsumeJoinToken { token_id: TokenId, now: Timestamp },

    /// Drop every token that has expired by `now`.
    SweepTokens { now: Timestamp },

    // ========================================================================
    // Composition
    // ========================================================================
    /// Apply a planner's whole tick atomically: all commands succeed or the
    /// batch is rejected and the state is untouched.
    Batch(Vec<Command>),
}
