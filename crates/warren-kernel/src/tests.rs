//! Kernel apply tests.

use bytes::Bytes;
use std::collections::BTreeMap;
use uuid::Uuid;
use warren_types::{
    ActualState, ClusterMeta, Container, ContainerHealth, ContainerId, DeployStrategy,
    DesiredState, HealthState, Node, NodeId, NodeResources, NodeRole, NodeStatus, JoinToken,
    RollingSpec, Secret, SecretId, SecretRef, ServiceId, ServiceMode, ServiceSpec, Timestamp,
    TokenId, Volume, VolumeDriver, VolumeId, VolumeRef,
};

use crate::{apply_committed, Command, KernelError, State};

fn ts(ms: u64) -> Timestamp {
    Timestamp::from_millis(ms)
}

fn node_id(n: u8) -> NodeId {
    NodeId::from_bytes([n; 16])
}

fn service_id(n: u8) -> ServiceId {
    ServiceId::from_bytes([n; 16])
}

fn container_id(n: u8) -> ContainerId {
    ContainerId::from_bytes([n; 16])
}

fn worker(n: u8) -> Node {
    Node {
        id: node_id(n),
        role: NodeRole::Worker,
        addr: format!("10.0.0.{n}:7946"),
        hostname: format!("edge-{n}"),
        arch: "x86_64".into(),
        os: "linux".into(),
        labels: BTreeMap::new(),
        resources: NodeResources {
            cpu_millis: 4000,
            memory_bytes: 8 << 30,
        },
        status: NodeStatus::Ready,
        last_heartbeat: ts(0),
        created: ts(0),
    }
}

fn container(n: u8, service: ServiceId, node: NodeId, replica: u32) -> Container {
    Container {
        id: container_id(n),
        service_id: service,
        node_id: node,
        replica,
        version: 1,
        spec: ServiceSpec::replicated("x", "img", 1).container_spec(),
        desired: DesiredState::Running,
        actual: ActualState::Pending,
        health: ContainerHealth::default(),
        runtime_handle: None,
        created: ts(0),
        updated: ts(0),
    }
}

/// Applies a command, panicking on error.
fn apply(state: State, cmd: Command) -> State {
    apply_committed(state, cmd).expect("apply failed").0
}

fn state_with_service(spec: ServiceSpec) -> State {
    let state = apply(
        State::new(),
        Command::UpsertNode { node: worker(1) },
    );
    apply(
        state,
        Command::CreateService {
            service_id: service_id(9),
            spec,
            now: ts(1),
        },
    )
}

// ============================================================================
// Cluster bootstrap
// ============================================================================

#[test]
fn init_cluster_once() {
    let meta = ClusterMeta {
        cluster_id: Uuid::nil(),
        ca_cert_pem: "---".into(),
        ca_key_sealed: Bytes::from_static(b"sealed"),
        key_salt: Bytes::from_static(b"salt"),
        key_check: Bytes::from_static(b"check"),
        created: ts(0),
    };

    let state = apply(State::new(), Command::InitCluster { meta: meta.clone() });
    assert!(state.cluster().is_some());

    let err = apply_committed(state, Command::InitCluster { meta }).unwrap_err();
    assert_eq!(err, KernelError::ClusterAlreadyInitialized);
}

// ============================================================================
// Nodes
// ============================================================================

#[test]
fn heartbeat_refreshes_liveness() {
    let mut node = worker(1);
    node.status = NodeStatus::Down;
    let state = apply(State::new(), Command::UpsertNode { node });

    let state = apply(
        state,
        Command::NodeHeartbeat {
            node_id: node_id(1),
            now: ts(5_000),
            resources: None,
        },
    );

    let node = state.get_node(&node_id(1)).unwrap();
    assert_eq!(node.status, NodeStatus::Ready);
    assert_eq!(node.last_heartbeat, ts(5_000));
}

#[test]
fn heartbeat_for_unknown_node_fails() {
    let err = apply_committed(
        State::new(),
        Command::NodeHeartbeat {
            node_id: node_id(7),
            now: ts(0),
            resources: None,
        },
    )
    .unwrap_err();
    assert_eq!(err, KernelError::NodeNotFound(node_id(7)));
}

#[test]
fn remove_node_requires_down() {
    let state = apply(State::new(), Command::UpsertNode { node: worker(1) });

    let err = apply_committed(
        state.clone(),
        Command::RemoveNode { node_id: node_id(1) },
    )
    .unwrap_err();
    assert_eq!(err, KernelError::NodeNotDown(node_id(1)));

    let state = apply(
        state,
        Command::SetNodeStatus {
            node_id: node_id(1),
            status: NodeStatus::Down,
        },
    );
    let state = apply(state, Command::RemoveNode { node_id: node_id(1) });
    assert!(!state.node_exists(&node_id(1)));
}

#[test]
fn remove_node_cascades_to_its_containers() {
    let state = state_with_service(ServiceSpec::replicated("web", "nginx:1.25", 1));
    let state = apply(
        state,
        Command::UpsertContainer {
            container: container(1, service_id(9), node_id(1), 1),
        },
    );
    let state = apply(
        state,
        Command::SetNodeStatus {
            node_id: node_id(1),
            status: NodeStatus::Down,
        },
    );

    let state = apply(state, Command::RemoveNode { node_id: node_id(1) });
    assert!(state.containers().is_empty());
}

// ============================================================================
// Services
// ============================================================================

#[test]
fn create_service_rejects_duplicate_name() {
    let state = state_with_service(ServiceSpec::replicated("web", "nginx:1.25", 3));

    let err = apply_committed(
        state,
        Command::CreateService {
            service_id: service_id(10),
            spec: ServiceSpec::replicated("web", "httpd:2.4", 1),
            now: ts(2),
        },
    )
    .unwrap_err();
    assert_eq!(err, KernelError::ServiceNameConflict("web".into()));
}

#[test]
fn update_service_bumps_version_and_opens_rollout() {
    let state = state_with_service(ServiceSpec::replicated("web", "nginx:1.25", 4));

    let mut spec = ServiceSpec::replicated("web", "nginx:1.26", 4);
    spec.deploy.strategy = DeployStrategy::Rolling(RollingSpec::default());
    let state = apply(
        state,
        Command::UpdateService {
            service_id: service_id(9),
            spec,
            now: ts(10),
        },
    );

    let service = state.get_service(&service_id(9)).unwrap();
    assert_eq!(service.version, 2);
    assert_eq!(service.spec.image, "nginx:1.26");
    let rollout = service.rollout.unwrap();
    assert_eq!(rollout.target_version, 2);
    assert_eq!(rollout.prev_version, 1);
    let (prev_version, prev_spec) = service.previous.as_ref().unwrap();
    assert_eq!(*prev_version, 1);
    assert_eq!(prev_spec.image, "nginx:1.25");
}

#[test]
fn scale_changes_only_replicas() {
    let state = state_with_service(ServiceSpec::replicated("web", "nginx:1.25", 3));

    let state = apply(
        state,
        Command::ScaleService {
            service_id: service_id(9),
            replicas: 1,
            now: ts(5),
        },
    );

    let service = state.get_service(&service_id(9)).unwrap();
    assert_eq!(service.spec.mode, ServiceMode::Replicated { replicas: 1 });
    assert_eq!(service.version, 1);
    assert!(service.rollout.is_none());
}

#[test]
fn rollback_reverts_spec_and_version() {
    let state = state_with_service(ServiceSpec::replicated("web", "nginx:1.25", 4));
    let state = apply(
        state,
        Command::UpdateService {
            service_id: service_id(9),
            spec: ServiceSpec::replicated("web", "nginx:1.26", 4),
            now: ts(10),
        },
    );

    let state = apply(
        state,
        Command::RollbackService {
            service_id: service_id(9),
            now: ts(20),
        },
    );

    let service = state.get_service(&service_id(9)).unwrap();
    assert_eq!(service.version, 1);
    assert_eq!(service.spec.image, "nginx:1.25");
    assert!(service.rollout.is_none());

    // A later update must not reuse version 2's number... it tops it.
    let state = apply(
        state,
        Command::UpdateService {
            service_id: service_id(9),
            spec: ServiceSpec::replicated("web", "nginx:1.27", 4),
            now: ts(30),
        },
    );
    assert_eq!(state.get_service(&service_id(9)).unwrap().version, 3);
}

#[test]
fn rollback_without_history_fails() {
    let state = state_with_service(ServiceSpec::replicated("web", "nginx:1.25", 1));
    let err = apply_committed(
        state,
        Command::RollbackService {
            service_id: service_id(9),
            now: ts(1),
        },
    )
    .unwrap_err();
    assert_eq!(err, KernelError::NothingToRollback(service_id(9)));
}

#[test]
fn service_spec_referencing_missing_secret_is_rejected() {
    let mut spec = ServiceSpec::replicated("api", "api:1", 1);
    spec.secrets.push(SecretRef {
        source: "db-password".into(),
        target: "db_password".into(),
    });

    let err = apply_committed(
        State::new(),
        Command::CreateService {
            service_id: service_id(2),
            spec,
            now: ts(0),
        },
    )
    .unwrap_err();
    assert_eq!(err, KernelError::UnknownSecret("db-password".into()));
}

#[test_case::test_case(vec![] ; "no steps")]
#[test_case::test_case(vec![10, 50] ; "does not end at 100")]
#[test_case::test_case(vec![0, 100] ; "zero step")]
#[test_case::test_case(vec![10, 101] ; "over 100")]
fn canary_steps_validated(steps: Vec<u8>) {
    let mut spec = ServiceSpec::replicated("web", "nginx:1.25", 10);
    spec.deploy.strategy = DeployStrategy::Canary { steps };

    let err = apply_committed(
        State::new(),
        Command::CreateService {
            service_id: service_id(3),
            spec,
            now: ts(0),
        },
    )
    .unwrap_err();
    assert!(matches!(err, KernelError::InvalidService(_)));
}

// ============================================================================
// Containers
// ============================================================================

#[test]
fn container_requires_service_and_node() {
    let state = state_with_service(ServiceSpec::replicated("web", "nginx:1.25", 1));

    let orphan = container(1, service_id(42), node_id(1), 1);
    let err = apply_committed(
        state.clone(),
        Command::UpsertContainer { container: orphan },
    )
    .unwrap_err();
    assert_eq!(err, KernelError::ServiceNotFound(service_id(42)));

    let stray = container(1, service_id(9), node_id(42), 1);
    let err = apply_committed(state, Command::UpsertContainer { container: stray }).unwrap_err();
    assert_eq!(err, KernelError::NodeNotFound(node_id(42)));
}

#[test]
fn container_placement_honors_volume_affinity() {
    let state = apply(State::new(), Command::UpsertNode { node: worker(1) });
    let state = apply(state, Command::UpsertNode { node: worker(2) });
    let state = apply(
        state,
        Command::UpsertVolume {
            volume: Volume {
                id: VolumeId::from_bytes([5; 16]),
                name: "data".into(),
                driver: VolumeDriver::Local,
                affinity: Some(node_id(2)),
                options: BTreeMap::new(),
                created: ts(0),
            },
        },
    );
    let mut spec = ServiceSpec::replicated("db", "postgres:16", 1);
    spec.volumes.push(VolumeRef {
        source: "data".into(),
        target: "/var/lib/postgresql/data".into(),
    });
    let state = apply(
        state,
        Command::CreateService {
            service_id: service_id(9),
            spec: spec.clone(),
            now: ts(0),
        },
    );

    let mut misplaced = container(1, service_id(9), node_id(1), 1);
    misplaced.spec = spec.container_spec();
    let err =
        apply_committed(state.clone(), Command::UpsertContainer { container: misplaced })
            .unwrap_err();
    assert!(matches!(err, KernelError::VolumeAffinityViolation { .. }));

    let mut placed = container(1, service_id(9), node_id(2), 1);
    placed.spec = spec.container_spec();
    let state = apply(state, Command::UpsertContainer { container: placed });
    assert_eq!(state.containers_for_service(service_id(9)).len(), 1);
}

#[test]
fn worker_reports_update_actual_and_health() {
    let state = state_with_service(ServiceSpec::replicated("web", "nginx:1.25", 1));
    let state = apply(
        state,
        Command::UpsertContainer {
            container: container(1, service_id(9), node_id(1), 1),
        },
    );

    let state = apply(
        state,
        Command::SetContainerActualState {
            container_id: container_id(1),
            actual: ActualState::Running,
            runtime_handle: Some("runc-abc123".into()),
            now: ts(100),
        },
    );
    let c = state.get_container(&container_id(1)).unwrap();
    assert_eq!(c.actual, ActualState::Running);
    assert_eq!(c.runtime_handle.as_deref(), Some("runc-abc123"));

    let state = apply(
        state,
        Command::SetContainerHealth {
            container_id: container_id(1),
            health: ContainerHealth {
                state: HealthState::Healthy,
                failing_streak: 0,
                passing_streak: 2,
                unhealthy_since: None,
            },
            now: ts(200),
        },
    );
    assert_eq!(
        state.get_container(&container_id(1)).unwrap().health.state,
        HealthState::Healthy
    );
}

// ============================================================================
// Secrets & volumes
// ============================================================================

#[test]
fn secret_in_use_cannot_be_deleted() {
    let state = apply(
        State::new(),
        Command::UpsertSecret {
            secret: Secret {
                id: SecretId::from_bytes([8; 16]),
                name: "db-password".into(),
                ciphertext: Bytes::from_static(b"\x01\x02"),
                created: ts(0),
            },
        },
    );
    let mut spec = ServiceSpec::replicated("api", "api:1", 1);
    spec.secrets.push(SecretRef {
        source: "db-password".into(),
        target: "db_password".into(),
    });
    let state = apply(
        state,
        Command::CreateService {
            service_id: service_id(1),
            spec,
            now: ts(0),
        },
    );

    let err = apply_committed(
        state.clone(),
        Command::DeleteSecret {
            secret_id: SecretId::from_bytes([8; 16]),
        },
    )
    .unwrap_err();
    assert!(matches!(err, KernelError::SecretInUse { .. }));

    let state = apply(state, Command::DeleteService { service_id: service_id(1) });
    let state = apply(
        state,
        Command::DeleteSecret {
            secret_id: SecretId::from_bytes([8; 16]),
        },
    );
    assert!(state.secret_by_name("db-password").is_none());
}

#[test]
fn volume_binding_is_monotonic() {
    let state = apply(State::new(), Command::UpsertNode { node: worker(1) });
    let state = apply(state, Command::UpsertNode { node: worker(2) });
    let state = apply(
        state,
        Command::UpsertVolume {
            volume: Volume {
                id: VolumeId::from_bytes([5; 16]),
                name: "data".into(),
                driver: VolumeDriver::Local,
                affinity: None,
                options: BTreeMap::new(),
                created: ts(0),
            },
        },
    );

    let state = apply(
        state,
        Command::BindVolume {
            volume_id: VolumeId::from_bytes([5; 16]),
            node_id: node_id(1),
        },
    );
    assert_eq!(
        state.get_volume(&VolumeId::from_bytes([5; 16])).unwrap().affinity,
        Some(node_id(1))
    );

    // Re-binding to the same node is idempotent; another node is an error.
    let state = apply(
        state,
        Command::BindVolume {
            volume_id: VolumeId::from_bytes([5; 16]),
            node_id: node_id(1),
        },
    );
    let err = apply_committed(
        state,
        Command::BindVolume {
            volume_id: VolumeId::from_bytes([5; 16]),
            node_id: node_id(2),
        },
    )
    .unwrap_err();
    assert!(matches!(err, KernelError::VolumeRebind { .. }));
}

// ============================================================================
// Join tokens
// ============================================================================

#[test]
fn token_consume_and_sweep() {
    let token = JoinToken {
        id: TokenId::from_bytes([3; 16]),
        role: NodeRole::Worker,
        secret_hash: [0; 32],
        expires: ts(60_000),
        single_use: true,
        used: false,
        created: ts(0),
    };
    let state = apply(State::new(), Command::PutJoinToken { token });

    let state = apply(
        state,
        Command::ConsumeJoinToken {
            token_id: TokenId::from_bytes([3; 16]),
            now: ts(1_000),
        },
    );
    // Single-use token cannot be consumed twice.
    let err = apply_committed(
        state.clone(),
        Command::ConsumeJoinToken {
            token_id: TokenId::from_bytes([3; 16]),
            now: ts(2_000),
        },
    )
    .unwrap_err();
    assert_eq!(err, KernelError::TokenExpired(TokenId::from_bytes([3; 16])));

    let state = apply(state, Command::SweepTokens { now: ts(120_000) });
    assert!(state.tokens().is_empty());
}

// ============================================================================
// Batches
// ============================================================================

#[test]
fn batch_applies_in_order() {
    let state = apply(State::new(), Command::UpsertNode { node: worker(1) });
    let state = apply(
        state,
        Command::Batch(vec![
            Command::CreateService {
                service_id: service_id(9),
                spec: ServiceSpec::replicated("web", "nginx:1.25", 2),
                now: ts(0),
            },
            Command::UpsertContainer {
                container: container(1, service_id(9), node_id(1), 1),
            },
            Command::UpsertContainer {
                container: container(2, service_id(9), node_id(1), 2),
            },
        ]),
    );
    assert_eq!(state.containers_for_service(service_id(9)).len(), 2);
}

#[test]
fn batch_rejects_whole_tick_on_error() {
    let state = apply(State::new(), Command::UpsertNode { node: worker(1) });
    let err = apply_committed(
        state,
        Command::Batch(vec![
            Command::CreateService {
                service_id: service_id(9),
                spec: ServiceSpec::replicated("web", "nginx:1.25", 2),
                now: ts(0),
            },
            // Unknown node: the whole batch must be rejected.
            Command::UpsertContainer {
                container: container(1, service_id(9), node_id(99), 1),
            },
        ]),
    )
    .unwrap_err();
    assert_eq!(err, KernelError::NodeNotFound(node_id(99)));
}

// ============================================================================
// Snapshot laws
// ============================================================================

#[test]
fn snapshot_round_trip_is_byte_stable() {
    let state = state_with_service(ServiceSpec::replicated("web", "nginx:1.25", 3));
    let state = apply(
        state,
        Command::UpsertContainer {
            container: container(1, service_id(9), node_id(1), 1),
        },
    );

    let bytes = postcard::to_allocvec(&state).unwrap();
    let restored: State = postcard::from_bytes(&bytes).unwrap();
    assert_eq!(restored, state);

    let bytes_again = postcard::to_allocvec(&restored).unwrap();
    assert_eq!(bytes, bytes_again);
}
