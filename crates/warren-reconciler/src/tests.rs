//! Reconciler tests: liveness, replacement, rollout progression, GC.

use std::collections::BTreeMap;

use warren_kernel::{apply_committed, Command, State};
use warren_types::{
    ActualState, Container, ContainerHealth, ContainerId, DeployStrategy, DesiredState,
    HealthCheck, HealthState, Node, NodeId, NodeResources, NodeRole, NodeStatus, RolloutState,
    SeqIdGen, ServiceId, ServiceSpec, Timestamp,
};

use crate::{reconcile, ReconcileLimits};

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

fn worker(n: u8, heartbeat_ms: u64) -> Node {
    Node {
        id: node_id(n),
        role: NodeRole::Worker,
        addr: format!("10.0.0.{n}:7946"),
        hostname: format!("edge-{n}"),
        arch: "x86_64".into(),
        os: "linux".into(),
        labels: BTreeMap::new(),
        resources: NodeResources::default(),
        status: NodeStatus::Ready,
        last_heartbeat: ts(heartbeat_ms),
        created: ts(0),
    }
}

fn apply(state: State, cmd: Command) -> State {
    apply_committed(state, cmd).expect("apply failed").0
}

fn apply_all(mut state: State, commands: &[Command]) -> State {
    for cmd in commands {
        state = apply(state, cmd.clone());
    }
    state
}

fn running_container(n: u8, service: ServiceId, node: NodeId, replica: u32) -> Container {
    Container {
        id: container_id(n),
        service_id: service,
        node_id: node,
        replica,
        version: 1,
        spec: ServiceSpec::replicated("web", "nginx:1.25", 2).container_spec(),
        desired: DesiredState::Running,
        actual: ActualState::Running,
        health: ContainerHealth::default(),
        runtime_handle: Some(format!("runc-{n}")),
        created: ts(0),
        updated: ts(0),
    }
}

fn base_state(replicas: u32) -> State {
    let state = apply(State::new(), Command::UpsertNode { node: worker(1, 0) });
    let state = apply(state, Command::UpsertNode { node: worker(2, 0) });
    apply(
        state,
        Command::CreateService {
            service_id: service_id(9),
            spec: ServiceSpec::replicated("web", "nginx:1.25", replicas),
            now: ts(0),
        },
    )
}

// ============================================================================
// Node liveness
// ============================================================================

#[test]
fn silent_worker_is_marked_down_after_threshold() {
    let limits = ReconcileLimits::default();
    let state = base_state(2);

    // Inside the threshold: nothing happens.
    let plan = reconcile(&state, ts(19_000), limits, &mut SeqIdGen::default());
    assert!(plan.commands.is_empty());

    // Past it: the worker goes down.
    let plan = reconcile(&state, ts(21_000), limits, &mut SeqIdGen::default());
    let state = apply_all(state, &plan.commands);
    assert_eq!(state.get_node(&node_id(1)).unwrap().status, NodeStatus::Down);
    assert_eq!(state.get_node(&node_id(2)).unwrap().status, NodeStatus::Down);
}

#[test]
fn heartbeats_keep_a_worker_ready() {
    let limits = ReconcileLimits::default();
    let mut state = base_state(2);
    state = apply(
        state,
        Command::NodeHeartbeat {
            node_id: node_id(1),
            now: ts(30_000),
            resources: None,
        },
    );

    let plan = reconcile(&state, ts(35_000), limits, &mut SeqIdGen::default());
    let state = apply_all(state, &plan.commands);
    assert_eq!(state.get_node(&node_id(1)).unwrap().status, NodeStatus::Ready);
    assert_eq!(state.get_node(&node_id(2)).unwrap().status, NodeStatus::Down);
}

// ============================================================================
// Replacement
// ============================================================================

#[test]
fn down_node_container_is_replaced_on_the_survivor() {
    let limits = ReconcileLimits::default();
    let mut state = base_state(2);
    state = apply(
        state,
        Command::UpsertContainer {
            container: running_container(1, service_id(9), node_id(1), 1),
        },
    );
    state = apply(
        state,
        Command::UpsertContainer {
            container: running_container(2, service_id(9), node_id(2), 2),
        },
    );
    // W2 keeps heartbeating; W1 goes silent.
    state = apply(
        state,
        Command::NodeHeartbeat {
            node_id: node_id(2),
            now: ts(25_000),
            resources: None,
        },
    );

    let plan = reconcile(&state, ts(25_000), limits, &mut SeqIdGen::default());
    let state = apply_all(state, &plan.commands);

    // W1 is down, its container is draining, and a replacement with the
    // same replica index landed on W2.
    assert_eq!(state.get_node(&node_id(1)).unwrap().status, NodeStatus::Down);
    assert_eq!(
        state.get_container(&container_id(1)).unwrap().desired,
        DesiredState::Shutdown
    );
    let replacements: Vec<_> = state
        .containers_for_service(service_id(9))
        .into_iter()
        .filter(|c| c.replica == 1 && c.desired == DesiredState::Running)
        .map(|c| c.node_id)
        .collect();
    assert_eq!(replacements, vec![node_id(2)]);
}

#[test]
fn failed_container_is_drained_and_replaced_once() {
    let limits = ReconcileLimits::default();
    let mut state = base_state(1);
    keep_alive(&mut state, ts(5_000));
    state = apply(
        state,
        Command::UpsertContainer {
            container: running_container(1, service_id(9), node_id(1), 1),
        },
    );
    state = apply(
        state,
        Command::SetContainerActualState {
            container_id: container_id(1),
            actual: ActualState::Failed,
            runtime_handle: None,
            now: ts(6_000),
        },
    );

    let plan = reconcile(&state, ts(7_000), limits, &mut SeqIdGen::default());
    let state = apply_all(state, &plan.commands);

    let containers = state.containers_for_service(service_id(9));
    assert_eq!(containers.len(), 2);
    let live: Vec<_> = containers
        .iter()
        .filter(|c| c.desired == DesiredState::Running && !c.actual.is_terminal())
        .collect();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].replica, 1);

    // A second tick changes nothing more (the replacement covers the index).
    let plan = reconcile(&state, ts(8_000), limits, &mut SeqIdGen::default());
    for cmd in &plan.commands {
        assert!(
            !matches!(cmd, Command::UpsertContainer { .. }),
            "no duplicate replacement: {cmd:?}"
        );
    }
}

#[test]
fn unhealthy_container_is_replaced_after_grace_never_to_zero() {
    let limits = ReconcileLimits::default();
    let mut state = base_state(1);
    keep_alive(&mut state, ts(5_000));
    let mut probed = running_container(1, service_id(9), node_id(1), 1);
    probed.spec.healthcheck = Some(HealthCheck::http("/health", 8080));
    state = apply(state, Command::UpsertContainer { container: probed });
    state = apply(
        state,
        Command::SetContainerHealth {
            container_id: container_id(1),
            health: ContainerHealth {
                state: HealthState::Unhealthy,
                failing_streak: 3,
                passing_streak: 0,
                unhealthy_since: Some(ts(6_000)),
            },
            now: ts(6_000),
        },
    );

    // Within grace: leave it alone.
    let plan = reconcile(&state, ts(10_000), limits, &mut SeqIdGen::default());
    assert!(!plan
        .commands
        .iter()
        .any(|c| matches!(c, Command::SetContainerDesired { .. })));

    // Past grace: drain and replace. The service never converges to zero.
    let plan = reconcile(&state, ts(17_000), limits, &mut SeqIdGen::default());
    let state = apply_all(state, &plan.commands);
    let live = state
        .containers_for_service(service_id(9))
        .into_iter()
        .filter(|c| c.desired == DesiredState::Running)
        .count();
    assert_eq!(live, 1);
}

/// Keeps both workers heartbeating so liveness stays out of the way.
fn keep_alive(state: &mut State, now: Timestamp) {
    for n in [1, 2] {
        *state = apply(
            std::mem::take(state),
            Command::NodeHeartbeat {
                node_id: node_id(n),
                now,
                resources: None,
            },
        );
    }
}

// ============================================================================
// Garbage collection
// ============================================================================

#[test]
fn orphans_and_drained_containers_are_deleted() {
    let limits = ReconcileLimits::default();
    let mut state = base_state(2);
    keep_alive(&mut state, ts(1_000));
    state = apply(
        state,
        Command::UpsertContainer {
            container: running_container(1, service_id(9), node_id(1), 1),
        },
    );
    let mut drained = running_container(2, service_id(9), node_id(2), 2);
    drained.desired = DesiredState::Shutdown;
    drained.actual = ActualState::Stopped;
    state = apply(state, Command::UpsertContainer { container: drained });

    // Delete the service: every remaining container is an orphan.
    state = apply(state, Command::DeleteService { service_id: service_id(9) });

    let plan = reconcile(&state, ts(2_000), limits, &mut SeqIdGen::default());
    let state = apply_all(state, &plan.commands);
    assert!(state.containers().is_empty());
}

// ============================================================================
// Rollout progression
// ============================================================================

fn rollout_state(step: u32, stable_since: Option<Timestamp>) -> RolloutState {
    RolloutState {
        target_version: 2,
        prev_version: 1,
        step,
        stable_since,
        started: ts(10_000),
    }
}

/// Service mid-update with `new_running` v2 containers already available.
fn canary_state(replicas: u32, steps: Vec<u8>, new_running: u8) -> State {
    let mut state = base_state(replicas);
    keep_alive(&mut state, ts(10_000));
    let mut spec = ServiceSpec::replicated("web", "nginx:1.26", replicas);
    spec.deploy.strategy = DeployStrategy::Canary { steps };
    state = apply(
        state,
        Command::UpdateService {
            service_id: service_id(9),
            spec,
            now: ts(10_000),
        },
    );
    for n in 0..new_running {
        let mut c = running_container(100 + n, service_id(9), node_id(1), u32::from(n) + 1);
        c.version = 2;
        state = apply(state, Command::UpsertContainer { container: c });
    }
    state
}

#[test]
fn stability_clock_is_stamped_once_batch_is_available() {
    let limits = ReconcileLimits::default();
    // 10% of 10 replicas: the single canary is up.
    let state = canary_state(10, vec![10, 100], 1);

    let plan = reconcile(&state, ts(12_000), limits, &mut SeqIdGen::default());
    let state = apply_all(state, &plan.commands);
    let rollout = state.get_service(&service_id(9)).unwrap().rollout.unwrap();
    assert_eq!(rollout.stable_since, Some(ts(12_000)));
    assert_eq!(rollout.step, 0);
}

#[test]
fn canary_advances_a_step_after_the_window() {
    let limits = ReconcileLimits::default();
    let state = canary_state(10, vec![10, 100], 1);
    let state = apply(
        state,
        Command::SetServiceRollout {
            service_id: service_id(9),
            rollout: Some(rollout_state(0, Some(ts(12_000)))),
            now: ts(12_000),
        },
    );

    // Default stability window is 10 s.
    let plan = reconcile(&state, ts(23_000), limits, &mut SeqIdGen::default());
    let state = apply_all(state, &plan.commands);
    let rollout = state.get_service(&service_id(9)).unwrap().rollout.unwrap();
    assert_eq!(rollout.step, 1);
    assert_eq!(rollout.stable_since, None);
}

#[test]
fn rollout_completes_when_only_the_new_version_remains() {
    let limits = ReconcileLimits::default();
    // Final step, all 2 replicas on v2, no v1 actives left.
    let state = canary_state(2, vec![50, 100], 2);
    let state = apply(
        state,
        Command::SetServiceRollout {
            service_id: service_id(9),
            rollout: Some(rollout_state(1, Some(ts(12_000)))),
            now: ts(12_000),
        },
    );

    let plan = reconcile(&state, ts(23_000), limits, &mut SeqIdGen::default());
    let state = apply_all(state, &plan.commands);
    assert!(state.get_service(&service_id(9)).unwrap().rollout.is_none());
}

#[test]
fn casualties_past_threshold_trigger_automatic_rollback() {
    let limits = ReconcileLimits::default();
    let state = canary_state(10, vec![10, 100], 1);
    // The canary crashes.
    let state = apply(
        state,
        Command::SetContainerActualState {
            container_id: container_id(100),
            actual: ActualState::Failed,
            runtime_handle: None,
            now: ts(13_000),
        },
    );

    let plan = reconcile(&state, ts(14_000), limits, &mut SeqIdGen::default());
    let state = apply_all(state, &plan.commands);

    let service = state.get_service(&service_id(9)).unwrap();
    assert_eq!(service.version, 1, "active version reverted");
    assert_eq!(service.spec.image, "nginx:1.25");
    assert!(service.rollout.is_none());
}
