//! Per-service planning: steady state, rolling, blue/green, canary, global.

use std::collections::BTreeSet;

use warren_kernel::{Command, State};
use warren_types::{
    Container, ContainerHealth, DeployStrategy, DesiredState, ActualState, IdGen, RollingSpec,
    RolloutState, Service, ServiceMode, Timestamp,
};

use crate::select::{select_node, PendingBinds};
use crate::{Plan, ScheduleFailure};

pub(crate) fn plan_service(
    state: &State,
    svc: &Service,
    now: Timestamp,
    ids: &mut dyn IdGen,
    binds: &mut PendingBinds,
    plan: &mut Plan,
) {
    let containers = state.containers_for_service(svc.id);
    let active: Vec<&Container> = containers
        .iter()
        .copied()
        .filter(|c| c.is_active())
        .collect();

    match svc.spec.mode {
        ServiceMode::Global => plan_global(state, svc, &containers, now, ids, plan),
        ServiceMode::Replicated { replicas } => {
            // Indices outside 1..=replicas are surplus regardless of
            // version or rollout phase: scale-down mid-rollout, or
            // node-bound leftovers from a mode switch.
            for c in &active {
                if c.replica > replicas || c.replica == 0 {
                    shutdown(plan, c, now);
                }
            }
            let in_range: Vec<&Container> = active
                .iter()
                .copied()
                .filter(|c| (1..=replicas).contains(&c.replica))
                .collect();

            match (&svc.rollout, &svc.spec.deploy.strategy) {
                (Some(rollout), DeployStrategy::Rolling(rolling)) => plan_rolling(
                    state, svc, replicas, *rolling, rollout, &in_range, now, ids, binds, plan,
                ),
                (Some(rollout), DeployStrategy::BlueGreen) => plan_blue_green(
                    state, svc, replicas, rollout, &in_range, now, ids, binds, plan,
                ),
                (Some(rollout), DeployStrategy::Canary { steps }) => plan_canary(
                    state, svc, replicas, steps, rollout, &in_range, now, ids, binds, plan,
                ),
                (None, _) => {
                    plan_steady(state, svc, replicas, &containers, &in_range, now, ids, binds, plan);
                }
            }
        }
    }
}

// ============================================================================
// Steady state
// ============================================================================

/// No rollout in flight: drain strays, fill missing indices at the active
/// version, one container per index.
#[allow(clippy::too_many_arguments)]
fn plan_steady(
    state: &State,
    svc: &Service,
    replicas: u32,
    all: &[&Container],
    active: &[&Container],
    now: Timestamp,
    ids: &mut dyn IdGen,
    binds: &mut PendingBinds,
    plan: &mut Plan,
) {
    let mut seen_indices: BTreeSet<u32> = BTreeSet::new();
    for c in active {
        if c.version != svc.version {
            // Leftovers from a completed or rolled-back update.
            shutdown(plan, c, now);
        } else if !seen_indices.insert(c.replica) {
            // Duplicate index from a replacement race; drain the extra.
            shutdown(plan, c, now);
        }
    }

    // Refill conservatively: an index is busy while *any* non-terminal
    // container of this service still holds it, so a draining stray is
    // fully stopped before its replacement starts (host ports).
    let busy: BTreeSet<u32> = all
        .iter()
        .filter(|c| !c.actual.is_terminal())
        .map(|c| c.replica)
        .collect();

    for replica in 1..=replicas {
        if !busy.contains(&replica) {
            create_container(state, svc, svc.version, replica, now, ids, binds, plan);
        }
    }
}

// ============================================================================
// Rolling
// ============================================================================

/// Health-gated batch replacement with surge and availability floors.
#[allow(clippy::too_many_arguments)]
fn plan_rolling(
    state: &State,
    svc: &Service,
    replicas: u32,
    rolling: RollingSpec,
    rollout: &RolloutState,
    active: &[&Container],
    now: Timestamp,
    ids: &mut dyn IdGen,
    binds: &mut PendingBinds,
    plan: &mut Plan,
) {
    let (new, old) = split_by_version(active, svc.version);
    let d = replicas as usize;

    let new_available = new.iter().filter(|c| c.is_available()).count();
    let old_available = old.iter().filter(|c| c.is_available()).count();

    // Next batch only after the previous one is fully available and has
    // held for the stability window (the reconciler stamps stable_since).
    let gate_open = new.is_empty()
        || (new.len() == new_available && stability_elapsed(svc, rollout, now));
    if gate_open {
        let surge_budget = (d + rolling.max_surge as usize).saturating_sub(active.len());
        let create_n = (rolling.parallelism as usize)
            .min(d.saturating_sub(new.len()))
            .min(surge_budget);
        create_at_free_indices(
            state, svc, replicas, &new, create_n, now, ids, binds, plan,
        );
    }

    // Stop old containers only while the availability floor holds.
    let floor = d.saturating_sub(rolling.max_unavailable as usize);
    let stop_n = (new_available + old_available)
        .saturating_sub(floor)
        .min(old.len());
    stop_highest(&old, stop_n, now, plan);
}

// ============================================================================
// Blue/green
// ============================================================================

/// Build the full new set next to the old one; flip once it is entirely
/// available and has held the stability window.
#[allow(clippy::too_many_arguments)]
fn plan_blue_green(
    state: &State,
    svc: &Service,
    replicas: u32,
    rollout: &RolloutState,
    active: &[&Container],
    now: Timestamp,
    ids: &mut dyn IdGen,
    binds: &mut PendingBinds,
    plan: &mut Plan,
) {
    let (new, old) = split_by_version(active, svc.version);
    let d = replicas as usize;

    let missing = d.saturating_sub(new.len());
    create_at_free_indices(state, svc, replicas, &new, missing, now, ids, binds, plan);

    let green_ready = new.len() == d
        && new.iter().all(|c| c.is_available())
        && stability_elapsed(svc, rollout, now);
    if green_ready {
        for c in &old {
            shutdown(plan, c, now);
        }
    }
}

// ============================================================================
// Canary
// ============================================================================

/// Realize the current step's replica ratio; the reconciler advances the
/// step (or rolls back) after watching the stability window.
#[allow(clippy::too_many_arguments)]
fn plan_canary(
    state: &State,
    svc: &Service,
    replicas: u32,
    steps: &[u8],
    rollout: &RolloutState,
    active: &[&Container],
    now: Timestamp,
    ids: &mut dyn IdGen,
    binds: &mut PendingBinds,
    plan: &mut Plan,
) {
    let (new, old) = split_by_version(active, svc.version);
    let d = replicas as usize;

    let step = (rollout.step as usize).min(steps.len().saturating_sub(1));
    let pct = usize::from(steps[step]);
    let target_new = (d * pct).div_ceil(100).min(d);
    let keep_old = d - target_new;

    let create_n = target_new.saturating_sub(new.len());
    create_at_free_indices(state, svc, replicas, &new, create_n, now, ids, binds, plan);

    if old.len() > keep_old {
        stop_highest(&old, old.len() - keep_old, now, plan);
    }
}

// ============================================================================
// Global
// ============================================================================

/// One container per ready worker. Updates drain the old container on a
/// node first, then start the new version (no overlapping host ports).
fn plan_global(
    state: &State,
    svc: &Service,
    containers: &[&Container],
    now: Timestamp,
    ids: &mut dyn IdGen,
    plan: &mut Plan,
) {
    for node in state.nodes().values() {
        if !node.is_schedulable() {
            continue;
        }
        let on_node: Vec<&Container> = containers
            .iter()
            .copied()
            .filter(|c| c.node_id == node.id && !c.actual.is_terminal())
            .collect();

        if on_node.is_empty() {
            if let Some(reason) = global_volume_conflict(state, svc, node.id) {
                plan.failures.push(ScheduleFailure {
                    service_id: svc.id,
                    service_name: svc.spec.name.clone(),
                    replica: 0,
                    reason,
                });
                continue;
            }
            push_create(svc, svc.version, 0, node.id, now, ids, plan);
        } else {
            for c in on_node {
                if c.version != svc.version && c.desired == DesiredState::Running {
                    shutdown(plan, c, now);
                }
            }
        }
    }

    // Containers whose node left or went unready are drained; a node-bound
    // service has nowhere else to put them.
    for c in containers {
        if c.actual.is_terminal() || c.desired == DesiredState::Shutdown {
            continue;
        }
        let schedulable = state
            .get_node(&c.node_id)
            .is_some_and(warren_types::Node::is_schedulable);
        if !schedulable {
            shutdown(plan, c, now);
        }
    }
}

/// Global placements are node-fixed, so a volume bound elsewhere is a
/// scheduling failure rather than a select problem.
fn global_volume_conflict(state: &State, svc: &Service, node: warren_types::NodeId) -> Option<String> {
    for volume_ref in &svc.spec.volumes {
        let volume = state.volume_by_name(&volume_ref.source)?;
        if let Some(bound) = volume.affinity {
            if bound != node {
                return Some(format!(
                    "volume '{}' is bound to node {bound}",
                    volume.name
                ));
            }
        }
    }
    None
}

// ============================================================================
// Shared helpers
// ============================================================================

fn split_by_version<'a>(
    active: &[&'a Container],
    version: u64,
) -> (Vec<&'a Container>, Vec<&'a Container>) {
    active.iter().copied().partition(|c| c.version == version)
}

/// True once the rollout batch has been stable long enough to proceed.
fn stability_elapsed(svc: &Service, rollout: &RolloutState, now: Timestamp) -> bool {
    let window = svc.spec.deploy.stability_ms;
    if window == 0 {
        return true;
    }
    rollout
        .stable_since
        .is_some_and(|since| now.millis_since(since) >= window)
}

/// Creates up to `count` new-version containers at the smallest indices in
/// `1..=replicas` not already taken by a new-version container.
#[allow(clippy::too_many_arguments)]
fn create_at_free_indices(
    state: &State,
    svc: &Service,
    replicas: u32,
    new: &[&Container],
    count: usize,
    now: Timestamp,
    ids: &mut dyn IdGen,
    binds: &mut PendingBinds,
    plan: &mut Plan,
) {
    if count == 0 {
        return;
    }
    let used: BTreeSet<u32> = new.iter().map(|c| c.replica).collect();
    let mut created = 0;
    for replica in 1..=replicas {
        if created == count {
            break;
        }
        if !used.contains(&replica) {
            create_container(state, svc, svc.version, replica, now, ids, binds, plan);
            created += 1;
        }
    }
}

/// Marks the `count` highest-index containers for shutdown.
fn stop_highest(containers: &[&Container], count: usize, now: Timestamp, plan: &mut Plan) {
    let mut sorted: Vec<&&Container> = containers.iter().collect();
    sorted.sort_by_key(|c| (std::cmp::Reverse(c.replica), c.id));
    for c in sorted.into_iter().take(count) {
        shutdown(plan, c, now);
    }
}

fn shutdown(plan: &mut Plan, container: &Container, now: Timestamp) {
    plan.commands.push(Command::SetContainerDesired {
        container_id: container.id,
        desired: DesiredState::Shutdown,
        now,
    });
}

/// Selects a node and emits the bind + create commands, or records a
/// scheduling failure. Never emits a command the kernel would reject.
#[allow(clippy::too_many_arguments)]
fn create_container(
    state: &State,
    svc: &Service,
    version: u64,
    replica: u32,
    now: Timestamp,
    ids: &mut dyn IdGen,
    binds: &mut PendingBinds,
    plan: &mut Plan,
) {
    match select_node(state, svc, binds, &[]) {
        Ok((node_id, newly_bound)) => {
            for volume_id in newly_bound {
                plan.commands.push(Command::BindVolume { volume_id, node_id });
            }
            push_create(svc, version, replica, node_id, now, ids, plan);
        }
        Err(err) => plan.failures.push(ScheduleFailure {
            service_id: svc.id,
            service_name: svc.spec.name.clone(),
            replica,
            reason: err.to_string(),
        }),
    }
}

fn push_create(
    svc: &Service,
    version: u64,
    replica: u32,
    node_id: warren_types::NodeId,
    now: Timestamp,
    ids: &mut dyn IdGen,
    plan: &mut Plan,
) {
    plan.commands.push(Command::UpsertContainer {
        container: Container {
            id: ids.container_id(),
            service_id: svc.id,
            node_id,
            replica,
            version,
            spec: svc.spec.container_spec(),
            desired: DesiredState::Running,
            actual: ActualState::Pending,
            health: ContainerHealth::default(),
            runtime_handle: None,
            created: now,
            updated: now,
        },
    });
}
