//! # warren-reconciler: the convergence planner
//!
//! Runs on the leader, slower than the scheduler, and owns the judgments
//! the scheduler deliberately doesn't make:
//!
//! 1. **node liveness** — heartbeat silence past the down threshold marks
//!    a worker down
//! 2. **replacement** — containers on down nodes, in terminal states, or
//!    unhealthy past the grace window are drained and re-placed
//! 3. **rollout progression** — stability-window bookkeeping, canary step
//!    advance, automatic rollback past the failure threshold
//! 4. **garbage collection** — orphaned containers and drained-and-stopped
//!    containers leave the store
//!
//! Like the scheduler it is a pure function of the store; the manager
//! proposes the returned commands as one batch. It never blocks on runtime
//! actions — stopping and starting containers is the workers' job.

#[cfg(test)]
mod tests;

use tracing::debug;
use warren_kernel::{Command, State};
use warren_scheduler::{select_node, PendingBinds, Plan, ScheduleFailure};
use warren_types::{
    ActualState, Container, ContainerHealth, DeployStrategy, DesiredState, HealthState, IdGen,
    NodeStatus, RolloutState, Service, ServiceMode, Timestamp,
};

/// Failure-detection thresholds, from the deployment profile.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileLimits {
    /// Heartbeat silence before a worker is marked down.
    pub down_threshold_ms: u64,
    /// How long a container may stay unhealthy before replacement.
    pub unhealthy_grace_ms: u64,
}

impl Default for ReconcileLimits {
    fn default() -> Self {
        Self {
            down_threshold_ms: 20_000,
            unhealthy_grace_ms: 10_000,
        }
    }
}

/// Computes one reconciliation tick over the whole store.
pub fn reconcile(
    state: &State,
    now: Timestamp,
    limits: ReconcileLimits,
    ids: &mut dyn IdGen,
) -> Plan {
    let mut plan = Plan::default();
    let mut binds = PendingBinds::default();

    mark_down_nodes(state, now, limits, &mut plan);
    replace_casualties(state, now, limits, ids, &mut binds, &mut plan);
    progress_rollouts(state, now, limits, &mut plan);
    collect_garbage(state, &mut plan);

    if !plan.is_empty() {
        debug!(
            commands = plan.commands.len(),
            failures = plan.failures.len(),
            "reconcile tick planned"
        );
    }
    plan
}

// ============================================================================
// 1. Node liveness
// ============================================================================

fn mark_down_nodes(state: &State, now: Timestamp, limits: ReconcileLimits, plan: &mut Plan) {
    for node in state.nodes().values() {
        if node.role != warren_types::NodeRole::Worker || node.status == NodeStatus::Down {
            continue;
        }
        // A node that joined but never heartbeated counts from its join.
        let last_seen = node.last_heartbeat.max(node.created);
        if now.millis_since(last_seen) > limits.down_threshold_ms {
            plan.commands.push(Command::SetNodeStatus {
                node_id: node.id,
                status: NodeStatus::Down,
            });
        }
    }
}

// ============================================================================
// 2. Replacement
// ============================================================================

fn replace_casualties(
    state: &State,
    now: Timestamp,
    limits: ReconcileLimits,
    ids: &mut dyn IdGen,
    binds: &mut PendingBinds,
    plan: &mut Plan,
) {
    // Node verdicts from this same tick apply immediately.
    let down_now: Vec<warren_types::NodeId> = plan
        .commands
        .iter()
        .filter_map(|cmd| match cmd {
            Command::SetNodeStatus {
                node_id,
                status: NodeStatus::Down,
            } => Some(*node_id),
            _ => None,
        })
        .collect();

    for container in state.containers().values() {
        if container.desired == DesiredState::Shutdown {
            continue; // already draining; GC picks it up once stopped
        }

        let node_gone = match state.get_node(&container.node_id) {
            Some(node) => node.status == NodeStatus::Down || down_now.contains(&node.id),
            None => true,
        };
        let dead = container.actual.is_terminal();
        let unhealthy_too_long = unhealthy_past_grace(&container.health, now, limits);

        if !(node_gone || dead || unhealthy_too_long) {
            continue;
        }

        plan.commands.push(Command::SetContainerDesired {
            container_id: container.id,
            desired: DesiredState::Shutdown,
            now,
        });

        if let Some(service) = state.get_service(&container.service_id) {
            if wants_replacement(state, service, container) {
                create_replacement(
                    state, service, container.replica, &down_now, now, ids, binds, plan,
                );
            }
        }
    }
}

fn unhealthy_past_grace(health: &ContainerHealth, now: Timestamp, limits: ReconcileLimits) -> bool {
    health.state == HealthState::Unhealthy
        && health
            .unhealthy_since
            .is_some_and(|since| now.millis_since(since) > limits.unhealthy_grace_ms)
}

/// The service still wants this replica, and nothing else serves it yet.
fn wants_replacement(state: &State, service: &Service, casualty: &Container) -> bool {
    // Global services are node-bound; the scheduler re-places them on the
    // surviving nodes. Stale versions are the rollout machinery's problem.
    let ServiceMode::Replicated { replicas } = service.spec.mode else {
        return false;
    };
    if casualty.version != service.version {
        return false;
    }
    if casualty.replica == 0 || casualty.replica > replicas {
        return false;
    }

    // Same replica index, already covered by a live container?
    !state.containers_for_service(service.id).iter().any(|c| {
        c.id != casualty.id
            && c.replica == casualty.replica
            && c.desired == DesiredState::Running
            && !c.actual.is_terminal()
    })
}

#[allow(clippy::too_many_arguments)]
fn create_replacement(
    state: &State,
    service: &Service,
    replica: u32,
    excluded: &[warren_types::NodeId],
    now: Timestamp,
    ids: &mut dyn IdGen,
    binds: &mut PendingBinds,
    plan: &mut Plan,
) {
    match select_node(state, service, binds, excluded) {
        Ok((node_id, newly_bound)) => {
            for volume_id in newly_bound {
                plan.commands.push(Command::BindVolume { volume_id, node_id });
            }
            plan.commands.push(Command::UpsertContainer {
                container: Container {
                    id: ids.container_id(),
                    service_id: service.id,
                    node_id,
                    replica,
                    version: service.version,
                    spec: service.spec.container_spec(),
                    desired: DesiredState::Running,
                    actual: ActualState::Pending,
                    health: ContainerHealth::default(),
                    runtime_handle: None,
                    created: now,
                    updated: now,
                },
            });
        }
        Err(err) => plan.failures.push(ScheduleFailure {
            service_id: service.id,
            service_name: service.spec.name.clone(),
            replica,
            reason: err.to_string(),
        }),
    }
}

// ============================================================================
// 3. Rollout progression
// ============================================================================

fn progress_rollouts(state: &State, now: Timestamp, limits: ReconcileLimits, plan: &mut Plan) {
    for service in state.services().values() {
        let Some(rollout) = &service.rollout else {
            continue;
        };
        let ServiceMode::Replicated { replicas } = service.spec.mode else {
            continue;
        };
        let d = replicas as usize;

        let containers = state.containers_for_service(service.id);
        let new_active: Vec<&&Container> = containers
            .iter()
            .filter(|c| c.is_active() && c.version == rollout.target_version)
            .collect();
        let old_active = containers
            .iter()
            .filter(|c| c.is_active() && c.version != rollout.target_version)
            .count();

        // Automatic rollback: too many casualties at the new version.
        let casualties = containers
            .iter()
            .filter(|c| {
                c.version == rollout.target_version
                    && (c.actual == ActualState::Failed
                        || unhealthy_past_grace(&c.health, now, limits))
            })
            .count();
        if service.spec.deploy.auto_rollback
            && service.previous.is_some()
            && casualties >= service.spec.deploy.failure_threshold as usize
        {
            plan.commands.push(Command::RollbackService {
                service_id: service.id,
                now,
            });
            continue;
        }

        // The batch the stability window watches.
        let batch_target = match &service.spec.deploy.strategy {
            DeployStrategy::Canary { steps } => {
                let step = (rollout.step as usize).min(steps.len().saturating_sub(1));
                (d * usize::from(steps[step])).div_ceil(100).min(d)
            }
            DeployStrategy::Rolling(_) | DeployStrategy::BlueGreen => d.min(new_active.len().max(1)),
        };
        let batch_ready =
            new_active.len() >= batch_target && new_active.iter().all(|c| c.is_available());

        // Stamp or reset the stability clock on transitions.
        match (batch_ready, rollout.stable_since) {
            (true, None) => {
                plan.commands.push(set_rollout(
                    service,
                    RolloutState {
                        stable_since: Some(now),
                        ..*rollout
                    },
                    now,
                ));
                continue;
            }
            (false, Some(_)) => {
                plan.commands.push(set_rollout(
                    service,
                    RolloutState {
                        stable_since: None,
                        ..*rollout
                    },
                    now,
                ));
                continue;
            }
            _ => {}
        }

        let window = service.spec.deploy.stability_ms;
        let stable_long_enough = batch_ready
            && (window == 0
                || rollout
                    .stable_since
                    .is_some_and(|since| now.millis_since(since) >= window));
        if !stable_long_enough {
            continue;
        }

        // Canary: advance to the next step.
        if let DeployStrategy::Canary { steps } = &service.spec.deploy.strategy {
            let next_step = rollout.step as usize + 1;
            if next_step < steps.len() {
                plan.commands.push(set_rollout(
                    service,
                    RolloutState {
                        step: next_step as u32,
                        stable_since: None,
                        ..*rollout
                    },
                    now,
                ));
                continue;
            }
        }

        // Completion: the full set runs the new version, the old is gone.
        if new_active.len() == d && old_active == 0 {
            plan.commands.push(Command::SetServiceRollout {
                service_id: service.id,
                rollout: None,
                now,
            });
        }
    }
}

fn set_rollout(service: &Service, rollout: RolloutState, now: Timestamp) -> Command {
    Command::SetServiceRollout {
        service_id: service.id,
        rollout: Some(rollout),
        now,
    }
}

// ============================================================================
// 4. Garbage collection
// ============================================================================

fn collect_garbage(state: &State, plan: &mut Plan) {
    for container in state.containers().values() {
        let orphaned = !state.service_exists(&container.service_id);
        let drained =
            container.desired == DesiredState::Shutdown && container.actual.is_terminal();
        if orphaned || drained {
            plan.commands.push(Command::DeleteContainer {
                container_id: container.id,
            });
        }
    }
}
