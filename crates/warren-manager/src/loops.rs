//! Leader-only control loops.
//!
//! Each loop is an independent timer task. On every tick it first checks
//! leadership and otherwise does nothing; a follower's loops are armed but
//! inert, which makes leader handover free of task churn.
//!
//! Plans are proposed as a single `Command::Batch`, so one tick's decisions
//! apply atomically or not at all. A rejected batch is dropped, not
//! retried: the next tick replans from fresher state.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use warren_config::WarrenConfig;
use warren_kernel::Command;
use warren_reconciler::ReconcileLimits;
use warren_scheduler::Plan;
use warren_types::{RandomIdGen, Timestamp};

use crate::runtime::Gateway;

/// Spawns the scheduler, reconciler, and token-sweeper tasks.
pub fn spawn_control_loops(gateway: Gateway, config: &WarrenConfig) -> Vec<JoinHandle<()>> {
    let scheduler = {
        let gateway = gateway.clone();
        let tick = Duration::from_millis(config.scheduler.tick_ms);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if !gateway.leader().is_leader {
                    continue;
                }
                let state = gateway.state();
                let plan =
                    warren_scheduler::plan(&state, Timestamp::now(), &mut RandomIdGen);
                propose_plan(&gateway, plan, "scheduler").await;
            }
        })
    };

    let reconciler = {
        let gateway = gateway.clone();
        let tick = Duration::from_millis(config.reconciler.tick_ms);
        let limits = ReconcileLimits {
            down_threshold_ms: config.reconciler.down_threshold_ms,
            unhealthy_grace_ms: config.reconciler.unhealthy_grace_ms,
        };
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if !gateway.leader().is_leader {
                    continue;
                }
                let state = gateway.state();
                let plan = warren_reconciler::reconcile(
                    &state,
                    Timestamp::now(),
                    limits,
                    &mut RandomIdGen,
                );
                propose_plan(&gateway, plan, "reconciler").await;
            }
        })
    };

    let sweeper = {
        let gateway = gateway;
        let tick = Duration::from_millis(config.manager.token_sweep_ms);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if !gateway.leader().is_leader {
                    continue;
                }
                let now = Timestamp::now();
                let expired = gateway
                    .state()
                    .tokens()
                    .values()
                    .any(|t| t.expires <= now);
                if !expired {
                    continue;
                }
                if let Err(err) = gateway.propose(Command::SweepTokens { now }).await {
                    debug!(error = %err, "token sweep not applied");
                }
            }
        })
    };

    vec![scheduler, reconciler, sweeper]
}

async fn propose_plan(gateway: &Gateway, plan: Plan, loop_name: &str) {
    for failure in &plan.failures {
        warn!(
            service = %failure.service_name,
            replica = failure.replica,
            reason = %failure.reason,
            "placement failed; will retry next tick"
        );
    }
    if plan.commands.is_empty() {
        return;
    }

    let count = plan.commands.len();
    match gateway.propose(Command::Batch(plan.commands)).await {
        Ok(()) => debug!(loop_name, commands = count, "plan applied"),
        // Lost leadership mid-tick or planned over stale state; the next
        // tick recomputes from scratch.
        Err(err) => debug!(loop_name, error = %err, "plan dropped"),
    }
}
