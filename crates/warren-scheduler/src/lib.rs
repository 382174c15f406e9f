//! # warren-scheduler: the placement planner
//!
//! [`plan`] is a pure function of the replicated state: given the store and
//! a wall-clock instant it produces the kernel commands that move the
//! container set toward every service's declared shape. The manager runs it
//! on the leader every few seconds and proposes the whole plan as one
//! atomic batch.
//!
//! Purity buys the two properties the control plane leans on:
//! - **idempotence**: replanning from the same state yields the same plan,
//!   so a duplicated tick or a lost batch is harmless
//! - **determinism**: all ordering and tie-breaks are total, so every
//!   manager would compute the identical plan
//!
//! The scheduler owns creation and shutdown *intent* only. It never
//! touches actual-state fields (the workers own those) and it never
//! deletes a running container (the reconciler garbage-collects once a
//! container is both shut down and stopped).

mod select;
mod service;


pub use select::{select_node, PendingBinds, SelectError};

use tracing::debug;
use warren_kernel::{Command, State};
use warren_types::{IdGen, ServiceId, Timestamp};

/// A planner tick's output: commands to propose plus placements that could
/// not be made this tick.
#[derive(Debug, Default)]
pub struct Plan {
    pub commands: Vec<Command>,
    pub failures: Vec<ScheduleFailure>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.failures.is_empty()
    }
}

/// A placement the scheduler declined to make rather than mis-place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleFailure {
    pub service_id: ServiceId,
    pub service_name: String,
    pub replica: u32,
    pub reason: String,
}

/// Computes one scheduling tick over the whole store.
pub fn plan(state: &State, now: Timestamp, ids: &mut dyn IdGen) -> Plan {
    let mut plan = Plan::default();
    // Volumes bound earlier in this tick constrain placements later in it.
    let mut binds = PendingBinds::default();

    for svc in state.services().values() {
        service::plan_service(state, svc, now, ids, &mut binds, &mut plan);
    }

    if !plan.is_empty() {
        debug!(
            commands = plan.commands.len(),
            failures = plan.failures.len(),
            "scheduling tick planned"
        );
    }
    plan
}
