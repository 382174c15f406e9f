//! Node selection for a new container.
//!
//! Policy, in order:
//! 1. candidates are worker nodes with status ready
//! 2. volume affinity filters: a bound volume pins the service to its node
//! 3. spread: fewest non-terminal containers for this service, then fewest
//!    total, then lexicographic node ID

use std::collections::BTreeMap;

use warren_kernel::State;
use warren_types::{NodeId, Service, VolumeId};

/// Volume bindings chosen earlier in the same planning tick. They are not
/// yet in the store but must constrain later placements identically.
#[derive(Debug, Default)]
pub struct PendingBinds {
    by_name: BTreeMap<String, NodeId>,
}

impl PendingBinds {
    pub fn get(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    pub fn record(&mut self, name: &str, node: NodeId) {
        self.by_name.insert(name.to_string(), node);
    }
}

/// Why no node could be selected.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectError {
    #[error("no ready worker nodes")]
    NoReadyWorkers,

    #[error("volume '{0}' is bound to a node that is not ready")]
    AffinityUnsatisfiable(String),

    #[error("volume '{0}' does not exist")]
    UnknownVolume(String),
}

/// Picks the node for one new container of `service`, and reports any
/// volume bindings the placement implies.
///
/// `excluded` carries nodes condemned earlier in the same planning tick
/// (the store still shows them ready). Deterministic: equal candidates
/// resolve by node ID.
pub fn select_node(
    state: &State,
    service: &Service,
    binds: &mut PendingBinds,
    excluded: &[NodeId],
) -> Result<(NodeId, Vec<VolumeId>), SelectError> {
    let mut candidates: Vec<NodeId> = state
        .nodes()
        .values()
        .filter(|n| n.is_schedulable() && !excluded.contains(&n.id))
        .map(|n| n.id)
        .collect();

    if candidates.is_empty() {
        return Err(SelectError::NoReadyWorkers);
    }

    // Volume affinity: every referenced volume must agree on the node.
    let mut unbound: Vec<(String, VolumeId)> = Vec::new();
    for volume_ref in &service.spec.volumes {
        let volume = state
            .volume_by_name(&volume_ref.source)
            .ok_or_else(|| SelectError::UnknownVolume(volume_ref.source.clone()))?;

        let pinned = volume.affinity.or_else(|| binds.get(&volume.name));
        match pinned {
            Some(node) => {
                candidates.retain(|c| *c == node);
                if candidates.is_empty() {
                    return Err(SelectError::AffinityUnsatisfiable(volume.name.clone()));
                }
            }
            None => unbound.push((volume.name.clone(), volume.id)),
        }
    }

    // Spread: fewest containers of this service, then fewest overall.
    let mut service_load: BTreeMap<NodeId, usize> = BTreeMap::new();
    let mut total_load: BTreeMap<NodeId, usize> = BTreeMap::new();
    for container in state.containers().values() {
        if container.actual.is_terminal() {
            continue;
        }
        *total_load.entry(container.node_id).or_default() += 1;
        if container.service_id == service.id {
            *service_load.entry(container.node_id).or_default() += 1;
        }
    }

    let chosen = candidates
        .into_iter()
        .min_by_key(|node| {
            (
                service_load.get(node).copied().unwrap_or(0),
                total_load.get(node).copied().unwrap_or(0),
                *node,
            )
        })
        .expect("candidates checked non-empty");

    // First placement binds any still-unbound volumes to the chosen node.
    let mut newly_bound = Vec::new();
    for (name, volume_id) in unbound {
        binds.record(&name, chosen);
        newly_bound.push(volume_id);
    }

    Ok((chosen, newly_bound))
}
