//! The kernel - pure functional core of Warren's control plane.
//!
//! [`apply_committed`] applies one committed command to the state and
//! produces the new state plus effects. It is completely pure: no I/O, no
//! clocks, no randomness. This makes replicas deterministic and the whole
//! control plane easy to test.
//!
//! Invariants enforced here, at apply time:
//! - name uniqueness within each entity kind
//! - referential integrity: container→service, container→node,
//!   spec→secret, spec→volume
//! - volume affinity is monotonic while any referencing container exists
//! - desired state is written only by control-plane commands; actual state
//!   and health only by worker-report commands

use warren_types::{
    ClusterEvent, ContainerId, NodeId, NodeStatus, RolloutState, SecretId, ServiceId,
    ServiceMode, ServiceSpec, TokenId, VolumeId,
};

use crate::command::Command;
use crate::effects::Effect;
use crate::state::State;

/// Applies a committed command to the state, producing new state and effects.
///
/// Takes ownership of the state and returns the new one. On error the input
/// state has been consumed; callers keep a retained copy (the consensus
/// runtime applies from one) so a rejected command is a pure no-op.
#[allow(clippy::too_many_lines)]
pub fn apply_committed(state: State, cmd: Command) -> Result<(State, Vec<Effect>), KernelError> {
    let mut effects = Vec::new();

    match cmd {
        // ====================================================================
        // Cluster bootstrap
        // ====================================================================
        Command::InitCluster { meta } => {
            if state.cluster().is_some() {
                return Err(KernelError::ClusterAlreadyInitialized);
            }

            effects.push(Effect::Emit(ClusterEvent::ClusterInitialized {
                cluster_id: meta.cluster_id,
            }));
            Ok((state.with_cluster(meta), effects))
        }

        // ====================================================================
        // Nodes
        // ====================================================================
        Command::UpsertNode { node } => {
            if node.addr.is_empty() {
                return Err(KernelError::InvalidNode("empty address".into()));
            }

            effects.push(Effect::Emit(ClusterEvent::NodeUpdated { node_id: node.id }));
            Ok((state.with_node(node), effects))
        }

        Command::NodeHeartbeat {
            node_id,
            now,
            resources,
        } => {
            if !state.node_exists(&node_id) {
                return Err(KernelError::NodeNotFound(node_id));
            }

            let new_state = state.map_node(node_id, |node| {
                node.last_heartbeat = now;
                node.status = NodeStatus::Ready;
                if let Some(res) = resources {
                    node.resources = res;
                }
            });

            effects.push(Effect::Emit(ClusterEvent::NodeUpdated { node_id }));
            Ok((new_state, effects))
        }

        Command::SetNodeStatus { node_id, status } => {
            if !state.node_exists(&node_id) {
                return Err(KernelError::NodeNotFound(node_id));
            }

            let new_state = state.map_node(node_id, |node| node.status = status);
            effects.push(Effect::Emit(ClusterEvent::NodeUpdated { node_id }));
            Ok((new_state, effects))
        }

        Command::RemoveNode { node_id } => {
            let node = state
                .get_node(&node_id)
                .ok_or(KernelError::NodeNotFound(node_id))?;

            // Precondition: only down nodes may be removed.
            if node.status != NodeStatus::Down {
                return Err(KernelError::NodeNotDown(node_id));
            }

            // The node's containers are unreachable; delete them with it so
            // no container ever references a missing node.
            let (new_state, doomed) = state.without_containers_on_node(node_id);
            for container_id in doomed {
                effects.push(Effect::Emit(ClusterEvent::ContainerRemoved { container_id }));
            }
            effects.push(Effect::Emit(ClusterEvent::NodeRemoved { node_id }));
            Ok((new_state.without_node(node_id), effects))
        }

        // ====================================================================
        // Services
        // ====================================================================
        Command::CreateService {
            service_id,
            spec,
            now,
        } => {
            if state.service_exists(&service_id) {
                return Err(KernelError::ServiceIdConflict(service_id));
            }
            validate_service_spec(&state, &spec, None)?;

            let service = warren_types::Service {
                id: service_id,
                spec,
                version: 1,
                previous: None,
                rollout: None,
                created: now,
                updated: now,
            };

            effects.push(Effect::Emit(ClusterEvent::ServiceUpdated { service_id }));
            Ok((state.with_service(service), effects))
        }

        Command::UpdateService {
            service_id,
            spec,
            now,
        } => {
            let service = state
                .get_service(&service_id)
                .ok_or(KernelError::ServiceNotFound(service_id))?;
            validate_service_spec(&state, &spec, Some(service_id))?;

            // Version numbers never repeat, even across a rollback: the next
            // version tops both the active and the remembered one.
            let ceiling = service
                .previous
                .as_ref()
                .map_or(service.version, |(v, _)| service.version.max(*v));
            let new_version = ceiling + 1;
            let prev_version = service.version;
            let prev_spec = service.spec.clone();

            let new_state = state.map_service(service_id, |service| {
                service.previous = Some((prev_version, prev_spec));
                service.spec = spec;
                service.version = new_version;
                service.rollout = Some(RolloutState {
                    target_version: new_version,
                    prev_version,
                    step: 0,
                    stable_since: None,
                    started: now,
                });
                service.updated = now;
            });

            effects.push(Effect::Emit(ClusterEvent::ServiceUpdated { service_id }));
            Ok((new_state, effects))
        }

        Command::ScaleService {
            service_id,
            replicas,
            now,
        } => {
            let service = state
                .get_service(&service_id)
                .ok_or(KernelError::ServiceNotFound(service_id))?;

            if !matches!(service.spec.mode, ServiceMode::Replicated { .. }) {
                return Err(KernelError::NotReplicated(service_id));
            }

            let new_state = state.map_service(service_id, |service| {
                service.spec.mode = ServiceMode::Replicated { replicas };
                service.updated = now;
            });

            effects.push(Effect::Emit(ClusterEvent::ServiceUpdated { service_id }));
            Ok((new_state, effects))
        }

        Command::RollbackService { service_id, now } => {
            let service = state
                .get_service(&service_id)
                .ok_or(KernelError::ServiceNotFound(service_id))?;

            let (prev_version, prev_spec) = service
                .previous
                .clone()
                .ok_or(KernelError::NothingToRollback(service_id))?;
            let failed_version = service.version;
            let failed_spec = service.spec.clone();

            let new_state = state.map_service(service_id, |service| {
                service.spec = prev_spec;
                service.version = prev_version;
                service.previous = Some((failed_version, failed_spec));
                service.rollout = None;
                service.updated = now;
            });

            effects.push(Effect::Emit(ClusterEvent::ServiceUpdated { service_id }));
            Ok((new_state, effects))
        }

        Command::SetServiceRollout {
            service_id,
            rollout,
            now,
        } => {
            if !state.service_exists(&service_id) {
                return Err(KernelError::ServiceNotFound(service_id));
            }

            let new_state = state.map_service(service_id, |service| {
                service.rollout = rollout;
                service.updated = now;
            });

            effects.push(Effect::Emit(ClusterEvent::ServiceUpdated { service_id }));
            Ok((new_state, effects))
        }

        Command::DeleteService { service_id } => {
            if !state.service_exists(&service_id) {
                return Err(KernelError::ServiceNotFound(service_id));
            }

            // Containers are not cascaded here: the reconciler deletes them
            // within one cycle, and workers stop anything no longer assigned.
            effects.push(Effect::Emit(ClusterEvent::ServiceRemoved { service_id }));
            Ok((state.without_service(service_id), effects))
        }

        // ====================================================================
        // Containers
        // ====================================================================
        Command::UpsertContainer { container } => {
            // Referential integrity: owning service and assigned node.
            if !state.service_exists(&container.service_id) {
                return Err(KernelError::ServiceNotFound(container.service_id));
            }
            let node = state
                .get_node(&container.node_id)
                .ok_or(KernelError::NodeNotFound(container.node_id))?;
            let node_id = node.id;

            // Snapshotted references must resolve.
            for secret_ref in &container.spec.secrets {
                if state.secret_by_name(&secret_ref.source).is_none() {
                    return Err(KernelError::UnknownSecret(secret_ref.source.clone()));
                }
            }
            for volume_ref in &container.spec.volumes {
                let volume = state
                    .volume_by_name(&volume_ref.source)
                    .ok_or_else(|| KernelError::UnknownVolume(volume_ref.source.clone()))?;
                // A bound volume pins the container to its node.
                if let Some(bound) = volume.affinity {
                    if bound != node_id {
                        return Err(KernelError::VolumeAffinityViolation {
                            volume: volume_ref.source.clone(),
                            bound,
                            requested: node_id,
                        });
                    }
                }
            }

            let container_id = container.id;
            effects.push(Effect::Emit(ClusterEvent::ContainerUpdated { container_id }));
            Ok((state.with_container(container), effects))
        }

        Command::SetContainerDesired {
            container_id,
            desired,
            now,
        } => {
            if !state.container_exists(&container_id) {
                return Err(KernelError::ContainerNotFound(container_id));
            }

            let new_state = state.map_container(container_id, |container| {
                container.desired = desired;
                container.updated = now;
            });

            effects.push(Effect::Emit(ClusterEvent::ContainerUpdated { container_id }));
            Ok((new_state, effects))
        }

        Command::SetContainerActualState {
            container_id,
            actual,
            runtime_handle,
            now,
        } => {
            if !state.container_exists(&container_id) {
                return Err(KernelError::ContainerNotFound(container_id));
            }

            let new_state = state.map_container(container_id, |container| {
                container.actual = actual;
                if runtime_handle.is_some() {
                    container.runtime_handle = runtime_handle;
                }
                container.updated = now;
            });

            effects.push(Effect::Emit(ClusterEvent::ContainerUpdated { container_id }));
            Ok((new_state, effects))
        }

        Command::SetContainerHealth {
            container_id,
            health,
            now,
        } => {
            if !state.container_exists(&container_id) {
                return Err(KernelError::ContainerNotFound(container_id));
            }

            let new_state = state.map_container(container_id, |container| {
                container.health = health;
                container.updated = now;
            });

            effects.push(Effect::Emit(ClusterEvent::ContainerUpdated { container_id }));
            Ok((new_state, effects))
        }

        Command::DeleteContainer { container_id } => {
            if !state.container_exists(&container_id) {
                return Err(KernelError::ContainerNotFound(container_id));
            }

            effects.push(Effect::Emit(ClusterEvent::ContainerRemoved { container_id }));
            Ok((state.without_container(container_id), effects))
        }

        // ====================================================================
        // Secrets
        // ====================================================================
        Command::UpsertSecret { secret } => {
            if secret.name.is_empty() {
                return Err(KernelError::InvalidName("secret".into()));
            }
            if let Some(existing) = state.secret_by_name(&secret.name) {
                if existing.id != secret.id {
                    return Err(KernelError::SecretNameConflict(secret.name));
                }
            }

            let secret_id = secret.id;
            effects.push(Effect::Emit(ClusterEvent::SecretUpdated { secret_id }));
            Ok((state.with_secret(secret), effects))
        }

        Command::DeleteSecret { secret_id } => {
            let secret = state
                .get_secret(&secret_id)
                .ok_or(KernelError::SecretNotFound(secret_id))?;

            let referents = state.secret_referents(&secret.name);
            if !referents.is_empty() {
                return Err(KernelError::SecretInUse {
                    name: secret.name.clone(),
                    services: referents,
                });
            }

            effects.push(Effect::Emit(ClusterEvent::SecretRemoved { secret_id }));
            Ok((state.without_secret(secret_id), effects))
        }

        // ====================================================================
        // Volumes
        // ====================================================================
        Command::UpsertVolume { volume } => {
            if volume.name.is_empty() {
                return Err(KernelError::InvalidName("volume".into()));
            }
            if let Some(existing) = state.volume_by_name(&volume.name) {
                if existing.id != volume.id {
                    return Err(KernelError::VolumeNameConflict(volume.name));
                }
                // Monotonic affinity: an upsert may not rebind or unbind.
                if existing.affinity.is_some() && volume.affinity != existing.affinity {
                    return Err(KernelError::VolumeRebind {
                        volume: volume.name,
                    });
                }
            }

            let volume_id = volume.id;
            effects.push(Effect::Emit(ClusterEvent::VolumeUpdated { volume_id }));
            Ok((state.with_volume(volume), effects))
        }

        Command::BindVolume { volume_id, node_id } => {
            let volume = state
                .get_volume(&volume_id)
                .ok_or(KernelError::VolumeNotFound(volume_id))?;
            if !state.node_exists(&node_id) {
                return Err(KernelError::NodeNotFound(node_id));
            }

            match volume.affinity {
                Some(bound) if bound != node_id => {
                    return Err(KernelError::VolumeRebind {
                        volume: volume.name.clone(),
                    });
                }
                Some(_) => Ok((state, effects)), // idempotent
                None => {
                    let new_state =
                        state.map_volume(volume_id, |volume| volume.affinity = Some(node_id));
                    effects.push(Effect::Emit(ClusterEvent::VolumeUpdated { volume_id }));
                    Ok((new_state, effects))
                }
            }
        }

        Command::DeleteVolume { volume_id } => {
            let volume = state
                .get_volume(&volume_id)
                .ok_or(KernelError::VolumeNotFound(volume_id))?;

            if state.volume_is_referenced(&volume.name) {
                return Err(KernelError::VolumeInUse(volume.name.clone()));
            }

            effects.push(Effect::Emit(ClusterEvent::VolumeRemoved { volume_id }));
            Ok((state.without_volume(volume_id), effects))
        }

        // ====================================================================
        // Collaborator blobs
        // ====================================================================
        Command::UpsertIngress { ingress } => {
            if ingress.name.is_empty() {
                return Err(KernelError::InvalidName("ingress".into()));
            }
            let name = ingress.name.clone();
            effects.push(Effect::Emit(ClusterEvent::IngressUpdated { name }));
            Ok((state.with_ingress(ingress), effects))
        }

        Command::DeleteIngress { name } => {
            if state.get_ingress(&name).is_none() {
                return Err(KernelError::IngressNotFound(name));
            }
            effects.push(Effect::Emit(ClusterEvent::IngressRemoved { name: name.clone() }));
            Ok((state.without_ingress(&name), effects))
        }

        Command::UpsertTlsCertificate { cert } => {
            if cert.name.is_empty() {
                return Err(KernelError::InvalidName("tls certificate".into()));
            }
            let name = cert.name.clone();
            effects.push(Effect::Emit(ClusterEvent::TlsCertificateUpdated { name }));
            Ok((state.with_tls_certificate(cert), effects))
        }

        Command::DeleteTlsCertificate { name } => {
            if state.get_tls_certificate(&name).is_none() {
                return Err(KernelError::TlsCertificateNotFound(name));
            }
            effects.push(Effect::Emit(ClusterEvent::TlsCertificateRemoved {
                name: name.clone(),
            }));
            Ok((state.without_tls_certificate(&name), effects))
        }

        // ====================================================================
        // Join tokens
        // ====================================================================
        Command::PutJoinToken { token } => Ok((state.with_token(token), effects)),

        Command::ConsumeJoinToken { token_id, now } => {
            let token = state
                .get_token(&token_id)
                .ok_or(KernelError::TokenNotFound(token_id))?;

            if !token.is_valid(now) {
                return Err(KernelError::TokenExpired(token_id));
            }

            Ok((state.map_token(token_id, |token| token.used = true), effects))
        }

        Command::SweepTokens { now } => Ok((state.retain_tokens(|t| t.expires > now), effects)),

        // ====================================================================
        // Composition
        // ====================================================================
        Command::Batch(commands) => {
            let mut current = state;
            for command in commands {
                let (next, mut sub_effects) = apply_committed(current, command)?;
                current = next;
                effects.append(&mut sub_effects);
            }
            Ok((current, effects))
        }
    }
}

/// Shared validation for service create/update.
fn validate_service_spec(
    state: &State,
    spec: &ServiceSpec,
    existing: Option<ServiceId>,
) -> Result<(), KernelError> {
    if spec.name.is_empty() {
        return Err(KernelError::InvalidName("service".into()));
    }
    if spec.image.is_empty() {
        return Err(KernelError::InvalidService("empty image".into()));
    }

    // Name uniqueness (the same service may keep its name on update).
    if let Some(other) = state.service_by_name(&spec.name) {
        if existing != Some(other.id) {
            return Err(KernelError::ServiceNameConflict(spec.name.clone()));
        }
    }

    for secret_ref in &spec.secrets {
        if state.secret_by_name(&secret_ref.source).is_none() {
            return Err(KernelError::UnknownSecret(secret_ref.source.clone()));
        }
    }
    for volume_ref in &spec.volumes {
        if state.volume_by_name(&volume_ref.source).is_none() {
            return Err(KernelError::UnknownVolume(volume_ref.source.clone()));
        }
    }

    if let warren_types::DeployStrategy::Canary { steps } = &spec.deploy.strategy {
        if steps.is_empty() {
            return Err(KernelError::InvalidService("canary with no steps".into()));
        }
        if steps.iter().any(|s| *s == 0 || *s > 100) {
            return Err(KernelError::InvalidService(
                "canary steps must be percentages in 1..=100".into(),
            ));
        }
        if *steps.last().unwrap_or(&0) != 100 {
            return Err(KernelError::InvalidService(
                "canary steps must end at 100".into(),
            ));
        }
    }

    Ok(())
}

/// Errors that can occur when applying commands to the kernel.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum KernelError {
    #[error("cluster is already initialized")]
    ClusterAlreadyInitialized,

    #[error("invalid node: {0}")]
    InvalidNode(String),

    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    #[error("node {0} is not down")]
    NodeNotDown(NodeId),

    #[error("service with id {0} already exists")]
    ServiceIdConflict(ServiceId),

    #[error("service with name '{0}' already exists")]
    ServiceNameConflict(String),

    #[error("service {0} not found")]
    ServiceNotFound(ServiceId),

    #[error("service {0} is not replicated")]
    NotReplicated(ServiceId),

    #[error("service {0} has no previous version to roll back to")]
    NothingToRollback(ServiceId),

    #[error("invalid service spec: {0}")]
    InvalidService(String),

    #[error("empty {0} name")]
    InvalidName(String),

    #[error("container {0} not found")]
    ContainerNotFound(ContainerId),

    #[error("secret with name '{0}' already exists")]
    SecretNameConflict(String),

    #[error("secret {0} not found")]
    SecretNotFound(SecretId),

    #[error("secret '{name}' is referenced by {} service(s)", .services.len())]
    SecretInUse {
        name: String,
        services: Vec<ServiceId>,
    },

    #[error("unknown secret '{0}'")]
    UnknownSecret(String),

    #[error("volume with name '{0}' already exists")]
    VolumeNameConflict(String),

    #[error("volume {0} not found")]
    VolumeNotFound(VolumeId),

    #[error("volume '{0}' is still referenced")]
    VolumeInUse(String),

    #[error("unknown volume '{0}'")]
    UnknownVolume(String),

    #[error("volume '{volume}' is bound to node {bound}, cannot place on {requested}")]
    VolumeAffinityViolation {
        volume: String,
        bound: NodeId,
        requested: NodeId,
    },

    #[error("volume '{volume}' is already bound to a different node")]
    VolumeRebind { volume: String },

    #[error("ingress '{0}' not found")]
    IngressNotFound(String),

    #[error("tls certificate '{0}' not found")]
    TlsCertificateNotFound(String),

    #[error("join token {0} not found")]
    TokenNotFound(TokenId),

    #[error("join token {0} is expired or already used")]
    TokenExpired(TokenId),
}

impl KernelError {
    /// Classification for the RPC boundary.
    pub fn kind(&self) -> warren_types::ErrorKind {
        use warren_types::ErrorKind;
        match self {
            KernelError::ClusterAlreadyInitialized
            | KernelError::ServiceIdConflict(_)
            | KernelError::ServiceNameConflict(_)
            | KernelError::SecretNameConflict(_)
            | KernelError::VolumeNameConflict(_) => ErrorKind::AlreadyExists,

            KernelError::NodeNotFound(_)
            | KernelError::ServiceNotFound(_)
            | KernelError::ContainerNotFound(_)
            | KernelError::SecretNotFound(_)
            | KernelError::VolumeNotFound(_)
            | KernelError::IngressNotFound(_)
            | KernelError::TlsCertificateNotFound(_)
            | KernelError::TokenNotFound(_) => ErrorKind::NotFound,

            KernelError::TokenExpired(_) => ErrorKind::Unauthenticated,

            KernelError::InvalidNode(_)
            | KernelError::NodeNotDown(_)
            | KernelError::NotReplicated(_)
            | KernelError::NothingToRollback(_)
            | KernelError::InvalidService(_)
            | KernelError::InvalidName(_)
            | KernelError::SecretInUse { .. }
            | KernelError::UnknownSecret(_)
            | KernelError::VolumeInUse(_)
            | KernelError::UnknownVolume(_)
            | KernelError::VolumeAffinityViolation { .. }
            | KernelError::VolumeRebind { .. } => ErrorKind::Validation,
        }
    }
}
