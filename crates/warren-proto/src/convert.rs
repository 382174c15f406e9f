//! Conversions between wire messages and domain records.
//!
//! Domain → wire is infallible; wire → domain validates (IDs parse, enums
//! are in range, required fields are present) and fails with
//! [`ConvertError`], which surfaces as `InvalidArgument`.

use tonic::Status;
use warren_types as t;

use crate::pb;
use crate::status::status;

/// A malformed wire message.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConvertError {
    #[error("missing field: {0}")]
    Missing(&'static str),

    #[error("malformed id in field {0}")]
    BadId(&'static str),

    #[error("out-of-range enum in field {0}")]
    BadEnum(&'static str),

    #[error("out-of-range value in field {0}")]
    BadValue(&'static str),
}

impl From<ConvertError> for Status {
    fn from(err: ConvertError) -> Status {
        status(t::ErrorKind::Validation, err.to_string())
    }
}

fn parse_id<T: std::str::FromStr>(value: &str, field: &'static str) -> Result<T, ConvertError> {
    value.parse().map_err(|_| ConvertError::BadId(field))
}

fn port(value: u32, field: &'static str) -> Result<u16, ConvertError> {
    u16::try_from(value).map_err(|_| ConvertError::BadValue(field))
}

// ============================================================================
// Enums
// ============================================================================

impl From<t::NodeRole> for pb::NodeRole {
    fn from(role: t::NodeRole) -> Self {
        match role {
            t::NodeRole::Manager => pb::NodeRole::Manager,
            t::NodeRole::Worker => pb::NodeRole::Worker,
        }
    }
}

pub fn node_role(value: i32) -> Result<t::NodeRole, ConvertError> {
    match pb::NodeRole::try_from(value) {
        Ok(pb::NodeRole::Manager) => Ok(t::NodeRole::Manager),
        Ok(pb::NodeRole::Worker) => Ok(t::NodeRole::Worker),
        _ => Err(ConvertError::BadEnum("role")),
    }
}

impl From<t::NodeStatus> for pb::NodeStatus {
    fn from(status: t::NodeStatus) -> Self {
        match status {
            t::NodeStatus::Ready => pb::NodeStatus::Ready,
            t::NodeStatus::Down => pb::NodeStatus::Down,
            t::NodeStatus::Unknown => pb::NodeStatus::Unknown,
        }
    }
}

impl From<t::DesiredState> for pb::DesiredState {
    fn from(desired: t::DesiredState) -> Self {
        match desired {
            t::DesiredState::Running => pb::DesiredState::Running,
            t::DesiredState::Shutdown => pb::DesiredState::Shutdown,
        }
    }
}

pub fn desired_state(value: i32) -> Result<t::DesiredState, ConvertError> {
    match pb::DesiredState::try_from(value) {
        Ok(pb::DesiredState::Running) => Ok(t::DesiredState::Running),
        Ok(pb::DesiredState::Shutdown) => Ok(t::DesiredState::Shutdown),
        _ => Err(ConvertError::BadEnum("desired")),
    }
}

impl From<t::ActualState> for pb::ActualState {
    fn from(actual: t::ActualState) -> Self {
        match actual {
            t::ActualState::Pending => pb::ActualState::Pending,
            t::ActualState::Assigned => pb::ActualState::Assigned,
            t::ActualState::Starting => pb::ActualState::Starting,
            t::ActualState::Running => pb::ActualState::Running,
            t::ActualState::Stopping => pb::ActualState::Stopping,
            t::ActualState::Stopped => pb::ActualState::Stopped,
            t::ActualState::Failed => pb::ActualState::Failed,
        }
    }
}

pub fn actual_state(value: i32) -> Result<t::ActualState, ConvertError> {
    Ok(match pb::ActualState::try_from(value) {
        Ok(pb::ActualState::Pending) => t::ActualState::Pending,
        Ok(pb::ActualState::Assigned) => t::ActualState::Assigned,
        Ok(pb::ActualState::Starting) => t::ActualState::Starting,
        Ok(pb::ActualState::Running) => t::ActualState::Running,
        Ok(pb::ActualState::Stopping) => t::ActualState::Stopping,
        Ok(pb::ActualState::Stopped) => t::ActualState::Stopped,
        Ok(pb::ActualState::Failed) => t::ActualState::Failed,
        _ => return Err(ConvertError::BadEnum("actual")),
    })
}

impl From<t::HealthState> for pb::HealthState {
    fn from(health: t::HealthState) -> Self {
        match health {
            t::HealthState::Unknown => pb::HealthState::Unknown,
            t::HealthState::Starting => pb::HealthState::Starting,
            t::HealthState::Healthy => pb::HealthState::Healthy,
            t::HealthState::Unhealthy => pb::HealthState::Unhealthy,
        }
    }
}

pub fn health_state(value: i32) -> Result<t::HealthState, ConvertError> {
    Ok(match pb::HealthState::try_from(value) {
        Ok(pb::HealthState::Unknown) => t::HealthState::Unknown,
        Ok(pb::HealthState::Starting) => t::HealthState::Starting,
        Ok(pb::HealthState::Healthy) => t::HealthState::Healthy,
        Ok(pb::HealthState::Unhealthy) => t::HealthState::Unhealthy,
        _ => return Err(ConvertError::BadEnum("health.state")),
    })
}

// ============================================================================
// Nodes
// ============================================================================

impl From<t::NodeResources> for pb::NodeResources {
    fn from(res: t::NodeResources) -> Self {
        pb::NodeResources {
            cpu_millis: res.cpu_millis,
            memory_bytes: res.memory_bytes,
        }
    }
}

impl From<pb::NodeResources> for t::NodeResources {
    fn from(res: pb::NodeResources) -> Self {
        t::NodeResources {
            cpu_millis: res.cpu_millis,
            memory_bytes: res.memory_bytes,
        }
    }
}

impl From<&t::Node> for pb::Node {
    fn from(node: &t::Node) -> Self {
        pb::Node {
            id: node.id.to_string(),
            role: pb::NodeRole::from(node.role) as i32,
            addr: node.addr.clone(),
            hostname: node.hostname.clone(),
            arch: node.arch.clone(),
            os: node.os.clone(),
            labels: node.labels.clone(),
            resources: Some(node.resources.into()),
            status: pb::NodeStatus::from(node.status) as i32,
            last_heartbeat_ms: node.last_heartbeat.as_millis(),
            created_ms: node.created.as_millis(),
        }
    }
}

// ============================================================================
// Service specs
// ============================================================================

impl From<&t::PortSpec> for pb::PortSpec {
    fn from(spec: &t::PortSpec) -> Self {
        pb::PortSpec {
            target: u32::from(spec.target),
            published: u32::from(spec.published),
            protocol: match spec.protocol {
                t::Protocol::Tcp => pb::Protocol::Tcp as i32,
                t::Protocol::Udp => pb::Protocol::Udp as i32,
            },
        }
    }
}

impl TryFrom<pb::PortSpec> for t::PortSpec {
    type Error = ConvertError;

    fn try_from(spec: pb::PortSpec) -> Result<Self, ConvertError> {
        Ok(t::PortSpec {
            target: port(spec.target, "ports.target")?,
            published: port(spec.published, "ports.published")?,
            protocol: match pb::Protocol::try_from(spec.protocol) {
                Ok(pb::Protocol::Udp) => t::Protocol::Udp,
                // TCP is the wire default.
                Ok(pb::Protocol::Tcp | pb::Protocol::Unspecified) => t::Protocol::Tcp,
                Err(_) => return Err(ConvertError::BadEnum("ports.protocol")),
            },
        })
    }
}

impl From<&t::SecretRef> for pb::SecretRef {
    fn from(r: &t::SecretRef) -> Self {
        pb::SecretRef {
            source: r.source.clone(),
            target: r.target.clone(),
        }
    }
}

impl From<pb::SecretRef> for t::SecretRef {
    fn from(r: pb::SecretRef) -> Self {
        t::SecretRef {
            source: r.source,
            target: r.target,
        }
    }
}

impl From<&t::VolumeRef> for pb::VolumeRef {
    fn from(r: &t::VolumeRef) -> Self {
        pb::VolumeRef {
            source: r.source.clone(),
            target: r.target.clone(),
        }
    }
}

impl From<pb::VolumeRef> for t::VolumeRef {
    fn from(r: pb::VolumeRef) -> Self {
        t::VolumeRef {
            source: r.source,
            target: r.target,
        }
    }
}

impl From<&t::HealthCheck> for pb::HealthCheck {
    fn from(check: &t::HealthCheck) -> Self {
        let probe = match &check.probe {
            t::ProbeSpec::Http {
                path,
                port,
                expect_min,
                expect_max,
            } => pb::health_check::Probe::Http(pb::HttpProbe {
                path: path.clone(),
                port: u32::from(*port),
                expect_min: u32::from(*expect_min),
                expect_max: u32::from(*expect_max),
            }),
            t::ProbeSpec::Tcp { port } => pb::health_check::Probe::Tcp(pb::TcpProbe {
                port: u32::from(*port),
            }),
            t::ProbeSpec::Exec { command } => pb::health_check::Probe::Exec(pb::ExecProbe {
                command: command.clone(),
            }),
        };
        pb::HealthCheck {
            probe: Some(probe),
            interval_ms: check.interval_ms,
            timeout_ms: check.timeout_ms,
            retries: check.retries,
            success_threshold: check.success_threshold,
            start_period_ms: check.start_period_ms,
        }
    }
}

impl TryFrom<pb::HealthCheck> for t::HealthCheck {
    type Error = ConvertError;

    fn try_from(check: pb::HealthCheck) -> Result<Self, ConvertError> {
        let probe = match check.probe.ok_or(ConvertError::Missing("healthcheck.probe"))? {
            pb::health_check::Probe::Http(http) => t::ProbeSpec::Http {
                path: http.path,
                port: port(http.port, "healthcheck.port")?,
                expect_min: u16::try_from(http.expect_min)
                    .map_err(|_| ConvertError::BadValue("healthcheck.expect_min"))?,
                expect_max: u16::try_from(http.expect_max)
                    .map_err(|_| ConvertError::BadValue("healthcheck.expect_max"))?,
            },
            pb::health_check::Probe::Tcp(tcp) => t::ProbeSpec::Tcp {
                port: port(tcp.port, "healthcheck.port")?,
            },
            pb::health_check::Probe::Exec(exec) => t::ProbeSpec::Exec {
                command: exec.command,
            },
        };
        Ok(t::HealthCheck {
            probe,
            interval_ms: check.interval_ms,
            timeout_ms: check.timeout_ms,
            retries: check.retries,
            success_threshold: check.success_threshold,
            start_period_ms: check.start_period_ms,
        })
    }
}

impl From<t::ResourceLimits> for pb::ResourceLimits {
    fn from(limits: t::ResourceLimits) -> Self {
        pb::ResourceLimits {
            cpu_millis: limits.cpu_millis,
            memory_bytes: limits.memory_bytes,
        }
    }
}

impl From<pb::ResourceLimits> for t::ResourceLimits {
    fn from(limits: pb::ResourceLimits) -> Self {
        t::ResourceLimits {
            cpu_millis: limits.cpu_millis,
            memory_bytes: limits.memory_bytes,
        }
    }
}

impl From<&t::DeploySpec> for pb::DeploySpec {
    fn from(deploy: &t::DeploySpec) -> Self {
        let strategy = match &deploy.strategy {
            t::DeployStrategy::Rolling(rolling) => {
                pb::deploy_spec::Strategy::Rolling(pb::RollingSpec {
                    parallelism: rolling.parallelism,
                    max_surge: rolling.max_surge,
                    max_unavailable: rolling.max_unavailable,
                })
            }
            t::DeployStrategy::BlueGreen => pb::deploy_spec::Strategy::BlueGreen(pb::BlueGreen {}),
            t::DeployStrategy::Canary { steps } => pb::deploy_spec::Strategy::Canary(pb::Canary {
                steps: steps.iter().map(|s| u32::from(*s)).collect(),
            }),
        };
        pb::DeploySpec {
            strategy: Some(strategy),
            stability_ms: deploy.stability_ms,
            auto_rollback: deploy.auto_rollback,
            failure_threshold: deploy.failure_threshold,
        }
    }
}

impl TryFrom<pb::DeploySpec> for t::DeploySpec {
    type Error = ConvertError;

    fn try_from(deploy: pb::DeploySpec) -> Result<Self, ConvertError> {
        let strategy = match deploy.strategy {
            None => t::DeployStrategy::default(),
            Some(pb::deploy_spec::Strategy::Rolling(rolling)) => {
                t::DeployStrategy::Rolling(t::RollingSpec {
                    parallelism: rolling.parallelism.max(1),
                    max_surge: rolling.max_surge,
                    max_unavailable: rolling.max_unavailable,
                })
            }
            Some(pb::deploy_spec::Strategy::BlueGreen(_)) => t::DeployStrategy::BlueGreen,
            Some(pb::deploy_spec::Strategy::Canary(canary)) => t::DeployStrategy::Canary {
                steps: canary
                    .steps
                    .into_iter()
                    .map(|s| u8::try_from(s).map_err(|_| ConvertError::BadValue("deploy.steps")))
                    .collect::<Result<_, _>>()?,
            },
        };
        Ok(t::DeploySpec {
            strategy,
            stability_ms: deploy.stability_ms,
            auto_rollback: deploy.auto_rollback,
            failure_threshold: deploy.failure_threshold,
        })
    }
}

impl From<&t::ServiceSpec> for pb::ServiceSpec {
    fn from(spec: &t::ServiceSpec) -> Self {
        pb::ServiceSpec {
            name: spec.name.clone(),
            image: spec.image.clone(),
            mode: Some(match spec.mode {
                t::ServiceMode::Replicated { replicas } => {
                    pb::service_spec::Mode::Replicas(replicas)
                }
                t::ServiceMode::Global => pb::service_spec::Mode::Global(pb::Global {}),
            }),
            env: spec.env.clone(),
            ports: spec.ports.iter().map(pb::PortSpec::from).collect(),
            secrets: spec.secrets.iter().map(pb::SecretRef::from).collect(),
            volumes: spec.volumes.iter().map(pb::VolumeRef::from).collect(),
            healthcheck: spec.healthcheck.as_ref().map(pb::HealthCheck::from),
            limits: Some(spec.limits.into()),
            stop_timeout_ms: spec.stop_timeout_ms,
            deploy: Some(pb::DeploySpec::from(&spec.deploy)),
            labels: spec.labels.clone(),
        }
    }
}

impl TryFrom<pb::ServiceSpec> for t::ServiceSpec {
    type Error = ConvertError;

    fn try_from(spec: pb::ServiceSpec) -> Result<Self, ConvertError> {
        Ok(t::ServiceSpec {
            name: spec.name,
            image: spec.image,
            mode: match spec.mode {
                Some(pb::service_spec::Mode::Replicas(replicas)) => {
                    t::ServiceMode::Replicated { replicas }
                }
                Some(pb::service_spec::Mode::Global(_)) => t::ServiceMode::Global,
                None => return Err(ConvertError::Missing("spec.mode")),
            },
            env: spec.env,
            ports: spec
                .ports
                .into_iter()
                .map(t::PortSpec::try_from)
                .collect::<Result<_, _>>()?,
            secrets: spec.secrets.into_iter().map(t::SecretRef::from).collect(),
            volumes: spec.volumes.into_iter().map(t::VolumeRef::from).collect(),
            healthcheck: spec.healthcheck.map(t::HealthCheck::try_from).transpose()?,
            limits: spec.limits.map(t::ResourceLimits::from).unwrap_or_default(),
            stop_timeout_ms: if spec.stop_timeout_ms == 0 {
                10_000
            } else {
                spec.stop_timeout_ms
            },
            deploy: spec
                .deploy
                .map(t::DeploySpec::try_from)
                .transpose()?
                .unwrap_or_default(),
            labels: spec.labels,
        })
    }
}

impl From<&t::Service> for pb::Service {
    fn from(service: &t::Service) -> Self {
        pb::Service {
            id: service.id.to_string(),
            spec: Some(pb::ServiceSpec::from(&service.spec)),
            version: service.version,
            rollout: service.rollout.as_ref().map(|r| pb::RolloutState {
                target_version: r.target_version,
                prev_version: r.prev_version,
                step: r.step,
                stable_since_ms: r.stable_since.map(|t| t.as_millis()),
                started_ms: r.started.as_millis(),
            }),
            created_ms: service.created.as_millis(),
            updated_ms: service.updated.as_millis(),
        }
    }
}

// ============================================================================
// Containers
// ============================================================================

impl From<t::ContainerHealth> for pb::ContainerHealth {
    fn from(health: t::ContainerHealth) -> Self {
        pb::ContainerHealth {
            state: pb::HealthState::from(health.state) as i32,
            failing_streak: health.failing_streak,
            passing_streak: health.passing_streak,
            unhealthy_since_ms: health.unhealthy_since.map(|t| t.as_millis()),
        }
    }
}

impl TryFrom<pb::ContainerHealth> for t::ContainerHealth {
    type Error = ConvertError;

    fn try_from(health: pb::ContainerHealth) -> Result<Self, ConvertError> {
        Ok(t::ContainerHealth {
            state: health_state(health.state)?,
            failing_streak: health.failing_streak,
            passing_streak: health.passing_streak,
            unhealthy_since: health.unhealthy_since_ms.map(t::Timestamp::from_millis),
        })
    }
}

impl From<&t::ContainerSpec> for pb::ContainerSpec {
    fn from(spec: &t::ContainerSpec) -> Self {
        pb::ContainerSpec {
            image: spec.image.clone(),
            env: spec.env.clone(),
            ports: spec.ports.iter().map(pb::PortSpec::from).collect(),
            secrets: spec.secrets.iter().map(pb::SecretRef::from).collect(),
            volumes: spec.volumes.iter().map(pb::VolumeRef::from).collect(),
            healthcheck: spec.healthcheck.as_ref().map(pb::HealthCheck::from),
            limits: Some(spec.limits.into()),
            stop_timeout_ms: spec.stop_timeout_ms,
        }
    }
}

impl TryFrom<pb::ContainerSpec> for t::ContainerSpec {
    type Error = ConvertError;

    fn try_from(spec: pb::ContainerSpec) -> Result<Self, ConvertError> {
        Ok(t::ContainerSpec {
            image: spec.image,
            env: spec.env,
            ports: spec
                .ports
                .into_iter()
                .map(t::PortSpec::try_from)
                .collect::<Result<_, _>>()?,
            secrets: spec.secrets.into_iter().map(t::SecretRef::from).collect(),
            volumes: spec.volumes.into_iter().map(t::VolumeRef::from).collect(),
            healthcheck: spec.healthcheck.map(t::HealthCheck::try_from).transpose()?,
            limits: spec.limits.map(t::ResourceLimits::from).unwrap_or_default(),
            stop_timeout_ms: spec.stop_timeout_ms,
        })
    }
}

impl From<&t::Container> for pb::Container {
    fn from(container: &t::Container) -> Self {
        pb::Container {
            id: container.id.to_string(),
            service_id: container.service_id.to_string(),
            node_id: container.node_id.to_string(),
            replica: container.replica,
            version: container.version,
            spec: Some(pb::ContainerSpec::from(&container.spec)),
            desired: pb::DesiredState::from(container.desired) as i32,
            actual: pb::ActualState::from(container.actual) as i32,
            health: Some(container.health.into()),
            runtime_handle: container.runtime_handle.clone(),
            created_ms: container.created.as_millis(),
            updated_ms: container.updated.as_millis(),
        }
    }
}

impl TryFrom<pb::Container> for t::Container {
    type Error = ConvertError;

    fn try_from(container: pb::Container) -> Result<Self, ConvertError> {
        Ok(t::Container {
            id: parse_id(&container.id, "id")?,
            service_id: parse_id(&container.service_id, "service_id")?,
            node_id: parse_id(&container.node_id, "node_id")?,
            replica: container.replica,
            version: container.version,
            spec: container
                .spec
                .ok_or(ConvertError::Missing("spec"))?
                .try_into()?,
            desired: desired_state(container.desired)?,
            actual: actual_state(container.actual)?,
            health: container
                .health
                .map(t::ContainerHealth::try_from)
                .transpose()?
                .unwrap_or_default(),
            runtime_handle: container.runtime_handle,
            created: t::Timestamp::from_millis(container.created_ms),
            updated: t::Timestamp::from_millis(container.updated_ms),
        })
    }
}

// ============================================================================
// Secrets, volumes, collaborator records
// ============================================================================

impl From<&t::Secret> for pb::SecretInfo {
    fn from(secret: &t::Secret) -> Self {
        pb::SecretInfo {
            id: secret.id.to_string(),
            name: secret.name.clone(),
            created_ms: secret.created.as_millis(),
        }
    }
}

impl From<&t::Volume> for pb::Volume {
    fn from(volume: &t::Volume) -> Self {
        pb::Volume {
            id: volume.id.to_string(),
            name: volume.name.clone(),
            driver: match volume.driver {
                t::VolumeDriver::Local => "local".to_string(),
            },
            affinity_node_id: volume.affinity.map(|n| n.to_string()),
            options: volume.options.clone(),
            created_ms: volume.created.as_millis(),
        }
    }
}

impl From<&t::Ingress> for pb::IngressRecord {
    fn from(ingress: &t::Ingress) -> Self {
        pb::IngressRecord {
            name: ingress.name.clone(),
            payload: ingress.payload.clone(),
            updated_ms: ingress.updated.as_millis(),
        }
    }
}

impl From<&t::TlsCertificate> for pb::TlsCertificateRecord {
    fn from(cert: &t::TlsCertificate) -> Self {
        pb::TlsCertificateRecord {
            name: cert.name.clone(),
            payload: cert.payload.clone(),
            updated_ms: cert.updated.as_millis(),
        }
    }
}

// ============================================================================
// Events
// ============================================================================

impl From<&t::ClusterEvent> for pb::Event {
    fn from(event: &t::ClusterEvent) -> Self {
        let (kind, entity) = match event {
            t::ClusterEvent::ClusterInitialized { cluster_id } => {
                ("cluster-initialized", cluster_id.to_string())
            }
            t::ClusterEvent::NodeUpdated { node_id } => ("node-updated", node_id.to_string()),
            t::ClusterEvent::NodeRemoved { node_id } => ("node-removed", node_id.to_string()),
            t::ClusterEvent::ServiceUpdated { service_id } => {
                ("service-updated", service_id.to_string())
            }
            t::ClusterEvent::ServiceRemoved { service_id } => {
                ("service-removed", service_id.to_string())
            }
            t::ClusterEvent::ContainerUpdated { container_id } => {
                ("container-updated", container_id.to_string())
            }
            t::ClusterEvent::ContainerRemoved { container_id } => {
                ("container-removed", container_id.to_string())
            }
            t::ClusterEvent::SecretUpdated { secret_id } => {
                ("secret-updated", secret_id.to_string())
            }
            t::ClusterEvent::SecretRemoved { secret_id } => {
                ("secret-removed", secret_id.to_string())
            }
            t::ClusterEvent::VolumeUpdated { volume_id } => {
                ("volume-updated", volume_id.to_string())
            }
            t::ClusterEvent::VolumeRemoved { volume_id } => {
                ("volume-removed", volume_id.to_string())
            }
            t::ClusterEvent::IngressUpdated { name } => ("ingress-updated", name.clone()),
            t::ClusterEvent::IngressRemoved { name } => ("ingress-removed", name.clone()),
            t::ClusterEvent::TlsCertificateUpdated { name } => {
                ("tls-certificate-updated", name.clone())
            }
            t::ClusterEvent::TlsCertificateRemoved { name } => {
                ("tls-certificate-removed", name.clone())
            }
        };
        pb::Event {
            kind: kind.to_string(),
            entity,
        }
    }
}
