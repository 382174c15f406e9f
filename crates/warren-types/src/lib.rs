//! # warren-types: Core types for Warren
//!
//! This crate contains shared types used across the Warren system:
//! - Entity IDs ([`NodeId`], [`ServiceId`], [`ContainerId`], [`SecretId`], [`VolumeId`])
//! - Temporal types ([`Timestamp`])
//! - Cluster entities ([`Node`], [`Service`], [`Container`], [`Secret`], [`Volume`])
//! - Collaborator blobs ([`Ingress`], [`TlsCertificate`])
//! - Admission ([`JoinToken`], [`ClusterMeta`])
//! - Change notifications ([`ClusterEvent`])
//! - The error taxonomy ([`ErrorKind`])
//!
//! Everything here is plain data: no I/O, no clocks inside the types
//! themselves. The replicated state machine depends on these records being
//! deterministic to serialize and compare.

use std::collections::BTreeMap;
use std::fmt::{self, Debug, Display};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Entity IDs - random 16-byte values rendered as 32-char lowercase hex
// ============================================================================

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
        )]
        pub struct $name([u8; 16]);

        impl $name {
            /// Creates an ID from raw bytes.
            pub const fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(bytes)
            }

            /// Generates a fresh random ID.
            pub fn generate() -> Self {
                Self(rand::random())
            }

            /// Returns the raw bytes.
            pub const fn as_bytes(&self) -> &[u8; 16] {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for b in &self.0 {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.len() != 32 {
                    return Err(IdParseError::Length(s.len()));
                }
                let mut bytes = [0u8; 16];
                for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
                    let hi = hex_val(chunk[0]).ok_or(IdParseError::Digit)?;
                    let lo = hex_val(chunk[1]).ok_or(IdParseError::Digit)?;
                    bytes[i] = (hi << 4) | lo;
                }
                Ok(Self(bytes))
            }
        }
    };
}

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}

entity_id!(
    /// Unique identifier for a node (host) in the cluster.
    NodeId
);
entity_id!(
    /// Unique identifier for a service.
    ServiceId
);
entity_id!(
    /// Unique identifier for an orchestrator-level container record.
    ContainerId
);
entity_id!(
    /// Unique identifier for a secret.
    SecretId
);
entity_id!(
    /// Unique identifier for a volume.
    VolumeId
);
entity_id!(
    /// Unique identifier for a join token.
    TokenId
);

/// Error returned when parsing an entity ID from hex.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdParseError {
    #[error("expected 32 hex characters, got {0}")]
    Length(usize),

    #[error("invalid hex digit")]
    Digit,
}

/// Source of fresh container IDs for the planners.
///
/// The scheduler and reconciler are pure functions of the replicated state,
/// but new containers need IDs. The planner shell injects the source so
/// tests can use a counter and production can use randomness.
pub trait IdGen {
    fn container_id(&mut self) -> ContainerId;
}

/// Production ID source backed by the thread RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdGen;

impl IdGen for RandomIdGen {
    fn container_id(&mut self) -> ContainerId {
        ContainerId::generate()
    }
}

/// Deterministic ID source for tests: 1, 2, 3, ... in the low byte order.
#[derive(Debug, Default, Clone)]
pub struct SeqIdGen {
    next: u64,
}

impl IdGen for SeqIdGen {
    fn container_id(&mut self) -> ContainerId {
        self.next += 1;
        let mut bytes = [0u8; 16];
        bytes[8..].copy_from_slice(&self.next.to_be_bytes());
        ContainerId::from_bytes(bytes)
    }
}

// ============================================================================
// Timestamp - milliseconds since the Unix epoch
// ============================================================================

/// Wall-clock instant as milliseconds since the Unix epoch.
///
/// The state machine never reads clocks: commands carry the proposing
/// node's wall time so applies stay deterministic across replicas.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub const fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Reads the system clock. Shell code only; never called during Apply.
    pub fn now() -> Self {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self(ms)
    }

    /// Milliseconds elapsed from `earlier` to `self`, saturating at zero.
    pub const fn millis_since(&self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    pub const fn plus_millis(&self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Nodes
// ============================================================================

/// Role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Participates in consensus and serves the API.
    Manager,
    /// Executes containers.
    Worker,
}

impl Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Manager => write!(f, "manager"),
            NodeRole::Worker => write!(f, "worker"),
        }
    }
}

/// Liveness status of a node, as judged by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NodeStatus {
    /// Heartbeating within the down threshold.
    Ready,
    /// Missed heartbeats past the down threshold.
    Down,
    /// Registered but not yet heard from.
    #[default]
    Unknown,
}

/// Resources a node advertises at join and refreshes on heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NodeResources {
    /// Logical CPU count, in millicores (1 core = 1000).
    pub cpu_millis: u64,
    /// Total memory in bytes.
    pub memory_bytes: u64,
}

/// A host participating in the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub role: NodeRole,
    /// Address the node's own listeners are reachable at (`host:port`).
    pub addr: String,
    pub hostname: String,
    pub arch: String,
    pub os: String,
    pub labels: BTreeMap<String, String>,
    pub resources: NodeResources,
    pub status: NodeStatus,
    pub last_heartbeat: Timestamp,
    pub created: Timestamp,
}

impl Node {
    /// True if this node can receive new container placements.
    pub fn is_schedulable(&self) -> bool {
        self.role == NodeRole::Worker && self.status == NodeStatus::Ready
    }
}

// ============================================================================
// Service specification
// ============================================================================

/// L4 protocol for a published port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

/// A port publication: container port exposed on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    /// Port inside the container.
    pub target: u16,
    /// Port on the host.
    pub published: u16,
    pub protocol: Protocol,
}

/// Reference from a service to a secret, by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    /// Name of the secret in the store.
    pub source: String,
    /// File name under the in-memory secrets mount.
    pub target: String,
}

/// Reference from a service to a volume, by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRef {
    /// Name of the volume in the store.
    pub source: String,
    /// Mount path inside the container.
    pub target: String,
}

/// The probe half of a health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeSpec {
    /// HTTP GET against `path` on `port`; healthy if the status falls in
    /// `[expect_min, expect_max]`.
    Http {
        path: String,
        port: u16,
        expect_min: u16,
        expect_max: u16,
    },
    /// TCP connect to `port`.
    Tcp { port: u16 },
    /// Command executed inside the container; healthy on exit code 0.
    Exec { command: Vec<String> },
}

/// Health check declaration with hysteresis parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub probe: ProbeSpec,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    /// Consecutive failures before the container is declared unhealthy.
    pub retries: u32,
    /// Consecutive successes after a failure before healthy again.
    pub success_threshold: u32,
    /// Grace after start during which failures do not count.
    pub start_period_ms: u64,
}

impl HealthCheck {
    /// An HTTP check with the conventional defaults.
    pub fn http(path: impl Into<String>, port: u16) -> Self {
        Self {
            probe: ProbeSpec::Http {
                path: path.into(),
                port,
                expect_min: 200,
                expect_max: 399,
            },
            interval_ms: 5_000,
            timeout_ms: 3_000,
            retries: 3,
            success_threshold: 2,
            start_period_ms: 10_000,
        }
    }
}

/// Resource ceilings applied to a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResourceLimits {
    pub cpu_millis: Option<u64>,
    pub memory_bytes: Option<u64>,
}

/// Replication mode for a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceMode {
    /// Run exactly `replicas` instances, indexed 1..=replicas.
    Replicated { replicas: u32 },
    /// Run one instance on every ready worker.
    Global,
}

impl ServiceMode {
    pub fn replicas(&self) -> Option<u32> {
        match self {
            ServiceMode::Replicated { replicas } => Some(*replicas),
            ServiceMode::Global => None,
        }
    }
}

/// Rolling-update parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollingSpec {
    /// Containers replaced per batch.
    pub parallelism: u32,
    /// How many containers the service may exceed its target by.
    pub max_surge: u32,
    /// How many replicas may be unavailable during the update.
    pub max_unavailable: u32,
}

impl Default for RollingSpec {
    fn default() -> Self {
        Self {
            parallelism: 1,
            max_surge: 1,
            max_unavailable: 0,
        }
    }
}

/// Update strategy for a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeployStrategy {
    /// Replace in health-gated batches.
    Rolling(RollingSpec),
    /// Build the full new set alongside the old, then flip.
    BlueGreen,
    /// Step the new replica share through `steps` (percentages, ending 100).
    Canary { steps: Vec<u8> },
}

impl Default for DeployStrategy {
    fn default() -> Self {
        DeployStrategy::Rolling(RollingSpec::default())
    }
}

/// Deployment behavior for a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploySpec {
    pub strategy: DeployStrategy,
    /// How long a step must remain fully healthy before advancing.
    pub stability_ms: u64,
    /// Revert automatically when `failure_threshold` is crossed mid-rollout.
    pub auto_rollback: bool,
    /// Failed/unhealthy new-version containers tolerated during a rollout.
    pub failure_threshold: u32,
}

impl Default for DeploySpec {
    fn default() -> Self {
        Self {
            strategy: DeployStrategy::default(),
            stability_ms: 10_000,
            auto_rollback: true,
            failure_threshold: 1,
        }
    }
}

/// User-declared desired state of a workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Unique across the cluster.
    pub name: String,
    pub image: String,
    pub mode: ServiceMode,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<PortSpec>,
    pub secrets: Vec<SecretRef>,
    pub volumes: Vec<VolumeRef>,
    pub healthcheck: Option<HealthCheck>,
    pub limits: ResourceLimits,
    /// Grace between the soft stop signal and force-kill.
    pub stop_timeout_ms: u64,
    pub deploy: DeploySpec,
    pub labels: BTreeMap<String, String>,
}

impl ServiceSpec {
    /// A minimal replicated spec; tests and the client builder start here.
    pub fn replicated(name: impl Into<String>, image: impl Into<String>, replicas: u32) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            mode: ServiceMode::Replicated { replicas },
            env: BTreeMap::new(),
            ports: Vec::new(),
            secrets: Vec::new(),
            volumes: Vec::new(),
            healthcheck: None,
            limits: ResourceLimits::default(),
            stop_timeout_ms: 10_000,
            deploy: DeploySpec::default(),
            labels: BTreeMap::new(),
        }
    }

    /// Snapshot the per-container portion of this spec.
    pub fn container_spec(&self) -> ContainerSpec {
        ContainerSpec {
            image: self.image.clone(),
            env: self.env.clone(),
            ports: self.ports.clone(),
            secrets: self.secrets.clone(),
            volumes: self.volumes.clone(),
            healthcheck: self.healthcheck.clone(),
            limits: self.limits,
            stop_timeout_ms: self.stop_timeout_ms,
        }
    }
}

/// Progress of an in-flight version rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutState {
    /// Version being rolled out (the service's current version).
    pub target_version: u64,
    /// Version being replaced.
    pub prev_version: u64,
    /// Current canary step index; unused by rolling/blue-green.
    pub step: u32,
    /// When the current step (or batch) became fully healthy; None while
    /// still converging.
    pub stable_since: Option<Timestamp>,
    pub started: Timestamp,
}

/// A service record in the replicated store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub spec: ServiceSpec,
    /// Bumped on every spec-affecting update.
    pub version: u64,
    /// Previous version and spec, kept for rollback.
    pub previous: Option<(u64, ServiceSpec)>,
    pub rollout: Option<RolloutState>,
    pub created: Timestamp,
    pub updated: Timestamp,
}

// ============================================================================
// Containers
// ============================================================================

/// Control-plane intent for a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DesiredState {
    Running,
    Shutdown,
}

/// Worker-reported reality for a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ActualState {
    /// Created in the store, not yet observed by its worker.
    #[default]
    Pending,
    /// Observed by the worker, runtime work not started.
    Assigned,
    /// Image pull / create / start in progress.
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ActualState {
    /// Terminal states never transition again; terminal containers do not
    /// count toward a service's replica set.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, ActualState::Stopped | ActualState::Failed)
    }
}

/// Health verdict with hysteresis bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum HealthState {
    #[default]
    Unknown,
    /// Inside the start-period grace.
    Starting,
    Healthy,
    Unhealthy,
}

/// Health field group on a container record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ContainerHealth {
    pub state: HealthState,
    /// Consecutive failing probes.
    pub failing_streak: u32,
    /// Consecutive passing probes since the last failure.
    pub passing_streak: u32,
    /// Set when `state` first became Unhealthy; cleared on recovery.
    pub unhealthy_since: Option<Timestamp>,
}

/// The per-container slice of a service spec, snapshotted at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<PortSpec>,
    pub secrets: Vec<SecretRef>,
    pub volumes: Vec<VolumeRef>,
    pub healthcheck: Option<HealthCheck>,
    pub limits: ResourceLimits,
    pub stop_timeout_ms: u64,
}

/// The orchestrator-level placement record. Distinct from the runtime
/// container it commands; `runtime_handle` links the two.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    pub service_id: ServiceId,
    pub node_id: NodeId,
    /// 1..=N for replicated services; 0 for global (node-bound) containers.
    pub replica: u32,
    /// The service version that produced this container.
    pub version: u64,
    pub spec: ContainerSpec,
    pub desired: DesiredState,
    pub actual: ActualState,
    pub health: ContainerHealth,
    /// Opaque runtime container ID, set by the worker once created.
    pub runtime_handle: Option<String>,
    pub created: Timestamp,
    pub updated: Timestamp,
}

impl Container {
    /// Counts toward its service's replica set.
    pub fn is_active(&self) -> bool {
        self.desired == DesiredState::Running && !self.actual.is_terminal()
    }

    /// Running and, when a probe is declared, passing it. This is the
    /// condition deployment gates wait on.
    pub fn is_available(&self) -> bool {
        self.actual == ActualState::Running
            && (self.spec.healthcheck.is_none() || self.health.state == HealthState::Healthy)
    }
}

// ============================================================================
// Secrets & volumes
// ============================================================================

/// An encrypted secret. The store only ever sees ciphertext.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Secret {
    pub id: SecretId,
    pub name: String,
    /// AES-256-GCM, 12-byte nonce prefixed.
    pub ciphertext: Bytes,
    pub created: Timestamp,
}

/// Volume driver. Exactly one concrete driver is in scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum VolumeDriver {
    #[default]
    Local,
}

/// A named volume. Once realized on a node, it stays there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub id: VolumeId,
    pub name: String,
    pub driver: VolumeDriver,
    /// The first node the volume was realized on. Monotonic: once set, it
    /// does not change while any referencing container exists.
    pub affinity: Option<NodeId>,
    pub options: BTreeMap<String, String>,
    pub created: Timestamp,
}

// ============================================================================
// Collaborator records - replicated as opaque payloads
// ============================================================================

/// Reverse-proxy routing rule, opaque to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ingress {
    pub name: String,
    pub payload: Bytes,
    pub updated: Timestamp,
}

/// TLS certificate material for the proxy collaborator, opaque to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsCertificate {
    pub name: String,
    pub payload: Bytes,
    pub updated: Timestamp,
}

// ============================================================================
// Admission
// ============================================================================

/// A role-scoped join token. The store keeps only the secret's hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinToken {
    pub id: TokenId,
    pub role: NodeRole,
    /// SHA-256 of the 256-bit token secret.
    pub secret_hash: [u8; 32],
    pub expires: Timestamp,
    /// Manager tokens are single-use; worker tokens are reusable until
    /// expiry by default.
    pub single_use: bool,
    pub used: bool,
    pub created: Timestamp,
}

impl JoinToken {
    /// True if the token can still admit a node at `now`.
    pub fn is_valid(&self, now: Timestamp) -> bool {
        now < self.expires && !(self.single_use && self.used)
    }
}

/// Process-wide cluster configuration, seeded at bootstrap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMeta {
    pub cluster_id: Uuid,
    /// CA certificate, PEM.
    pub ca_cert_pem: String,
    /// CA private key, sealed with the cluster key.
    pub ca_key_sealed: Bytes,
    /// Public salt for deriving the cluster key from the operator
    /// passphrase. The same passphrase must be supplied on every manager.
    pub key_salt: Bytes,
    /// Sealed sentinel used to verify a candidate cluster key at startup.
    pub key_check: Bytes,
    pub created: Timestamp,
}

// ============================================================================
// Change notifications
// ============================================================================

/// A change applied to the replicated store, fanned out to
/// `StreamEvents` subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterEvent {
    ClusterInitialized { cluster_id: Uuid },
    NodeUpdated { node_id: NodeId },
    NodeRemoved { node_id: NodeId },
    ServiceUpdated { service_id: ServiceId },
    ServiceRemoved { service_id: ServiceId },
    ContainerUpdated { container_id: ContainerId },
    ContainerRemoved { container_id: ContainerId },
    SecretUpdated { secret_id: SecretId },
    SecretRemoved { secret_id: SecretId },
    VolumeUpdated { volume_id: VolumeId },
    VolumeRemoved { volume_id: VolumeId },
    IngressUpdated { name: String },
    IngressRemoved { name: String },
    TlsCertificateUpdated { name: String },
    TlsCertificateRemoved { name: String },
}

// ============================================================================
// Error taxonomy
// ============================================================================

/// Classification every Warren error maps to at the RPC boundary.
///
/// Kinds, not types: each crate keeps its own error enum and reports one of
/// these kinds so the wire layer can pick the right status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Input violates a schema or invariant.
    Validation,
    /// Referenced entity absent.
    NotFound,
    /// Name or ID conflict.
    AlreadyExists,
    /// Write issued to a follower.
    NotLeader,
    /// No quorum / consensus stalled.
    Unavailable,
    /// mTLS or token check failed.
    Unauthenticated,
    /// Authenticated but not allowed.
    PermissionDenied,
    /// Mutating call on the local transport.
    ReadOnlyEndpoint,
    /// Runtime I/O glitch; retried internally.
    Transient,
    /// Data corruption or config error; the process exits.
    Fatal,
}

impl ErrorKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not-found",
            ErrorKind::AlreadyExists => "already-exists",
            ErrorKind::NotLeader => "not-leader",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::PermissionDenied => "permission-denied",
            ErrorKind::ReadOnlyEndpoint => "read-only-endpoint",
            ErrorKind::Transient => "transient",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_hex_round_trip() {
        let id = ContainerId::generate();
        let rendered = id.to_string();
        assert_eq!(rendered.len(), 32);
        let parsed: ContainerId = rendered.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn id_parse_rejects_bad_input() {
        assert_eq!(
            "abc".parse::<NodeId>().unwrap_err(),
            IdParseError::Length(3)
        );
        let bad = "zz".repeat(16);
        assert_eq!(bad.parse::<NodeId>().unwrap_err(), IdParseError::Digit);
    }

    #[test]
    fn seq_id_gen_is_deterministic() {
        let mut a = SeqIdGen::default();
        let mut b = SeqIdGen::default();
        let first = a.container_id();
        assert_eq!(first, b.container_id());
        let second = a.container_id();
        assert_eq!(second, b.container_id());
        assert_ne!(first, second);
    }

    #[test]
    fn timestamp_arithmetic_saturates() {
        let early = Timestamp::from_millis(1_000);
        let late = Timestamp::from_millis(4_500);
        assert_eq!(late.millis_since(early), 3_500);
        assert_eq!(early.millis_since(late), 0);
        assert_eq!(early.plus_millis(500).as_millis(), 1_500);
    }

    #[test]
    fn join_token_validity_window() {
        let token = JoinToken {
            id: TokenId::generate(),
            role: NodeRole::Worker,
            secret_hash: [0; 32],
            expires: Timestamp::from_millis(10_000),
            single_use: false,
            used: false,
            created: Timestamp::from_millis(0),
        };
        assert!(token.is_valid(Timestamp::from_millis(9_999)));
        assert!(!token.is_valid(Timestamp::from_millis(10_000)));

        let spent = JoinToken {
            single_use: true,
            used: true,
            ..token
        };
        assert!(!spent.is_valid(Timestamp::from_millis(0)));
    }

    #[test]
    fn terminal_states() {
        assert!(ActualState::Stopped.is_terminal());
        assert!(ActualState::Failed.is_terminal());
        assert!(!ActualState::Running.is_terminal());
        assert!(!ActualState::Stopping.is_terminal());
        assert!(!ActualState::Pending.is_terminal());
    }

    #[test]
    fn container_spec_snapshot_matches_service() {
        let mut spec = ServiceSpec::replicated("web", "nginx:1.25", 3);
        spec.env.insert("A".into(), "1".into());
        spec.healthcheck = Some(HealthCheck::http("/", 80));
        let snap = spec.container_spec();
        assert_eq!(snap.image, "nginx:1.25");
        assert_eq!(snap.env.get("A").map(String::as_str), Some("1"));
        assert!(snap.healthcheck.is_some());
    }

    #[test]
    fn entity_postcard_round_trip() {
        let svc = Service {
            id: ServiceId::generate(),
            spec: ServiceSpec::replicated("web", "nginx:1.25", 2),
            version: 3,
            previous: None,
            rollout: None,
            created: Timestamp::from_millis(1),
            updated: Timestamp::from_millis(2),
        };
        let bytes = postcard::to_allocvec(&svc).unwrap();
        let back: Service = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, svc);
    }
}
