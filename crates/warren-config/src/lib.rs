//! # warren-config: node configuration
//!
//! Layered loading with fixed precedence:
//! 1. built-in defaults (every field has one)
//! 2. `warren.toml` in the config directory
//! 3. `WARREN_*` environment variables (`WARREN_RECONCILER_DOWN_THRESHOLD_MS=15000`)
//!
//! Timeouts carry the deployment-profile defaults from the design docs;
//! edge sites with flaky uplinks typically raise `down_threshold_ms` in
//! their `warren.toml`.

mod loader;

pub use loader::ConfigLoader;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration for a Warren process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WarrenConfig {
    pub node: NodeConfig,
    pub raft: RaftTimingConfig,
    pub manager: ManagerConfig,
    pub scheduler: SchedulerConfig,
    pub reconciler: ReconcilerConfig,
    pub worker: WorkerConfig,
}

/// Identity and storage for this process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Data directory (store file, consensus log, snapshots).
    pub data_dir: PathBuf,
    /// Address other nodes dial this one at (`host:port`).
    pub advertise_addr: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/warren"),
            advertise_addr: "127.0.0.1:7011".into(),
        }
    }
}

/// Consensus timing. Ticks are `tick_ms` long; see `warren-raft` for how
/// tick counts translate to failure detection and election latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftTimingConfig {
    pub tick_ms: u64,
    pub heartbeat_tick: u32,
    pub election_tick_min: u32,
    pub election_tick_max: u32,
    /// Applied entries between snapshots.
    pub snapshot_interval: u64,
}

impl Default for RaftTimingConfig {
    fn default() -> Self {
        Self {
            tick_ms: 50,
            heartbeat_tick: 2,
            election_tick_min: 10,
            election_tick_max: 20,
            snapshot_interval: 1024,
        }
    }
}

/// Manager-side listeners and admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// mTLS gRPC listener for remote clients, workers, and peers.
    pub listen_addr: String,
    /// Plaintext listener carrying only the admission surface (join,
    /// certificate requests). Nodes authenticate with join tokens here
    /// because they hold no cluster certificates yet.
    pub admission_addr: String,
    /// Read-only local endpoint (filesystem path).
    pub local_socket: PathBuf,
    /// Join-token lifetime.
    pub token_ttl_ms: u64,
    /// Worker tokens may admit multiple nodes until expiry.
    pub reusable_worker_tokens: bool,
    /// Sweep cadence for expired tokens.
    pub token_sweep_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7011".into(),
            admission_addr: "0.0.0.0:7012".into(),
            local_socket: PathBuf::from("/run/warren/warren.sock"),
            token_ttl_ms: 24 * 60 * 60 * 1000,
            reusable_worker_tokens: true,
            token_sweep_ms: 60_000,
        }
    }
}

/// Placement loop cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick_ms: 5_000 }
    }
}

/// Convergence loop cadence and failure-detection thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub tick_ms: u64,
    /// Heartbeat silence before a node is marked down. The original
    /// deployments ran anywhere from 15 s to 30 s; 20 s is the default
    /// profile here.
    pub down_threshold_ms: u64,
    /// How long a container may stay unhealthy before replacement.
    pub unhealthy_grace_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 10_000,
            down_threshold_ms: 20_000,
            unhealthy_grace_ms: 10_000,
        }
    }
}

/// Worker agent cadences and mounts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub heartbeat_ms: u64,
    /// Assignment poll cadence.
    pub sync_ms: u64,
    /// Root of per-container in-memory secret mounts.
    pub secrets_dir: PathBuf,
    /// Root of local-driver volume directories.
    pub volumes_dir: PathBuf,
    /// Cap for the transient-error retry backoff.
    pub backoff_cap_ms: u64,
    /// Transient bring-up failures tolerated before a container is
    /// reported failed.
    pub max_start_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: 5_000,
            sync_ms: 3_000,
            secrets_dir: PathBuf::from("/run/warren/secrets"),
            volumes_dir: PathBuf::from("/var/lib/warren/volumes"),
            backoff_cap_ms: 30_000,
            max_start_attempts: 5,
        }
    }
}
