//! # warren-worker: the execution agent
//!
//! Runs on every host with role=worker. The agent keeps one connection to
//! the control plane (heartbeat, assignment pulls, status pushes) and one
//! supervisor task per assigned container driving the container runtime.
//!
//! Division of labor with the control plane:
//! - the worker owns `actual` state and `health`, and nothing else
//! - the worker never replaces or restarts a container on its own; a
//!   crashed container is reported failed and the reconciler decides
//! - the runtime (not the store) is the source of truth for existence

pub mod agent;
pub mod backoff;
pub mod docker;
pub mod probe;
pub mod runtime;
pub mod secrets;

pub use agent::WorkerAgent;
pub use docker::DockerRuntime;
pub use runtime::{CreateSpec, Runtime, RuntimeError, RuntimeStatus};

use warren_client::{ClientError, WarrenClient};
use warren_proto::pb;
use warren_types::{NodeId, NodeRole};

/// Worker-side errors.
#[derive(thiserror::Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("secret mount error at {path}: {source}")]
    Secrets {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("secret target '{0}' must be a bare file name")]
    BadSecretTarget(String),

    #[error("manager did not deliver secret '{0}'")]
    MissingSecret(String),
}

/// Credentials returned by a successful join.
#[derive(Debug, Clone)]
pub struct JoinedWorker {
    pub cluster_id: String,
    pub cert_pem: String,
    pub key_pem: String,
    pub ca_cert_pem: String,
    /// Manager API addresses for the mTLS connection that follows.
    pub manager_addrs: Vec<String>,
}

/// Admits this host to the cluster as a worker.
///
/// Runs over the plain admission listener; the token is the credential.
/// The returned certificate bundle backs every later mTLS connection.
pub async fn join_cluster(
    admission_addr: &str,
    token: &str,
    node_id: NodeId,
    advertise_addr: &str,
) -> Result<JoinedWorker, WorkerError> {
    let mut client = WarrenClient::connect(admission_addr, None).await?;

    let hostname = gethostname::gethostname().to_string_lossy().into_owned();
    let response = client
        .join(pb::JoinRequest {
            token: token.to_string(),
            node_id: node_id.to_string(),
            role: pb::NodeRole::from(NodeRole::Worker) as i32,
            addr: advertise_addr.to_string(),
            hostname,
            arch: std::env::consts::ARCH.to_string(),
            os: std::env::consts::OS.to_string(),
            resources: Some(agent::advertised_resources().into()),
            labels: Default::default(),
        })
        .await?;

    Ok(JoinedWorker {
        cluster_id: response.cluster_id,
        cert_pem: response.cert_pem,
        key_pem: response.key_pem,
        ca_cert_pem: response.ca_cert_pem,
        manager_addrs: response.peers.into_iter().map(|p| p.addr).collect(),
    })
}
