//! # warren-manager: the control-plane node
//!
//! Assembles a manager process: the consensus runtime around the pure
//! raft core and kernel, the gRPC gateway (remote mTLS listener plus the
//! read-only local socket), the leader-gated control loops, and the
//! bootstrap/join flows.
//!
//! The store is the only shared mutable state; every component reads the
//! applied-state watch and writes through the gateway's propose path.

pub mod bootstrap;
pub mod error;
pub mod handler;
pub mod loops;
pub mod runtime;
pub mod tls;

pub use error::ManagerError;
pub use runtime::{Gateway, LeaderView};

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use warren_config::WarrenConfig;
use warren_kernel::Command;
use warren_raft::Membership;
use warren_store::DataDir;
use warren_types::{Node, NodeId, NodeRole, NodeStatus, Timestamp};

/// How this process enters the cluster.
pub enum StartMode {
    /// First manager: create the cluster.
    Bootstrap,
    /// Additional manager: admitted by an existing one.
    Join {
        remote_addr: String,
        token: String,
    },
    /// Restart over an existing data directory.
    Resume,
}

/// A running manager: its gateway plus the background task handles.
pub struct ManagerHandle {
    pub gateway: Gateway,
    pub node_id: NodeId,
    pub tasks: Vec<JoinHandle<()>>,
}

/// Starts a manager process end to end.
pub async fn start(
    config: WarrenConfig,
    passphrase: String,
    mode: StartMode,
) -> Result<ManagerHandle, ManagerError> {
    let data_dir = DataDir::new(config.node.data_dir.clone())?;
    let node_id = warren_store::load_or_create_node_id(&data_dir)?;
    let advertise = config.node.advertise_addr.clone();

    // Bootstrapping or joining over an initialized data directory would
    // mint fresh key material and orphan the existing cluster state.
    let initialized =
        warren_store::latest_snapshot(&data_dir.snapshot_dir())?.is_some();
    if initialized && !matches!(mode, StartMode::Resume) {
        return Err(ManagerError::Validation(
            "data directory is already initialized; start with `warrend manager` to resume"
                .into(),
        ));
    }

    // Seed material per mode. `Resume` relies on the snapshot on disk.
    let mut pre_unlocked_key = None;
    let mut init_cluster = None;
    let seed_membership = match &mode {
        StartMode::Bootstrap => {
            let now = Timestamp::now();
            let (meta, key) = bootstrap::new_cluster_meta(&passphrase, now)?;
            write_own_certificate(&data_dir, &meta, &key, node_id, &advertise)?;
            pre_unlocked_key = Some(key);
            init_cluster = Some(meta);
            Some(Membership::bootstrap(node_id, advertise.clone()))
        }
        StartMode::Join { remote_addr, token } => {
            let joined = join_remote(remote_addr, token, node_id, &config).await?;
            persist_pki(&data_dir, &joined.cert_pem, &joined.key_pem, &joined.ca_cert_pem)?;
            let mut membership = Membership::default();
            for peer in &joined.peers {
                let id: NodeId = peer.id.parse().map_err(|_| {
                    ManagerError::Validation(format!("malformed peer id '{}'", peer.id))
                })?;
                membership.apply(&warren_raft::ConfChange::AddVoter {
                    id,
                    addr: peer.addr.clone(),
                });
            }
            Some(membership)
        }
        StartMode::Resume => None,
    };

    // Consensus runtime + transport.
    let (outbound_tx, outbound_rx) = mpsc::channel(1024);
    let (raft_runtime, gateway) = runtime::RaftRuntime::open(
        node_id,
        data_dir.clone(),
        seed_membership,
        config.raft,
        outbound_tx,
    )?;

    let client_tls = load_client_tls(&data_dir)?;
    let mut tasks = vec![
        tokio::spawn(raft_runtime.run()),
        tokio::spawn(runtime::run_transport(outbound_rx, client_tls)),
    ];

    // Listeners.
    let ctx = match pre_unlocked_key {
        Some(key) => Arc::new(handler::Ctx::with_key(
            gateway.clone(),
            config.clone(),
            passphrase,
            key,
        )),
        None => Arc::new(handler::Ctx::new(
            gateway.clone(),
            config.clone(),
            passphrase,
        )),
    };
    tasks.push(serve_remote(ctx.clone(), &config, &data_dir)?);
    tasks.push(serve_admission(ctx.clone(), &config)?);
    tasks.push(serve_local(ctx, &config)?);

    // Control loops (inert until this node leads).
    tasks.extend(loops::spawn_control_loops(gateway.clone(), &config));

    // First-boot cluster initialization runs once we lead the (single
    // member) group.
    if let Some(meta) = init_cluster {
        gateway.wait_for_leader().await;
        if gateway.state().cluster().is_none() {
            gateway.propose(Command::InitCluster { meta }).await?;
            info!("cluster initialized");
        }
    }

    // Every manager records itself as a node.
    register_self(&gateway, node_id, &advertise, matches!(mode, StartMode::Join { .. })).await;

    Ok(ManagerHandle {
        gateway,
        node_id,
        tasks,
    })
}

/// Writes the manager's own node record. Join mode already did this on the
/// remote leader; bootstrap and resume do it here, best-effort (a resumed
/// follower simply gets `NotLeader` and relies on its existing record).
async fn register_self(gateway: &Gateway, node_id: NodeId, advertise: &str, joined: bool) {
    if joined || gateway.state().get_node(&node_id).is_some() {
        return;
    }
    let now = Timestamp::now();
    let node = Node {
        id: node_id,
        role: NodeRole::Manager,
        addr: advertise.to_string(),
        hostname: gethostname_or_default(),
        arch: std::env::consts::ARCH.to_string(),
        os: std::env::consts::OS.to_string(),
        labels: Default::default(),
        resources: Default::default(),
        status: NodeStatus::Ready,
        last_heartbeat: now,
        created: now,
    };
    if let Err(err) = gateway.propose(Command::UpsertNode { node }).await {
        warn!(error = %err, "could not register own node record");
    }
}

fn gethostname_or_default() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

/// Result of the remote join call a new manager makes.
struct Joined {
    cert_pem: String,
    key_pem: String,
    ca_cert_pem: String,
    peers: Vec<warren_proto::pb::Peer>,
}

async fn join_remote(
    remote_addr: &str,
    token: &str,
    node_id: NodeId,
    config: &WarrenConfig,
) -> Result<Joined, ManagerError> {
    use warren_proto::pb::cluster_client::ClusterClient;
    use warren_proto::pb::{JoinRequest, NodeRole as PbRole};

    // Join runs before this node holds any cluster credentials; the token
    // is the authentication, so the admission channel is plain HTTP/2.
    let endpoint = tonic::transport::Channel::from_shared(format!("http://{remote_addr}"))
        .map_err(|_| {
            ManagerError::Validation(format!("malformed manager address '{remote_addr}'"))
        })?;
    let channel = endpoint
        .connect()
        .await
        .map_err(|e| ManagerError::Unavailable(format!("cannot reach {remote_addr}: {e}")))?;

    let mut client = ClusterClient::new(channel);
    let response = client
        .join(JoinRequest {
            token: token.to_string(),
            node_id: node_id.to_string(),
            role: PbRole::Manager as i32,
            addr: config.node.advertise_addr.clone(),
            hostname: gethostname_or_default(),
            arch: std::env::consts::ARCH.to_string(),
            os: std::env::consts::OS.to_string(),
            resources: None,
            labels: Default::default(),
        })
        .await
        .map_err(|status| ManagerError::Unauthenticated(status.message().to_string()))?
        .into_inner();

    Ok(Joined {
        cert_pem: response.cert_pem,
        key_pem: response.key_pem,
        ca_cert_pem: response.ca_cert_pem,
        peers: response.peers,
    })
}

/// Issues and persists this manager's own leaf at bootstrap time.
fn write_own_certificate(
    data_dir: &DataDir,
    meta: &warren_types::ClusterMeta,
    key: &warren_crypto::ClusterKey,
    node_id: NodeId,
    advertise: &str,
) -> Result<(), ManagerError> {
    let ca_key = bootstrap::unseal_ca_key(meta, key)?;
    let host = advertise.split(':').next().unwrap_or(advertise).to_string();
    let bundle = warren_crypto::ca::issue_leaf(
        &meta.ca_cert_pem,
        &ca_key,
        node_id,
        NodeRole::Manager,
        &[host],
    )?;
    persist_pki(data_dir, &bundle.cert_pem, &bundle.key_pem, &meta.ca_cert_pem)
}

/// PEM files stay plain on disk so operators can inspect and rotate them.
fn persist_pki(
    data_dir: &DataDir,
    cert_pem: &str,
    key_pem: &str,
    ca_pem: &str,
) -> Result<(), ManagerError> {
    for (path, contents) in [
        (data_dir.cert_file(), cert_pem),
        (data_dir.key_file(), key_pem),
        (data_dir.ca_file(), ca_pem),
    ] {
        std::fs::write(&path, contents)
            .map_err(|e| warren_store::StoreError::io(&path, e))?;
    }
    Ok(())
}

fn load_pki(data_dir: &DataDir) -> Result<Option<(String, String, String)>, ManagerError> {
    let read = |path: std::path::PathBuf| -> Result<Option<String>, ManagerError> {
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(warren_store::StoreError::io(&path, e).into()),
        }
    };
    match (
        read(data_dir.cert_file())?,
        read(data_dir.key_file())?,
        read(data_dir.ca_file())?,
    ) {
        (Some(cert), Some(key), Some(ca)) => Ok(Some((cert, key, ca))),
        _ => Ok(None),
    }
}

fn load_client_tls(
    data_dir: &DataDir,
) -> Result<Option<tonic::transport::ClientTlsConfig>, ManagerError> {
    Ok(load_pki(data_dir)?.map(|(cert, key, ca)| tls::client_mtls(&cert, &key, &ca)))
}

fn serve_remote(
    ctx: Arc<handler::Ctx>,
    config: &WarrenConfig,
    data_dir: &DataDir,
) -> Result<JoinHandle<()>, ManagerError> {
    let addr: std::net::SocketAddr = config.manager.listen_addr.parse().map_err(|_| {
        ManagerError::Validation(format!(
            "malformed listen address '{}'",
            config.manager.listen_addr
        ))
    })?;

    let server_tls = load_pki(data_dir)?
        .map(|(cert, key, ca)| tls::server_mtls(&cert, &key, &ca));
    if server_tls.is_none() {
        warn!("no pki material in the data dir; remote listener runs without TLS");
    }
    let router = handler::build_router(ctx, false, server_tls)
        .map_err(|e| ManagerError::Validation(format!("tls configuration rejected: {e}")))?;

    info!(%addr, "remote gRPC listener starting");
    Ok(tokio::spawn(async move {
        if let Err(err) = router.serve(addr).await {
            tracing::error!(error = %err, "remote listener failed");
        }
    }))
}

/// The admission listener: plaintext, Cluster service only. Joining nodes
/// hold no cluster certificates yet; their join token is the credential.
fn serve_admission(
    ctx: Arc<handler::Ctx>,
    config: &WarrenConfig,
) -> Result<JoinHandle<()>, ManagerError> {
    let addr: std::net::SocketAddr = config.manager.admission_addr.parse().map_err(|_| {
        ManagerError::Validation(format!(
            "malformed admission address '{}'",
            config.manager.admission_addr
        ))
    })?;

    let router = tonic::transport::Server::builder().add_service(
        warren_proto::pb::cluster_server::ClusterServer::new(handler::ClusterApi {
            ctx,
            read_only: false,
        }),
    );

    info!(%addr, "admission listener starting");
    Ok(tokio::spawn(async move {
        if let Err(err) = router.serve(addr).await {
            tracing::error!(error = %err, "admission listener failed");
        }
    }))
}

fn serve_local(
    ctx: Arc<handler::Ctx>,
    config: &WarrenConfig,
) -> Result<JoinHandle<()>, ManagerError> {
    let path = config.manager.local_socket.clone();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| warren_store::StoreError::io(parent, e))
            .map_err(ManagerError::from)?;
    }
    // A stale socket from a previous run blocks bind.
    let _ = std::fs::remove_file(&path);

    let listener = std::os::unix::net::UnixListener::bind(&path)
        .map_err(|e| warren_store::StoreError::io(&path, e))
        .map_err(ManagerError::from)?;
    listener
        .set_nonblocking(true)
        .map_err(|e| warren_store::StoreError::io(&path, e))
        .map_err(ManagerError::from)?;
    let listener = tokio::net::UnixListener::from_std(listener)
        .map_err(|e| warren_store::StoreError::io(&path, e))
        .map_err(ManagerError::from)?;

    let router = handler::build_router(ctx, true, None)
        .map_err(|e| ManagerError::Validation(format!("tls configuration rejected: {e}")))?;

    info!(path = %path.display(), "read-only local listener starting");
    Ok(tokio::spawn(async move {
        let incoming = tokio_stream::wrappers::UnixListenerStream::new(listener);
        if let Err(err) = router.serve_with_incoming(incoming).await {
            tracing::error!(error = %err, "local listener failed");
        }
    }))
}
