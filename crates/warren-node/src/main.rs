//! warrend: the Warren node daemon.
//!
//! Three ways in:
//! - `warrend init` bootstraps a brand-new cluster as its first manager
//! - `warrend manager [--join TOKEN --peer ADDR]` runs a manager (joining
//!   an existing cluster on first start, resuming otherwise)
//! - `warrend worker --join TOKEN --peer ADDR` runs a worker agent

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use warren_config::{ConfigLoader, WarrenConfig};
use warren_store::DataDir;

#[derive(Parser)]
#[command(name = "warrend", version, about = "Warren edge container orchestrator daemon")]
struct Cli {
    /// Directory holding warren.toml.
    #[arg(long, default_value = "/etc/warren")]
    config_dir: PathBuf,

    /// Data directory override.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Advertise address override (host:port reachable by peers).
    #[arg(long)]
    advertise_addr: Option<String>,

    /// Environment variable holding the cluster passphrase.
    #[arg(long, default_value = "WARREN_PASSPHRASE")]
    passphrase_env: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bootstrap a new cluster and run as its first manager.
    Init,

    /// Run a manager, optionally joining an existing cluster first.
    Manager {
        /// Manager join token (first start only).
        #[arg(long, requires = "peer")]
        join: Option<String>,

        /// Address of any existing manager.
        #[arg(long)]
        peer: Option<String>,
    },

    /// Run a worker agent.
    Worker {
        /// Worker join token (first start only).
        #[arg(long, requires = "peer")]
        join: Option<String>,

        /// Address of any manager.
        #[arg(long)]
        peer: Option<String>,
    },
}

/// Marker wrapping configuration failures so they exit with their own code.
#[derive(Debug)]
struct ConfigFailure(anyhow::Error);

impl std::fmt::Display for ConfigFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {:#}", self.0)
    }
}

impl std::error::Error for ConfigFailure {}

/// Exit-code classes: 2 config, 3 leadership/availability, 4 not-found,
/// 5 validation, 1 everything else.
fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    if err.downcast_ref::<ConfigFailure>().is_some() {
        return ExitCode::from(2);
    }
    if let Some(err) = err.downcast_ref::<warren_manager::ManagerError>() {
        use warren_types::ErrorKind;
        return match err.kind() {
            ErrorKind::NotLeader | ErrorKind::Unavailable => ExitCode::from(3),
            ErrorKind::NotFound => ExitCode::from(4),
            ErrorKind::Validation => ExitCode::from(5),
            _ => ExitCode::from(1),
        };
    }
    ExitCode::from(1)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "cannot start async runtime");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "warrend failed");
            exit_code_for(&err)
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ConfigLoader::new()
        .with_config_dir(&cli.config_dir)
        .load()
        .map_err(|e| anyhow::Error::new(ConfigFailure(e)))?;
    if let Some(data_dir) = &cli.data_dir {
        config.node.data_dir.clone_from(data_dir);
    }
    if let Some(addr) = &cli.advertise_addr {
        config.node.advertise_addr.clone_from(addr);
    }

    match cli.command {
        Command::Init => {
            let passphrase = read_passphrase(&cli.passphrase_env)?;
            run_manager(config, passphrase, warren_manager::StartMode::Bootstrap).await
        }
        Command::Manager { join, peer } => {
            let passphrase = read_passphrase(&cli.passphrase_env)?;
            let mode = match (join, peer) {
                (Some(token), Some(remote_addr)) => warren_manager::StartMode::Join {
                    remote_addr,
                    token,
                },
                _ => warren_manager::StartMode::Resume,
            };
            run_manager(config, passphrase, mode).await
        }
        Command::Worker { join, peer } => run_worker(config, join, peer).await,
    }
}

fn read_passphrase(env_var: &str) -> anyhow::Result<String> {
    std::env::var(env_var).with_context(|| {
        format!("cluster passphrase expected in environment variable {env_var}")
    })
}

async fn run_manager(
    config: WarrenConfig,
    passphrase: String,
    mode: warren_manager::StartMode,
) -> anyhow::Result<()> {
    let handle = warren_manager::start(config, passphrase, mode)
        .await
        .context("starting manager")?;
    info!(node = %handle.node_id, "manager running; Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutting down");
    for task in handle.tasks {
        task.abort();
    }
    Ok(())
}

async fn run_worker(
    config: WarrenConfig,
    join: Option<String>,
    peer: Option<String>,
) -> anyhow::Result<()> {
    let data_dir = DataDir::new(config.node.data_dir.clone()).context("opening data dir")?;
    let node_id = warren_store::load_or_create_node_id(&data_dir)?;

    // First start joins; later starts reuse persisted credentials.
    let manager_addr_file = data_dir.root().join("manager_addr");
    let (manager_addr, tls) = match (&join, &peer) {
        (Some(token), Some(peer)) => {
            let joined = warren_worker::join_cluster(
                peer,
                token,
                node_id,
                &config.node.advertise_addr,
            )
            .await
            .context("joining cluster")?;
            std::fs::write(&data_dir.cert_file(), &joined.cert_pem)?;
            std::fs::write(&data_dir.key_file(), &joined.key_pem)?;
            std::fs::write(&data_dir.ca_file(), &joined.ca_cert_pem)?;
            // The join ran on the admission listener; day-to-day traffic
            // goes to a manager's mTLS API address.
            let api_addr = joined
                .manager_addrs
                .first()
                .cloned()
                .unwrap_or_else(|| peer.clone());
            std::fs::write(&manager_addr_file, &api_addr)?;
            info!(cluster = %joined.cluster_id, "joined cluster");
            (api_addr, client_tls(&data_dir)?)
        }
        _ => {
            let addr = std::fs::read_to_string(&manager_addr_file)
                .context("no manager address on record; run with --join and --peer first")?;
            (addr.trim().to_string(), client_tls(&data_dir)?)
        }
    };

    let client = warren_client::WarrenClient::connect(manager_addr, tls)
        .await
        .context("connecting to manager")?;
    let runtime = Arc::new(warren_worker::DockerRuntime::connect()?);
    let agent =
        warren_worker::WorkerAgent::new(node_id, config.worker.clone(), runtime, client);

    info!(node = %node_id, "worker running; Ctrl-C to stop");
    tokio::select! {
        () = agent.run() => Ok(()),
        result = tokio::signal::ctrl_c() => {
            result.context("signal handler")?;
            info!("shutting down");
            Ok(())
        }
    }
}

fn client_tls(data_dir: &DataDir) -> anyhow::Result<Option<tonic::transport::ClientTlsConfig>> {
    let read = |p: std::path::PathBuf| std::fs::read_to_string(p).ok();
    match (
        read(data_dir.cert_file()),
        read(data_dir.key_file()),
        read(data_dir.ca_file()),
    ) {
        (Some(cert), Some(key), Some(ca)) => Ok(Some(
            tonic::transport::ClientTlsConfig::new()
                .identity(tonic::transport::Identity::from_pem(cert, key))
                .ca_certificate(tonic::transport::Certificate::from_pem(ca)),
        )),
        _ => Ok(None),
    }
}
