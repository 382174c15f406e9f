//! gRPC service implementations.
//!
//! Every handler reads from the local applied state (bounded staleness on
//! followers) and routes writes through the gateway, which fails with
//! `NotLeader` + leader address on a follower. The same handler structs
//! serve the local socket with `read_only = true`, where every mutating
//! method answers with the structured read-only rejection.

use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status};
use tracing::info;

use warren_config::WarrenConfig;
use warren_kernel::{Command, State};
use warren_proto::convert;
use warren_proto::pb;
use warren_proto::status::{read_only_endpoint, status as kind_status};
use warren_types::{
    ErrorKind, JoinToken, Node, NodeId, NodeRole, Secret, SecretId, Service, ServiceId,
    Timestamp, TokenId, Volume, VolumeDriver, VolumeId,
};

use crate::bootstrap::unseal_ca_key;
use crate::error::ManagerError;
use crate::runtime::Gateway;

/// Shared handler context.
pub struct Ctx {
    pub gateway: Gateway,
    pub config: WarrenConfig,
    passphrase: String,
    key: std::sync::OnceLock<warren_crypto::ClusterKey>,
}

impl Ctx {
    pub fn new(gateway: Gateway, config: WarrenConfig, passphrase: String) -> Self {
        Self {
            gateway,
            config,
            passphrase,
            key: std::sync::OnceLock::new(),
        }
    }

    /// Bootstrap already holds the unlocked key; skip the lazy derivation.
    pub fn with_key(
        gateway: Gateway,
        config: WarrenConfig,
        passphrase: String,
        key: warren_crypto::ClusterKey,
    ) -> Self {
        let cell = std::sync::OnceLock::new();
        let _ = cell.set(key);
        Self {
            gateway,
            config,
            passphrase,
            key: cell,
        }
    }

    fn state(&self) -> Arc<State> {
        self.gateway.state()
    }

    fn cluster_meta(&self) -> Result<warren_types::ClusterMeta, Status> {
        self.state()
            .cluster()
            .cloned()
            .ok_or_else(|| kind_status(ErrorKind::Unavailable, "cluster is not initialized yet"))
    }

    /// The cluster key, derived lazily once the replicated cluster
    /// configuration is visible (a just-joined manager may serve reads
    /// before the log has caught it up).
    fn cluster_key(&self) -> Result<&warren_crypto::ClusterKey, Status> {
        if let Some(key) = self.key.get() {
            return Ok(key);
        }
        let meta = self.cluster_meta()?;
        let key = crate::bootstrap::unlock_cluster_key(&meta, &self.passphrase)
            .map_err(Status::from)?;
        let _ = self.key.set(key);
        Ok(self.key.get().expect("key cell was just set"))
    }
}

fn guard_writes(read_only: bool) -> Result<(), Status> {
    if read_only {
        Err(read_only_endpoint())
    } else {
        Ok(())
    }
}

/// Resolves a service by ID or name.
fn resolve_service(state: &State, key: &str) -> Result<Service, Status> {
    if let Ok(id) = key.parse::<ServiceId>() {
        if let Some(service) = state.get_service(&id) {
            return Ok(service.clone());
        }
    }
    state
        .service_by_name(key)
        .cloned()
        .ok_or_else(|| kind_status(ErrorKind::NotFound, format!("service '{key}' not found")))
}

fn parse_node_id(value: &str) -> Result<NodeId, Status> {
    value
        .parse()
        .map_err(|_| kind_status(ErrorKind::Validation, format!("malformed node id '{value}'")))
}

// ============================================================================
// Cluster
// ============================================================================

pub struct ClusterApi {
    pub ctx: Arc<Ctx>,
    pub read_only: bool,
}

#[tonic::async_trait]
impl pb::cluster_server::Cluster for ClusterApi {
    async fn generate_join_token(
        &self,
        request: Request<pb::GenerateJoinTokenRequest>,
    ) -> Result<Response<pb::GenerateJoinTokenResponse>, Status> {
        guard_writes(self.read_only)?;
        let role = convert::node_role(request.into_inner().role)?;

        let now = Timestamp::now();
        let generated = warren_crypto::token::generate(role);
        let expires = now.plus_millis(self.ctx.config.manager.token_ttl_ms);
        let single_use = role == NodeRole::Manager
            || !self.ctx.config.manager.reusable_worker_tokens;

        let token = JoinToken {
            id: TokenId::generate(),
            role,
            secret_hash: generated.hash,
            expires,
            single_use,
            used: false,
            created: now,
        };
        self.ctx
            .gateway
            .propose(Command::PutJoinToken { token })
            .await
            .map_err(Status::from)?;

        Ok(Response::new(pb::GenerateJoinTokenResponse {
            token: generated.secret,
            expires_ms: expires.as_millis(),
        }))
    }

    async fn join(
        &self,
        request: Request<pb::JoinRequest>,
    ) -> Result<Response<pb::JoinResponse>, Status> {
        guard_writes(self.read_only)?;
        let req = request.into_inner();
        let now = Timestamp::now();

        let claimed_role = convert::node_role(req.role)?;
        let node_id = parse_node_id(&req.node_id)?;
        let token = self.authenticate_token(&req.token, claimed_role, now)?;

        self.ctx
            .gateway
            .propose(Command::ConsumeJoinToken {
                token_id: token.id,
                now,
            })
            .await
            .map_err(Status::from)?;

        // Admit the node record.
        let node = Node {
            id: node_id,
            role: claimed_role,
            addr: req.addr.clone(),
            hostname: req.hostname,
            arch: req.arch,
            os: req.os,
            labels: req.labels,
            resources: req.resources.map(Into::into).unwrap_or_default(),
            status: warren_types::NodeStatus::Ready,
            last_heartbeat: now,
            created: now,
        };
        self.ctx
            .gateway
            .propose(Command::UpsertNode { node })
            .await
            .map_err(Status::from)?;

        // Managers additionally become consensus voters.
        if claimed_role == NodeRole::Manager {
            self.ctx
                .gateway
                .propose_conf_change(warren_raft::ConfChange::AddVoter {
                    id: node_id,
                    addr: req.addr.clone(),
                })
                .await
                .map_err(Status::from)?;
        }

        let meta = self.ctx.cluster_meta()?;
        let bundle = self.issue_certificate(&meta, node_id, claimed_role, &req.addr)?;

        info!(node = %node_id, role = %claimed_role, addr = %req.addr, "node joined");
        Ok(Response::new(pb::JoinResponse {
            cluster_id: meta.cluster_id.to_string(),
            ca_cert_pem: meta.ca_cert_pem,
            cert_pem: bundle.cert_pem,
            key_pem: bundle.key_pem,
            peers: manager_peers(&self.ctx.state()),
        }))
    }

    async fn get_cluster_info(
        &self,
        _request: Request<pb::Empty>,
    ) -> Result<Response<pb::ClusterInfo>, Status> {
        let meta = self.ctx.cluster_meta()?;
        let leader = self.ctx.gateway.leader();
        Ok(Response::new(pb::ClusterInfo {
            cluster_id: meta.cluster_id.to_string(),
            leader_id: leader.leader_id.map(|id| id.to_string()).unwrap_or_default(),
            leader_addr: leader.leader_addr.unwrap_or_default(),
            managers: manager_peers(&self.ctx.state()),
        }))
    }

    async fn request_certificate(
        &self,
        request: Request<pb::RequestCertificateRequest>,
    ) -> Result<Response<pb::CertificateResponse>, Status> {
        guard_writes(self.read_only)?;
        let req = request.into_inner();
        let now = Timestamp::now();

        let role = warren_crypto::token::parse_role(&req.token).ok_or_else(|| {
            kind_status(ErrorKind::Unauthenticated, "malformed join token")
        })?;
        // Certificate renewal validates the token but does not consume it.
        self.authenticate_token(&req.token, role, now)?;
        let node_id = parse_node_id(&req.node_id)?;

        let meta = self.ctx.cluster_meta()?;
        let host = req.hosts.first().cloned().unwrap_or_default();
        let bundle = self.issue_certificate(&meta, node_id, role, &host)?;
        Ok(Response::new(pb::CertificateResponse {
            cert_pem: bundle.cert_pem,
            key_pem: bundle.key_pem,
            ca_cert_pem: meta.ca_cert_pem,
        }))
    }
}

impl ClusterApi {
    /// Verifies a presented token secret against the stored hashes.
    fn authenticate_token(
        &self,
        secret: &str,
        claimed_role: NodeRole,
        now: Timestamp,
    ) -> Result<JoinToken, Status> {
        let parsed_role = warren_crypto::token::parse_role(secret).ok_or_else(|| {
            kind_status(ErrorKind::Unauthenticated, "malformed join token")
        })?;
        if parsed_role != claimed_role {
            return Err(kind_status(
                ErrorKind::Unauthenticated,
                "join token role does not match the requested role",
            ));
        }

        let hash = warren_crypto::token::hash(secret);
        let state = self.ctx.state();
        let token = state
            .tokens()
            .values()
            .find(|t| t.secret_hash == hash)
            .cloned()
            .ok_or_else(|| kind_status(ErrorKind::Unauthenticated, "unknown join token"))?;

        if token.role != claimed_role || !token.is_valid(now) {
            return Err(kind_status(
                ErrorKind::Unauthenticated,
                "join token is expired or already used",
            ));
        }
        Ok(token)
    }

    fn issue_certificate(
        &self,
        meta: &warren_types::ClusterMeta,
        node_id: NodeId,
        role: NodeRole,
        addr: &str,
    ) -> Result<warren_crypto::ca::CertBundle, Status> {
        let ca_key = unseal_ca_key(meta, self.ctx.cluster_key()?).map_err(Status::from)?;
        let host = addr.split(':').next().unwrap_or(addr).to_string();
        warren_crypto::ca::issue_leaf(&meta.ca_cert_pem, &ca_key, node_id, role, &[host])
            .map_err(|e| Status::from(ManagerError::from(e)))
    }
}

fn manager_peers(state: &State) -> Vec<pb::Peer> {
    state
        .nodes()
        .values()
        .filter(|n| n.role == NodeRole::Manager)
        .map(|n| pb::Peer {
            id: n.id.to_string(),
            addr: n.addr.clone(),
        })
        .collect()
}

// ============================================================================
// Nodes
// ============================================================================

pub struct NodesApi {
    pub ctx: Arc<Ctx>,
    pub read_only: bool,
}

#[tonic::async_trait]
impl pb::nodes_server::Nodes for NodesApi {
    async fn report_heartbeat(
        &self,
        request: Request<pb::HeartbeatRequest>,
    ) -> Result<Response<pb::Empty>, Status> {
        guard_writes(self.read_only)?;
        let req = request.into_inner();
        let node_id = parse_node_id(&req.node_id)?;

        self.ctx
            .gateway
            .propose(Command::NodeHeartbeat {
                node_id,
                now: Timestamp::now(),
                resources: req.resources.map(Into::into),
            })
            .await
            .map_err(Status::from)?;
        Ok(Response::new(pb::Empty {}))
    }

    async fn list_nodes(
        &self,
        _request: Request<pb::Empty>,
    ) -> Result<Response<pb::ListNodesResponse>, Status> {
        let state = self.ctx.state();
        Ok(Response::new(pb::ListNodesResponse {
            nodes: state.nodes().values().map(pb::Node::from).collect(),
        }))
    }

    async fn get_node(
        &self,
        request: Request<pb::NodeRef>,
    ) -> Result<Response<pb::Node>, Status> {
        let node_id = parse_node_id(&request.into_inner().node_id)?;
        let state = self.ctx.state();
        let node = state
            .get_node(&node_id)
            .ok_or_else(|| kind_status(ErrorKind::NotFound, format!("node {node_id} not found")))?;
        Ok(Response::new(pb::Node::from(node)))
    }

    async fn remove_node(
        &self,
        request: Request<pb::NodeRef>,
    ) -> Result<Response<pb::Empty>, Status> {
        guard_writes(self.read_only)?;
        let node_id = parse_node_id(&request.into_inner().node_id)?;
        self.ctx
            .gateway
            .propose(Command::RemoveNode { node_id })
            .await
            .map_err(Status::from)?;
        Ok(Response::new(pb::Empty {}))
    }
}

// ============================================================================
// Services
// ============================================================================

pub struct ServicesApi {
    pub ctx: Arc<Ctx>,
    pub read_only: bool,
}

impl ServicesApi {
    /// Reads a service back after a write so responses show applied state.
    fn loaded(&self, id: ServiceId) -> Result<Response<pb::Service>, Status> {
        let state = self.ctx.state();
        let service = state
            .get_service(&id)
            .ok_or_else(|| kind_status(ErrorKind::NotFound, "service vanished mid-request"))?;
        Ok(Response::new(pb::Service::from(service)))
    }
}

#[tonic::async_trait]
impl pb::services_server::Services for ServicesApi {
    async fn create_service(
        &self,
        request: Request<pb::CreateServiceRequest>,
    ) -> Result<Response<pb::Service>, Status> {
        guard_writes(self.read_only)?;
        let spec = request
            .into_inner()
            .spec
            .ok_or_else(|| kind_status(ErrorKind::Validation, "missing service spec"))?;
        let spec = warren_types::ServiceSpec::try_from(spec)?;

        // Identical re-creation is idempotent; a different spec under the
        // same name conflicts.
        if let Some(existing) = self.ctx.state().service_by_name(&spec.name) {
            if existing.spec == spec {
                return self.loaded(existing.id);
            }
            return Err(kind_status(
                ErrorKind::AlreadyExists,
                format!("service with name '{}' already exists", spec.name),
            ));
        }

        let service_id = ServiceId::generate();
        self.ctx
            .gateway
            .propose(Command::CreateService {
                service_id,
                spec,
                now: Timestamp::now(),
            })
            .await
            .map_err(Status::from)?;
        self.loaded(service_id)
    }

    async fn get_service(
        &self,
        request: Request<pb::ServiceRef>,
    ) -> Result<Response<pb::Service>, Status> {
        let service = resolve_service(&self.ctx.state(), &request.into_inner().service)?;
        Ok(Response::new(pb::Service::from(&service)))
    }

    async fn list_services(
        &self,
        _request: Request<pb::Empty>,
    ) -> Result<Response<pb::ListServicesResponse>, Status> {
        let state = self.ctx.state();
        Ok(Response::new(pb::ListServicesResponse {
            services: state.services().values().map(pb::Service::from).collect(),
        }))
    }

    async fn update_service(
        &self,
        request: Request<pb::UpdateServiceRequest>,
    ) -> Result<Response<pb::Service>, Status> {
        guard_writes(self.read_only)?;
        let req = request.into_inner();
        let service = resolve_service(&self.ctx.state(), &req.service)?;
        let spec = req
            .spec
            .ok_or_else(|| kind_status(ErrorKind::Validation, "missing service spec"))?;

        self.ctx
            .gateway
            .propose(Command::UpdateService {
                service_id: service.id,
                spec: warren_types::ServiceSpec::try_from(spec)?,
                now: Timestamp::now(),
            })
            .await
            .map_err(Status::from)?;
        self.loaded(service.id)
    }

    async fn scale_service(
        &self,
        request: Request<pb::ScaleServiceRequest>,
    ) -> Result<Response<pb::Service>, Status> {
        guard_writes(self.read_only)?;
        let req = request.into_inner();
        let service = resolve_service(&self.ctx.state(), &req.service)?;

        self.ctx
            .gateway
            .propose(Command::ScaleService {
                service_id: service.id,
                replicas: req.replicas,
                now: Timestamp::now(),
            })
            .await
            .map_err(Status::from)?;
        self.loaded(service.id)
    }

    async fn update_service_image(
        &self,
        request: Request<pb::UpdateServiceImageRequest>,
    ) -> Result<Response<pb::Service>, Status> {
        guard_writes(self.read_only)?;
        let req = request.into_inner();
        let service = resolve_service(&self.ctx.state(), &req.service)?;

        let mut spec = service.spec.clone();
        spec.image = req.image;
        self.ctx
            .gateway
            .propose(Command::UpdateService {
                service_id: service.id,
                spec,
                now: Timestamp::now(),
            })
            .await
            .map_err(Status::from)?;
        self.loaded(service.id)
    }

    async fn rollback_service(
        &self,
        request: Request<pb::ServiceRef>,
    ) -> Result<Response<pb::Service>, Status> {
        guard_writes(self.read_only)?;
        let service = resolve_service(&self.ctx.state(), &request.into_inner().service)?;
        self.ctx
            .gateway
            .propose(Command::RollbackService {
                service_id: service.id,
                now: Timestamp::now(),
            })
            .await
            .map_err(Status::from)?;
        self.loaded(service.id)
    }

    async fn delete_service(
        &self,
        request: Request<pb::ServiceRef>,
    ) -> Result<Response<pb::Empty>, Status> {
        guard_writes(self.read_only)?;
        let service = resolve_service(&self.ctx.state(), &request.into_inner().service)?;
        self.ctx
            .gateway
            .propose(Command::DeleteService {
                service_id: service.id,
            })
            .await
            .map_err(Status::from)?;
        Ok(Response::new(pb::Empty {}))
    }
}

// ============================================================================
// Containers
// ============================================================================

pub struct ContainersApi {
    pub ctx: Arc<Ctx>,
    pub read_only: bool,
}

#[tonic::async_trait]
impl pb::containers_server::Containers for ContainersApi {
    async fn list_containers(
        &self,
        request: Request<pb::ListContainersRequest>,
    ) -> Result<Response<pb::ListContainersResponse>, Status> {
        let req = request.into_inner();
        let state = self.ctx.state();

        let service_filter = match &req.service {
            Some(key) => Some(resolve_service(&state, key)?.id),
            None => None,
        };
        let node_filter = match &req.node_id {
            Some(id) => Some(parse_node_id(id)?),
            None => None,
        };

        let containers = state
            .containers()
            .values()
            .filter(|c| service_filter.map_or(true, |id| c.service_id == id))
            .filter(|c| node_filter.map_or(true, |id| c.node_id == id))
            .map(pb::Container::from)
            .collect();
        Ok(Response::new(pb::ListContainersResponse { containers }))
    }

    async fn update_container_status(
        &self,
        request: Request<pb::UpdateContainerStatusRequest>,
    ) -> Result<Response<pb::Empty>, Status> {
        guard_writes(self.read_only)?;
        let req = request.into_inner();
        let container_id = req
            .container_id
            .parse()
            .map_err(|_| kind_status(ErrorKind::Validation, "malformed container id"))?;

        self.ctx
            .gateway
            .propose(Command::SetContainerActualState {
                container_id,
                actual: convert::actual_state(req.actual)?,
                runtime_handle: req.runtime_handle,
                now: Timestamp::now(),
            })
            .await
            .map_err(Status::from)?;
        Ok(Response::new(pb::Empty {}))
    }

    async fn report_container_health(
        &self,
        request: Request<pb::ReportContainerHealthRequest>,
    ) -> Result<Response<pb::Empty>, Status> {
        guard_writes(self.read_only)?;
        let req = request.into_inner();
        let container_id = req
            .container_id
            .parse()
            .map_err(|_| kind_status(ErrorKind::Validation, "malformed container id"))?;
        let health = req
            .health
            .ok_or_else(|| kind_status(ErrorKind::Validation, "missing health"))?;

        self.ctx
            .gateway
            .propose(Command::SetContainerHealth {
                container_id,
                health: warren_types::ContainerHealth::try_from(health)?,
                now: Timestamp::now(),
            })
            .await
            .map_err(Status::from)?;
        Ok(Response::new(pb::Empty {}))
    }

    async fn fetch_container_secrets(
        &self,
        request: Request<pb::FetchContainerSecretsRequest>,
    ) -> Result<Response<pb::ContainerSecrets>, Status> {
        guard_writes(self.read_only)?;
        let container_id: warren_types::ContainerId = request
            .into_inner()
            .container_id
            .parse()
            .map_err(|_| kind_status(ErrorKind::Validation, "malformed container id"))?;

        let state = self.ctx.state();
        let container = state.get_container(&container_id).ok_or_else(|| {
            kind_status(ErrorKind::NotFound, format!("container {container_id} not found"))
        })?;

        let mut files = Vec::new();
        for secret_ref in &container.spec.secrets {
            let secret = state.secret_by_name(&secret_ref.source).ok_or_else(|| {
                kind_status(
                    ErrorKind::NotFound,
                    format!("secret '{}' not found", secret_ref.source),
                )
            })?;
            let plaintext = warren_crypto::open(self.ctx.cluster_key()?, &secret.ciphertext)
                .map_err(|e| Status::from(ManagerError::from(e)))?;
            files.push(pb::SecretFile {
                name: secret_ref.target.clone(),
                data: Bytes::from(plaintext),
            });
        }
        Ok(Response::new(pb::ContainerSecrets { files }))
    }
}

// ============================================================================
// Secrets
// ============================================================================

pub struct SecretsApi {
    pub ctx: Arc<Ctx>,
    pub read_only: bool,
}

impl SecretsApi {
    fn find(&self, name: &str) -> Result<Secret, Status> {
        self.ctx
            .state()
            .secret_by_name(name)
            .cloned()
            .ok_or_else(|| kind_status(ErrorKind::NotFound, format!("secret '{name}' not found")))
    }
}

#[tonic::async_trait]
impl pb::secrets_server::Secrets for SecretsApi {
    async fn create_secret(
        &self,
        request: Request<pb::CreateSecretRequest>,
    ) -> Result<Response<pb::SecretInfo>, Status> {
        guard_writes(self.read_only)?;
        let req = request.into_inner();

        let ciphertext = warren_crypto::seal(self.ctx.cluster_key()?, &req.data)
            .map_err(|e| Status::from(ManagerError::from(e)))?;
        let secret = Secret {
            id: SecretId::generate(),
            name: req.name,
            ciphertext: Bytes::from(ciphertext),
            created: Timestamp::now(),
        };
        let info = pb::SecretInfo::from(&secret);

        self.ctx
            .gateway
            .propose(Command::UpsertSecret { secret })
            .await
            .map_err(Status::from)?;
        Ok(Response::new(info))
    }

    async fn get_secret(
        &self,
        request: Request<pb::SecretRefByName>,
    ) -> Result<Response<pb::SecretInfo>, Status> {
        let secret = self.find(&request.into_inner().name)?;
        Ok(Response::new(pb::SecretInfo::from(&secret)))
    }

    async fn list_secrets(
        &self,
        _request: Request<pb::Empty>,
    ) -> Result<Response<pb::ListSecretsResponse>, Status> {
        let state = self.ctx.state();
        Ok(Response::new(pb::ListSecretsResponse {
            secrets: state.secrets().values().map(pb::SecretInfo::from).collect(),
        }))
    }

    async fn delete_secret(
        &self,
        request: Request<pb::SecretRefByName>,
    ) -> Result<Response<pb::Empty>, Status> {
        guard_writes(self.read_only)?;
        let secret = self.find(&request.into_inner().name)?;
        self.ctx
            .gateway
            .propose(Command::DeleteSecret { secret_id: secret.id })
            .await
            .map_err(Status::from)?;
        Ok(Response::new(pb::Empty {}))
    }
}

// ============================================================================
// Volumes
// ============================================================================

pub struct VolumesApi {
    pub ctx: Arc<Ctx>,
    pub read_only: bool,
}

impl VolumesApi {
    fn find(&self, name: &str) -> Result<Volume, Status> {
        self.ctx
            .state()
            .volume_by_name(name)
            .cloned()
            .ok_or_else(|| kind_status(ErrorKind::NotFound, format!("volume '{name}' not found")))
    }
}

#[tonic::async_trait]
impl pb::volumes_server::Volumes for VolumesApi {
    async fn create_volume(
        &self,
        request: Request<pb::CreateVolumeRequest>,
    ) -> Result<Response<pb::Volume>, Status> {
        guard_writes(self.read_only)?;
        let req = request.into_inner();

        let volume = Volume {
            id: VolumeId::generate(),
            name: req.name,
            driver: VolumeDriver::Local,
            affinity: None,
            options: req.options,
            created: Timestamp::now(),
        };
        let out = pb::Volume::from(&volume);
        self.ctx
            .gateway
            .propose(Command::UpsertVolume { volume })
            .await
            .map_err(Status::from)?;
        Ok(Response::new(out))
    }

    async fn get_volume(
        &self,
        request: Request<pb::VolumeRefByName>,
    ) -> Result<Response<pb::Volume>, Status> {
        let volume = self.find(&request.into_inner().name)?;
        Ok(Response::new(pb::Volume::from(&volume)))
    }

    async fn list_volumes(
        &self,
        _request: Request<pb::Empty>,
    ) -> Result<Response<pb::ListVolumesResponse>, Status> {
        let state = self.ctx.state();
        Ok(Response::new(pb::ListVolumesResponse {
            volumes: state.volumes().values().map(pb::Volume::from).collect(),
        }))
    }

    async fn delete_volume(
        &self,
        request: Request<pb::VolumeRefByName>,
    ) -> Result<Response<pb::Empty>, Status> {
        guard_writes(self.read_only)?;
        let volume = self.find(&request.into_inner().name)?;
        self.ctx
            .gateway
            .propose(Command::DeleteVolume { volume_id: volume.id })
            .await
            .map_err(Status::from)?;
        Ok(Response::new(pb::Empty {}))
    }
}

// ============================================================================
// Ingresses & TLS certificates (opaque collaborator records)
// ============================================================================

pub struct IngressesApi {
    pub ctx: Arc<Ctx>,
    pub read_only: bool,
}

#[tonic::async_trait]
impl pb::ingresses_server::Ingresses for IngressesApi {
    async fn upsert_ingress(
        &self,
        request: Request<pb::IngressRecord>,
    ) -> Result<Response<pb::Empty>, Status> {
        guard_writes(self.read_only)?;
        let req = request.into_inner();
        self.ctx
            .gateway
            .propose(Command::UpsertIngress {
                ingress: warren_types::Ingress {
                    name: req.name,
                    payload: req.payload,
                    updated: Timestamp::now(),
                },
            })
            .await
            .map_err(Status::from)?;
        Ok(Response::new(pb::Empty {}))
    }

    async fn list_ingresses(
        &self,
        _request: Request<pb::Empty>,
    ) -> Result<Response<pb::ListIngressesResponse>, Status> {
        let state = self.ctx.state();
        Ok(Response::new(pb::ListIngressesResponse {
            ingresses: state
                .ingresses()
                .values()
                .map(pb::IngressRecord::from)
                .collect(),
        }))
    }

    async fn delete_ingress(
        &self,
        request: Request<pb::IngressRefByName>,
    ) -> Result<Response<pb::Empty>, Status> {
        guard_writes(self.read_only)?;
        self.ctx
            .gateway
            .propose(Command::DeleteIngress {
                name: request.into_inner().name,
            })
            .await
            .map_err(Status::from)?;
        Ok(Response::new(pb::Empty {}))
    }
}

pub struct TlsCertificatesApi {
    pub ctx: Arc<Ctx>,
    pub read_only: bool,
}

#[tonic::async_trait]
impl pb::tls_certificates_server::TlsCertificates for TlsCertificatesApi {
    async fn upsert_tls_certificate(
        &self,
        request: Request<pb::TlsCertificateRecord>,
    ) -> Result<Response<pb::Empty>, Status> {
        guard_writes(self.read_only)?;
        let req = request.into_inner();
        self.ctx
            .gateway
            .propose(Command::UpsertTlsCertificate {
                cert: warren_types::TlsCertificate {
                    name: req.name,
                    payload: req.payload,
                    updated: Timestamp::now(),
                },
            })
            .await
            .map_err(Status::from)?;
        Ok(Response::new(pb::Empty {}))
    }

    async fn list_tls_certificates(
        &self,
        _request: Request<pb::Empty>,
    ) -> Result<Response<pb::ListTlsCertificatesResponse>, Status> {
        let state = self.ctx.state();
        Ok(Response::new(pb::ListTlsCertificatesResponse {
            certificates: state
                .tls_certificates()
                .values()
                .map(pb::TlsCertificateRecord::from)
                .collect(),
        }))
    }

    async fn delete_tls_certificate(
        &self,
        request: Request<pb::TlsCertificateRefByName>,
    ) -> Result<Response<pb::Empty>, Status> {
        guard_writes(self.read_only)?;
        self.ctx
            .gateway
            .propose(Command::DeleteTlsCertificate {
                name: request.into_inner().name,
            })
            .await
            .map_err(Status::from)?;
        Ok(Response::new(pb::Empty {}))
    }
}

// ============================================================================
// Events
// ============================================================================

pub struct EventsApi {
    pub ctx: Arc<Ctx>,
}

#[tonic::async_trait]
impl pb::events_server::Events for EventsApi {
    type StreamEventsStream =
        Pin<Box<dyn Stream<Item = Result<pb::Event, Status>> + Send + 'static>>;

    async fn stream_events(
        &self,
        _request: Request<pb::StreamEventsRequest>,
    ) -> Result<Response<Self::StreamEventsStream>, Status> {
        let rx = self.ctx.gateway.subscribe_events();
        let stream = tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(|item| {
            match item {
                Ok(event) => Some(Ok(pb::Event::from(&event))),
                // A lagged subscriber skips missed events rather than
                // erroring out the stream.
                Err(_lagged) => None,
            }
        });
        Ok(Response::new(Box::pin(stream)))
    }
}

// ============================================================================
// Raft transport
// ============================================================================

pub struct RaftApi {
    pub ctx: Arc<Ctx>,
}

#[tonic::async_trait]
impl pb::raft_server::Raft for RaftApi {
    async fn deliver(
        &self,
        request: Request<pb::RaftEnvelope>,
    ) -> Result<Response<pb::Empty>, Status> {
        let payload = request.into_inner().payload;
        let message: warren_raft::Message = postcard::from_bytes(&payload)
            .map_err(|_| kind_status(ErrorKind::Validation, "undecodable raft message"))?;
        self.ctx
            .gateway
            .deliver_peer_message(message)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(pb::Empty {}))
    }
}

// ============================================================================
// Router assembly
// ============================================================================

/// Builds the full service router. `read_only` is true for the local
/// socket, where every mutating method is rejected; `tls` is required on
/// the remote listener and absent on the local one.
pub fn build_router(
    ctx: Arc<Ctx>,
    read_only: bool,
    tls: Option<tonic::transport::ServerTlsConfig>,
) -> Result<tonic::transport::server::Router, tonic::transport::Error> {
    let mut builder = tonic::transport::Server::builder();
    if let Some(tls) = tls {
        builder = builder.tls_config(tls)?;
    }
    let router = builder
        .add_service(pb::cluster_server::ClusterServer::new(ClusterApi {
            ctx: ctx.clone(),
            read_only,
        }))
        .add_service(pb::nodes_server::NodesServer::new(NodesApi {
            ctx: ctx.clone(),
            read_only,
        }))
        .add_service(pb::services_server::ServicesServer::new(ServicesApi {
            ctx: ctx.clone(),
            read_only,
        }))
        .add_service(pb::containers_server::ContainersServer::new(ContainersApi {
            ctx: ctx.clone(),
            read_only,
        }))
        .add_service(pb::secrets_server::SecretsServer::new(SecretsApi {
            ctx: ctx.clone(),
            read_only,
        }))
        .add_service(pb::volumes_server::VolumesServer::new(VolumesApi {
            ctx: ctx.clone(),
            read_only,
        }))
        .add_service(pb::ingresses_server::IngressesServer::new(IngressesApi {
            ctx: ctx.clone(),
            read_only,
        }))
        .add_service(pb::tls_certificates_server::TlsCertificatesServer::new(
            TlsCertificatesApi {
                ctx: ctx.clone(),
                read_only,
            },
        ))
        .add_service(pb::events_server::EventsServer::new(EventsApi {
            ctx: ctx.clone(),
        }));

    if read_only {
        Ok(router)
    } else {
        // Peer consensus traffic never flows over the local socket.
        Ok(router.add_service(pb::raft_server::RaftServer::new(RaftApi { ctx })))
    }
}
