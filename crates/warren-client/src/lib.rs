//! # warren-client: typed access to the control plane
//!
//! A thin wrapper over the generated gRPC clients that knows Warren's
//! error discipline: writes issued to a follower come back `NotLeader`
//! with the leader's address in metadata, and this client transparently
//! redials and retries (bounded); `Unavailable` (no quorum) backs off and
//! retries the same endpoint.

use std::future::Future;
use std::time::Duration;

use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::Status;
use tracing::debug;

use warren_proto::pb;
use warren_proto::status::{kind_of, leader_hint};
use warren_types::{ContainerHealth, ErrorKind, NodeId, NodeResources, ServiceSpec};

/// Redials tolerated per call before giving up.
const MAX_REDIRECTS: u32 = 4;

/// Client-side errors.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("cannot reach {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error(transparent)]
    Rpc(#[from] Status),

    #[error("gave up after {0} leader redirects")]
    TooManyRedirects(u32),
}

impl ClientError {
    /// The server-reported kind, when one is attached.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ClientError::Rpc(status) => kind_of(status),
            _ => None,
        }
    }
}

/// A connection to some manager, following the leader as needed.
pub struct WarrenClient {
    addr: String,
    channel: Channel,
    tls: Option<ClientTlsConfig>,
}

impl WarrenClient {
    /// Dials a manager. With `tls`, the remote mTLS endpoint; without, a
    /// plaintext endpoint (tests, pre-join admission).
    pub async fn connect(
        addr: impl Into<String>,
        tls: Option<ClientTlsConfig>,
    ) -> Result<Self, ClientError> {
        let addr = addr.into();
        let channel = dial(&addr, tls.as_ref()).await?;
        Ok(Self { addr, channel, tls })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Runs one RPC against the current channel, following leader
    /// redirects and backing off on `Unavailable`.
    pub async fn call<T, Fut>(
        &mut self,
        f: impl Fn(Channel) -> Fut,
    ) -> Result<T, ClientError>
    where
        Fut: Future<Output = Result<T, Status>>,
    {
        let mut redirects = 0;
        loop {
            match f(self.channel.clone()).await {
                Ok(value) => return Ok(value),
                Err(status) => match kind_of(&status) {
                    Some(ErrorKind::NotLeader) => {
                        if redirects >= MAX_REDIRECTS {
                            return Err(ClientError::TooManyRedirects(redirects));
                        }
                        redirects += 1;
                        if let Some(addr) = leader_hint(&status) {
                            debug!(%addr, "following leader redirect");
                            self.channel = dial(&addr, self.tls.as_ref()).await?;
                            self.addr = addr;
                        } else {
                            // Leader unknown mid-election; wait it out.
                            tokio::time::sleep(backoff(redirects)).await;
                        }
                    }
                    Some(ErrorKind::Unavailable) if redirects < MAX_REDIRECTS => {
                        redirects += 1;
                        tokio::time::sleep(backoff(redirects)).await;
                    }
                    _ => return Err(ClientError::Rpc(status)),
                },
            }
        }
    }

    // ========================================================================
    // Cluster
    // ========================================================================

    pub async fn get_cluster_info(&mut self) -> Result<pb::ClusterInfo, ClientError> {
        self.call(|ch| async move {
            pb::cluster_client::ClusterClient::new(ch)
                .get_cluster_info(pb::Empty {})
                .await
                .map(tonic::Response::into_inner)
        })
        .await
    }

    pub async fn generate_join_token(
        &mut self,
        role: warren_types::NodeRole,
    ) -> Result<pb::GenerateJoinTokenResponse, ClientError> {
        let role = pb::NodeRole::from(role) as i32;
        self.call(|ch| async move {
            pb::cluster_client::ClusterClient::new(ch)
                .generate_join_token(pb::GenerateJoinTokenRequest { role })
                .await
                .map(tonic::Response::into_inner)
        })
        .await
    }

    pub async fn join(&mut self, request: pb::JoinRequest) -> Result<pb::JoinResponse, ClientError> {
        let req = request.clone();
        self.call(move |ch| {
            let req = req.clone();
            async move {
                pb::cluster_client::ClusterClient::new(ch)
                    .join(req)
                    .await
                    .map(tonic::Response::into_inner)
            }
        })
        .await
    }

    // ========================================================================
    // Nodes
    // ========================================================================

    pub async fn report_heartbeat(
        &mut self,
        node_id: NodeId,
        resources: Option<NodeResources>,
    ) -> Result<(), ClientError> {
        let req = pb::HeartbeatRequest {
            node_id: node_id.to_string(),
            resources: resources.map(Into::into),
        };
        self.call(move |ch| {
            let req = req.clone();
            async move {
                pb::nodes_client::NodesClient::new(ch)
                    .report_heartbeat(req)
                    .await
                    .map(|_| ())
            }
        })
        .await
    }

    pub async fn list_nodes(&mut self) -> Result<Vec<pb::Node>, ClientError> {
        self.call(|ch| async move {
            pb::nodes_client::NodesClient::new(ch)
                .list_nodes(pb::Empty {})
                .await
                .map(|r| r.into_inner().nodes)
        })
        .await
    }

    pub async fn remove_node(&mut self, node_id: NodeId) -> Result<(), ClientError> {
        let req = pb::NodeRef {
            node_id: node_id.to_string(),
        };
        self.call(move |ch| {
            let req = req.clone();
            async move {
                pb::nodes_client::NodesClient::new(ch)
                    .remove_node(req)
                    .await
                    .map(|_| ())
            }
        })
        .await
    }

    // ========================================================================
    // Services
    // ========================================================================

    pub async fn create_service(&mut self, spec: &ServiceSpec) -> Result<pb::Service, ClientError> {
        let req = pb::CreateServiceRequest {
            spec: Some(pb::ServiceSpec::from(spec)),
        };
        self.call(move |ch| {
            let req = req.clone();
            async move {
                pb::services_client::ServicesClient::new(ch)
                    .create_service(req)
                    .await
                    .map(tonic::Response::into_inner)
            }
        })
        .await
    }

    pub async fn get_service(&mut self, service: &str) -> Result<pb::Service, ClientError> {
        let req = pb::ServiceRef {
            service: service.to_string(),
        };
        self.call(move |ch| {
            let req = req.clone();
            async move {
                pb::services_client::ServicesClient::new(ch)
                    .get_service(req)
                    .await
                    .map(tonic::Response::into_inner)
            }
        })
        .await
    }

    pub async fn list_services(&mut self) -> Result<Vec<pb::Service>, ClientError> {
        self.call(|ch| async move {
            pb::services_client::ServicesClient::new(ch)
                .list_services(pb::Empty {})
                .await
                .map(|r| r.into_inner().services)
        })
        .await
    }

    pub async fn scale_service(
        &mut self,
        service: &str,
        replicas: u32,
    ) -> Result<pb::Service, ClientError> {
        let req = pb::ScaleServiceRequest {
            service: service.to_string(),
            replicas,
        };
        self.call(move |ch| {
            let req = req.clone();
            async move {
                pb::services_client::ServicesClient::new(ch)
                    .scale_service(req)
                    .await
                    .map(tonic::Response::into_inner)
            }
        })
        .await
    }

    pub async fn update_service_image(
        &mut self,
        service: &str,
        image: &str,
    ) -> Result<pb::Service, ClientError> {
        let req = pb::UpdateServiceImageRequest {
            service: service.to_string(),
            image: image.to_string(),
        };
        self.call(move |ch| {
            let req = req.clone();
            async move {
                pb::services_client::ServicesClient::new(ch)
                    .update_service_image(req)
                    .await
                    .map(tonic::Response::into_inner)
            }
        })
        .await
    }

    pub async fn rollback_service(&mut self, service: &str) -> Result<pb::Service, ClientError> {
        let req = pb::ServiceRef {
            service: service.to_string(),
        };
        self.call(move |ch| {
            let req = req.clone();
            async move {
                pb::services_client::ServicesClient::new(ch)
                    .rollback_service(req)
                    .await
                    .map(tonic::Response::into_inner)
            }
        })
        .await
    }

    pub async fn delete_service(&mut self, service: &str) -> Result<(), ClientError> {
        let req = pb::ServiceRef {
            service: service.to_string(),
        };
        self.call(move |ch| {
            let req = req.clone();
            async move {
                pb::services_client::ServicesClient::new(ch)
                    .delete_service(req)
                    .await
                    .map(|_| ())
            }
        })
        .await
    }

    // ========================================================================
    // Containers
    // ========================================================================

    pub async fn list_containers(
        &mut self,
        service: Option<&str>,
        node_id: Option<NodeId>,
    ) -> Result<Vec<pb::Container>, ClientError> {
        let req = pb::ListContainersRequest {
            service: service.map(str::to_string),
            node_id: node_id.map(|id| id.to_string()),
        };
        self.call(move |ch| {
            let req = req.clone();
            async move {
                pb::containers_client::ContainersClient::new(ch)
                    .list_containers(req)
                    .await
                    .map(|r| r.into_inner().containers)
            }
        })
        .await
    }

    pub async fn update_container_status(
        &mut self,
        container_id: &str,
        actual: warren_types::ActualState,
        runtime_handle: Option<String>,
    ) -> Result<(), ClientError> {
        let req = pb::UpdateContainerStatusRequest {
            container_id: container_id.to_string(),
            actual: pb::ActualState::from(actual) as i32,
            runtime_handle,
        };
        self.call(move |ch| {
            let req = req.clone();
            async move {
                pb::containers_client::ContainersClient::new(ch)
                    .update_container_status(req)
                    .await
                    .map(|_| ())
            }
        })
        .await
    }

    pub async fn report_container_health(
        &mut self,
        container_id: &str,
        health: ContainerHealth,
    ) -> Result<(), ClientError> {
        let req = pb::ReportContainerHealthRequest {
            container_id: container_id.to_string(),
            health: Some(health.into()),
        };
        self.call(move |ch| {
            let req = req.clone();
            async move {
                pb::containers_client::ContainersClient::new(ch)
                    .report_container_health(req)
                    .await
                    .map(|_| ())
            }
        })
        .await
    }

    pub async fn fetch_container_secrets(
        &mut self,
        container_id: &str,
    ) -> Result<pb::ContainerSecrets, ClientError> {
        let req = pb::FetchContainerSecretsRequest {
            container_id: container_id.to_string(),
        };
        self.call(move |ch| {
            let req = req.clone();
            async move {
                pb::containers_client::ContainersClient::new(ch)
                    .fetch_container_secrets(req)
                    .await
                    .map(tonic::Response::into_inner)
            }
        })
        .await
    }
}

async fn dial(addr: &str, tls: Option<&ClientTlsConfig>) -> Result<Channel, ClientError> {
    let scheme = if tls.is_some() { "https" } else { "http" };
    let endpoint = Endpoint::from_shared(format!("{scheme}://{addr}"))
        .map_err(|source| ClientError::Connect {
            addr: addr.to_string(),
            source,
        })?
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(30));
    let endpoint = match tls {
        Some(tls) => endpoint
            .tls_config(tls.clone())
            .map_err(|source| ClientError::Connect {
                addr: addr.to_string(),
                source,
            })?,
        None => endpoint,
    };
    endpoint
        .connect()
        .await
        .map_err(|source| ClientError::Connect {
            addr: addr.to_string(),
            source,
        })
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(200 * u64::from(attempt.min(5)) * u64::from(attempt.min(5)))
}
