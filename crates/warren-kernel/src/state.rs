//! Kernel state management.
//!
//! The replicated store: one bucket per entity kind, keyed by entity ID
//! (names are secondary indexes). State transitions take ownership and
//! return the new state, so the consensus runtime can thread one value
//! through a batch without cloning the maps.
//!
//! Back-references (node → its containers, service → its containers) are
//! derived by bucket scans, never persisted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use warren_types::{
    ClusterMeta, Container, ContainerId, Ingress, JoinToken, Node, NodeId, Secret, SecretId,
    Service, ServiceId, TlsCertificate, TokenId, Volume, VolumeId,
};

/// The replicated cluster state.
///
/// Every bucket is a `BTreeMap` so iteration order (and therefore snapshot
/// bytes and planner output) is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct State {
    cluster: Option<ClusterMeta>,
    nodes: BTreeMap<NodeId, Node>,
    services: BTreeMap<ServiceId, Service>,
    service_names: BTreeMap<String, ServiceId>,
    containers: BTreeMap<ContainerId, Container>,
    secrets: BTreeMap<SecretId, Secret>,
    secret_names: BTreeMap<String, SecretId>,
    volumes: BTreeMap<VolumeId, Volume>,
    volume_names: BTreeMap<String, VolumeId>,
    ingresses: BTreeMap<String, Ingress>,
    tls_certificates: BTreeMap<String, TlsCertificate>,
    tokens: BTreeMap<TokenId, JoinToken>,
}

impl State {
    /// Creates a new empty state.
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Cluster config
    // ========================================================================

    pub fn cluster(&self) -> Option<&ClusterMeta> {
        self.cluster.as_ref()
    }

    pub(crate) fn with_cluster(mut self, meta: ClusterMeta) -> Self {
        self.cluster = Some(meta);
        self
    }

    // ========================================================================
    // Nodes
    // ========================================================================

    pub fn get_node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_exists(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn nodes(&self) -> &BTreeMap<NodeId, Node> {
        &self.nodes
    }

    pub(crate) fn with_node(mut self, node: Node) -> Self {
        self.nodes.insert(node.id, node);
        self
    }

    pub(crate) fn map_node(mut self, id: NodeId, f: impl FnOnce(&mut Node)) -> Self {
        if let Some(node) = self.nodes.get_mut(&id) {
            f(node);
        }
        self
    }

    pub(crate) fn without_node(mut self, id: NodeId) -> Self {
        self.nodes.remove(&id);
        self
    }

    // ========================================================================
    // Services
    // ========================================================================

    pub fn get_service(&self, id: &ServiceId) -> Option<&Service> {
        self.services.get(id)
    }

    pub fn service_exists(&self, id: &ServiceId) -> bool {
        self.services.contains_key(id)
    }

    pub fn service_by_name(&self, name: &str) -> Option<&Service> {
        self.service_names
            .get(name)
            .and_then(|id| self.services.get(id))
    }

    pub fn services(&self) -> &BTreeMap<ServiceId, Service> {
        &self.services
    }

    pub(crate) fn with_service(mut self, service: Service) -> Self {
        self.service_names
            .insert(service.spec.name.clone(), service.id);
        self.services.insert(service.id, service);
        self
    }

    pub(crate) fn map_service(mut self, id: ServiceId, f: impl FnOnce(&mut Service)) -> Self {
        if let Some(service) = self.services.get_mut(&id) {
            let old_name = service.spec.name.clone();
            f(service);
            if service.spec.name != old_name {
                self.service_names.remove(&old_name);
                self.service_names.insert(service.spec.name.clone(), id);
            }
        }
        self
    }

    pub(crate) fn without_service(mut self, id: ServiceId) -> Self {
        if let Some(service) = self.services.remove(&id) {
            self.service_names.remove(&service.spec.name);
        }
        self
    }

    // ========================================================================
    // Containers
    // ========================================================================

    pub fn get_container(&self, id: &ContainerId) -> Option<&Container> {
        self.containers.get(id)
    }

    pub fn container_exists(&self, id: &ContainerId) -> bool {
        self.containers.contains_key(id)
    }

    pub fn containers(&self) -> &BTreeMap<ContainerId, Container> {
        &self.containers
    }

    /// Containers owned by a service, in ID order.
    pub fn containers_for_service(&self, service_id: ServiceId) -> Vec<&Container> {
        self.containers
            .values()
            .filter(|c| c.service_id == service_id)
            .collect()
    }

    /// Containers assigned to a node, in ID order.
    pub fn containers_on_node(&self, node_id: NodeId) -> Vec<&Container> {
        self.containers
            .values()
            .filter(|c| c.node_id == node_id)
            .collect()
    }

    pub(crate) fn with_container(mut self, container: Container) -> Self {
        self.containers.insert(container.id, container);
        self
    }

    pub(crate) fn map_container(
        mut self,
        id: ContainerId,
        f: impl FnOnce(&mut Container),
    ) -> Self {
        if let Some(container) = self.containers.get_mut(&id) {
            f(container);
        }
        self
    }

    pub(crate) fn without_container(mut self, id: ContainerId) -> Self {
        self.containers.remove(&id);
        self
    }

    pub(crate) fn without_containers_on_node(mut self, node_id: NodeId) -> (Self, Vec<ContainerId>) {
        let doomed: Vec<ContainerId> = self
            .containers
            .values()
            .filter(|c| c.node_id == node_id)
            .map(|c| c.id)
            .collect();
        for id in &doomed {
            self.containers.remove(id);
        }
        (self, doomed)
    }

    // ========================================================================
    // Secrets
    // ========================================================================

    pub fn get_secret(&self, id: &SecretId) -> Option<&Secret> {
        self.secrets.get(id)
    }

    pub fn secret_by_name(&self, name: &str) -> Option<&Secret> {
        self.secret_names
            .get(name)
            .and_then(|id| self.secrets.get(id))
    }

    pub fn secrets(&self) -> &BTreeMap<SecretId, Secret> {
        &self.secrets
    }

    pub(crate) fn with_secret(mut self, secret: Secret) -> Self {
        self.secret_names.insert(secret.name.clone(), secret.id);
        self.secrets.insert(secret.id, secret);
        self
    }

    pub(crate) fn without_secret(mut self, id: SecretId) -> Self {
        if let Some(secret) = self.secrets.remove(&id) {
            self.secret_names.remove(&secret.name);
        }
        self
    }

    /// Services whose specs reference the named secret.
    pub fn secret_referents(&self, name: &str) -> Vec<ServiceId> {
        self.services
            .values()
            .filter(|s| s.spec.secrets.iter().any(|r| r.source == name))
            .map(|s| s.id)
            .collect()
    }

    // ========================================================================
    // Volumes
    // ========================================================================

    pub fn get_volume(&self, id: &VolumeId) -> Option<&Volume> {
        self.volumes.get(id)
    }

    pub fn volume_by_name(&self, name: &str) -> Option<&Volume> {
        self.volume_names
            .get(name)
            .and_then(|id| self.volumes.get(id))
    }

    pub fn volumes(&self) -> &BTreeMap<VolumeId, Volume> {
        &self.volumes
    }

    pub(crate) fn with_volume(mut self, volume: Volume) -> Self {
        self.volume_names.insert(volume.name.clone(), volume.id);
        self.volumes.insert(volume.id, volume);
        self
    }

    pub(crate) fn map_volume(mut self, id: VolumeId, f: impl FnOnce(&mut Volume)) -> Self {
        if let Some(volume) = self.volumes.get_mut(&id) {
            f(volume);
        }
        self
    }

    pub(crate) fn without_volume(mut self, id: VolumeId) -> Self {
        if let Some(volume) = self.volumes.remove(&id) {
            self.volume_names.remove(&volume.name);
        }
        self
    }

    /// True if any service spec or container snapshot references the named
    /// volume.
    pub fn volume_is_referenced(&self, name: &str) -> bool {
        self.services
            .values()
            .any(|s| s.spec.volumes.iter().any(|r| r.source == name))
            || self
                .containers
                .values()
                .any(|c| c.spec.volumes.iter().any(|r| r.source == name))
    }

    // ========================================================================
    // Collaborator blobs
    // ========================================================================

    pub fn get_ingress(&self, name: &str) -> Option<&Ingress> {
        self.ingresses.get(name)
    }

    pub fn ingresses(&self) -> &BTreeMap<String, Ingress> {
        &self.ingresses
    }

    pub(crate) fn with_ingress(mut self, ingress: Ingress) -> Self {
        self.ingresses.insert(ingress.name.clone(), ingress);
        self
    }

    pub(crate) fn without_ingress(mut self, name: &str) -> Self {
        self.ingresses.remove(name);
        self
    }

    pub fn get_tls_certificate(&self, name: &str) -> Option<&TlsCertificate> {
        self.tls_certificates.get(name)
    }

    pub fn tls_certificates(&self) -> &BTreeMap<String, TlsCertificate> {
        &self.tls_certificates
    }

    pub(crate) fn with_tls_certificate(mut self, cert: TlsCertificate) -> Self {
        self.tls_certificates.insert(cert.name.clone(), cert);
        self
    }

    pub(crate) fn without_tls_certificate(mut self, name: &str) -> Self {
        self.tls_certificates.remove(name);
        self
    }

    // ========================================================================
    // Join tokens
    // ========================================================================

    pub fn get_token(&self, id: &TokenId) -> Option<&JoinToken> {
        self.tokens.get(id)
    }

    pub fn tokens(&self) -> &BTreeMap<TokenId, JoinToken> {
        &self.tokens
    }

    pub(crate) fn with_token(mut self, token: JoinToken) -> Self {
        self.tokens.insert(token.id, token);
        self
    }

    pub(crate) fn map_token(mut self, id: TokenId, f: impl FnOnce(&mut JoinToken)) -> Self {
        if let Some(token) = self.tokens.get_mut(&id) {
            f(token);
        }
        self
    }

    pub(crate) fn retain_tokens(mut self, keep: impl Fn(&JoinToken) -> bool) -> Self {
        self.tokens.retain(|_, t| keep(t));
        self
    }
}
