//! Cluster certificate authority.
//!
//! The CA is generated once at bootstrap; its private key lives in the
//! replicated store sealed with the cluster key, so any manager that holds
//! the passphrase can issue node certificates. Leaf certificates carry the
//! node ID as the common name and the node's role as an organization unit,
//! which is how RPC handlers authorize worker-only calls.

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};
use warren_types::{NodeId, NodeRole};

use crate::CryptoError;

/// PEM bundle for a generated certificate.
#[derive(Debug, Clone)]
pub struct CertBundle {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Generates a new self-signed cluster CA.
pub fn generate_ca(cluster_name: &str) -> Result<CertBundle, CryptoError> {
    let key_pair = KeyPair::generate().map_err(cert_err)?;

    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, format!("warren-ca {cluster_name}"));
    dn.push(DnType::OrganizationName, "warren");
    params.distinguished_name = dn;

    let cert = params.self_signed(&key_pair).map_err(cert_err)?;
    Ok(CertBundle {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

/// Issues a leaf certificate for a node, signed by the cluster CA.
///
/// `san_hosts` carries the addresses peers will dial the node at.
pub fn issue_leaf(
    ca_cert_pem: &str,
    ca_key_pem: &str,
    node_id: NodeId,
    role: NodeRole,
    san_hosts: &[String],
) -> Result<CertBundle, CryptoError> {
    let ca_key = KeyPair::from_pem(ca_key_pem).map_err(cert_err)?;
    let ca_cert = rebuild_ca(ca_cert_pem, &ca_key)?;

    let key_pair = KeyPair::generate().map_err(cert_err)?;
    let mut params =
        CertificateParams::new(san_hosts.to_vec()).map_err(cert_err)?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, node_id.to_string());
    dn.push(DnType::OrganizationalUnitName, role.to_string());
    params.distinguished_name = dn;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];

    let cert = params
        .signed_by(&key_pair, &ca_cert, &ca_key)
        .map_err(cert_err)?;
    Ok(CertBundle {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

/// Rebuilds the CA `Certificate` object from its PEM so it can sign leaves.
fn rebuild_ca(ca_cert_pem: &str, ca_key: &KeyPair) -> Result<Certificate, CryptoError> {
    CertificateParams::from_ca_cert_pem(ca_cert_pem)
        .map_err(cert_err)?
        .self_signed(ca_key)
        .map_err(cert_err)
}

fn cert_err(e: rcgen::Error) -> CryptoError {
    CryptoError::Certificate(e.to_string())
}
