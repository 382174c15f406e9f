//! TLS assembly for the gRPC listeners and clients.
//!
//! Remote transports require mTLS: the server presents its CA-signed leaf
//! and demands a client certificate from the same CA. The local socket
//! carries no TLS; OS permissions on the path gate access there.

use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

/// Server side: present `cert`/`key`, require client certs signed by `ca`.
pub fn server_mtls(cert_pem: &str, key_pem: &str, ca_pem: &str) -> ServerTlsConfig {
    ServerTlsConfig::new()
        .identity(Identity::from_pem(cert_pem, key_pem))
        .client_ca_root(Certificate::from_pem(ca_pem))
}

/// Client side: present `cert`/`key`, trust only the cluster CA.
pub fn client_mtls(cert_pem: &str, key_pem: &str, ca_pem: &str) -> ClientTlsConfig {
    ClientTlsConfig::new()
        .identity(Identity::from_pem(cert_pem, key_pem))
        .ca_certificate(Certificate::from_pem(ca_pem))
}
