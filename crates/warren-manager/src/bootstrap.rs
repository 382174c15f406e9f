//! Cluster bootstrap and key unlocking.
//!
//! `init` creates the cluster-wide configuration exactly once: the cluster
//! ID, the key-derivation salt, the CA (its private key sealed with the
//! cluster key), and the key-check sentinel. Later starts derive the same
//! key from the operator passphrase and verify it against the sentinel
//! before serving anything.

use bytes::Bytes;
use uuid::Uuid;

use warren_crypto::{seal, ClusterKey, KEY_CHECK_PLAINTEXT};
use warren_types::{ClusterMeta, Timestamp};

use crate::error::ManagerError;

/// Builds the cluster configuration for a brand-new cluster.
pub fn new_cluster_meta(
    passphrase: &str,
    now: Timestamp,
) -> Result<(ClusterMeta, ClusterKey), ManagerError> {
    let cluster_id = Uuid::new_v4();
    let salt = ClusterKey::generate_salt();
    let key = ClusterKey::derive(passphrase, &salt);

    let ca = warren_crypto::ca::generate_ca(&cluster_id.to_string())?;
    let ca_key_sealed = seal(&key, ca.key_pem.as_bytes())?;
    let key_check = seal(&key, KEY_CHECK_PLAINTEXT)?;

    let meta = ClusterMeta {
        cluster_id,
        ca_cert_pem: ca.cert_pem,
        ca_key_sealed: Bytes::from(ca_key_sealed),
        key_salt: Bytes::copy_from_slice(&salt),
        key_check: Bytes::from(key_check),
        created: now,
    };
    Ok((meta, key))
}

/// Derives and verifies the cluster key against stored material.
pub fn unlock_cluster_key(
    meta: &ClusterMeta,
    passphrase: &str,
) -> Result<ClusterKey, ManagerError> {
    let key = ClusterKey::derive(passphrase, &meta.key_salt);
    if !key.verify(&meta.key_check) {
        return Err(ManagerError::Unauthenticated(
            "cluster passphrase does not match this cluster's key material".into(),
        ));
    }
    Ok(key)
}

/// Recovers the CA's private key PEM for certificate issuance.
pub fn unseal_ca_key(meta: &ClusterMeta, key: &ClusterKey) -> Result<String, ManagerError> {
    let pem = warren_crypto::open(key, &meta.ca_key_sealed)?;
    String::from_utf8(pem)
        .map_err(|_| ManagerError::Validation("sealed CA key is not valid UTF-8".into()))
}
