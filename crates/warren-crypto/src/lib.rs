//! # warren-crypto: key material for Warren
//!
//! Three concerns live here, all of them boring on purpose:
//! - sealing secrets with the cluster key ([`seal`] / [`open`],
//!   AES-256-GCM with a random 96-bit nonce prefixed to the ciphertext)
//! - deriving the cluster key from the operator passphrase
//!   ([`ClusterKey::derive`], HKDF-SHA256 over a public per-cluster salt)
//! - the cluster CA and node leaf certificates ([`ca`]), plus join-token
//!   generation and hashing ([`token`])
//!
//! Secret plaintext exists only in memory on the manager handling a request
//! and on the worker mounting it; the store only ever sees ciphertext.

pub mod ca;
pub mod token;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Sentinel sealed into `ClusterMeta.key_check` at bootstrap so later
/// starts can verify the supplied passphrase before serving traffic.
pub const KEY_CHECK_PLAINTEXT: &[u8] = b"warren cluster key check v1";

const NONCE_LEN: usize = 12;

/// Errors from sealing, opening, and key derivation.
#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("ciphertext too short")]
    Truncated,

    #[error("decryption failed (wrong key or corrupt ciphertext)")]
    Open,

    #[error("encryption failed")]
    Seal,

    #[error("certificate error: {0}")]
    Certificate(String),
}

/// The cluster-wide AES-256 key, derived from the operator passphrase.
///
/// Wiped from memory on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ClusterKey([u8; 32]);

impl ClusterKey {
    /// Derives the key from a passphrase and the cluster's public salt.
    pub fn derive(passphrase: &str, salt: &[u8]) -> Self {
        let hk = Hkdf::<Sha256>::new(Some(salt), passphrase.as_bytes());
        let mut key = [0u8; 32];
        // The only failure mode is an over-long output length; 32 is fine.
        hk.expand(b"warren cluster key", &mut key)
            .expect("hkdf expand with 32-byte output");
        Self(key)
    }

    /// Generates a fresh random salt for a new cluster.
    pub fn generate_salt() -> [u8; 16] {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        salt
    }

    /// Checks this key against the sealed sentinel from `ClusterMeta`.
    pub fn verify(&self, key_check: &[u8]) -> bool {
        matches!(open(self, key_check), Ok(pt) if pt == KEY_CHECK_PLAINTEXT)
    }

    fn cipher(&self) -> Result<Aes256Gcm, CryptoError> {
        Aes256Gcm::new_from_slice(&self.0).map_err(|_| CryptoError::Seal)
    }
}

/// Seals plaintext with the cluster key. Output is `nonce || ciphertext`.
pub fn seal(key: &ClusterKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = key.cipher()?;
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Seal)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Opens `nonce || ciphertext` sealed with [`seal`].
pub fn open(key: &ClusterKey, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_LEN {
        return Err(CryptoError::Truncated);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

    key.cipher()?
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Open)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let key = ClusterKey::derive("hunter2", b"salt");
        let sealed = seal(&key, b"database password").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"database password");
        assert_eq!(open(&key, &sealed).unwrap(), b"database password");
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let key = ClusterKey::derive("hunter2", b"salt");
        let other = ClusterKey::derive("hunter3", b"salt");
        let sealed = seal(&key, b"payload").unwrap();
        assert!(matches!(open(&other, &sealed), Err(CryptoError::Open)));
    }

    #[test]
    fn same_passphrase_different_salt_differs() {
        let a = ClusterKey::derive("p", b"salt-a");
        let b = ClusterKey::derive("p", b"salt-b");
        let sealed = seal(&a, b"x").unwrap();
        assert!(open(&b, &sealed).is_err());
    }

    #[test]
    fn key_check_verifies_passphrase() {
        let key = ClusterKey::derive("p", b"salt");
        let check = seal(&key, KEY_CHECK_PLAINTEXT).unwrap();
        assert!(key.verify(&check));
        assert!(!ClusterKey::derive("wrong", b"salt").verify(&check));
    }

    #[test]
    fn truncated_input_rejected() {
        let key = ClusterKey::derive("p", b"salt");
        assert!(matches!(open(&key, b"short"), Err(CryptoError::Truncated)));
    }

    #[test]
    fn nonces_are_fresh() {
        let key = ClusterKey::derive("p", b"salt");
        let a = seal(&key, b"x").unwrap();
        let b = seal(&key, b"x").unwrap();
        assert_ne!(a, b);
    }
}
