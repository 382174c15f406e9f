//! Join-token generation and verification.
//!
//! A token is a 256-bit random secret handed to the operator once; the
//! store keeps only its SHA-256. The printable form is
//! `wrt-<role>-<64 hex chars>` so a pasted token identifies its role
//! before any RPC is made.

use rand::RngCore;
use sha2::{Digest, Sha256};
use warren_types::NodeRole;

/// A freshly generated join token: the printable secret plus its hash.
#[derive(Debug, Clone)]
pub struct GeneratedToken {
    pub secret: String,
    pub hash: [u8; 32],
}

/// Generates a role-tagged 256-bit join token.
pub fn generate(role: NodeRole) -> GeneratedToken {
    let mut raw = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut raw);

    let mut hex = String::with_capacity(64);
    for b in raw {
        use std::fmt::Write;
        let _ = write!(hex, "{b:02x}");
    }

    let secret = format!("wrt-{role}-{hex}");
    GeneratedToken {
        hash: hash(&secret),
        secret,
    }
}

/// Hashes a token secret the way the store expects.
pub fn hash(secret: &str) -> [u8; 32] {
    let digest = Sha256::digest(secret.as_bytes());
    digest.into()
}

/// Extracts the role tag from a printable token, if well-formed.
pub fn parse_role(secret: &str) -> Option<NodeRole> {
    let rest = secret.strip_prefix("wrt-")?;
    if let Some(hex) = rest.strip_prefix("manager-") {
        (hex.len() == 64).then_some(NodeRole::Manager)
    } else if let Some(hex) = rest.strip_prefix("worker-") {
        (hex.len() == 64).then_some(NodeRole::Worker)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_token_round_trips() {
        let token = generate(NodeRole::Worker);
        assert_eq!(parse_role(&token.secret), Some(NodeRole::Worker));
        assert_eq!(hash(&token.secret), token.hash);
    }

    #[test]
    fn tokens_are_unique() {
        let a = generate(NodeRole::Manager);
        let b = generate(NodeRole::Manager);
        assert_ne!(a.secret, b.secret);
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn malformed_tokens_have_no_role() {
        assert_eq!(parse_role("wrt-worker-short"), None);
        assert_eq!(parse_role("token"), None);
        assert_eq!(parse_role("wrt-admin-0000"), None);
    }
}
