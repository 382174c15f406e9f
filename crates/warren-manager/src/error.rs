//! Manager-side error type.

use warren_kernel::KernelError;
use warren_types::ErrorKind;

/// Errors surfaced by the manager's gateway and handlers.
#[derive(thiserror::Error, Debug)]
pub enum ManagerError {
    /// The state machine rejected the command.
    #[error(transparent)]
    Kernel(#[from] KernelError),

    /// Write issued while not leader.
    #[error("not the leader{}", .leader_addr.as_deref().map(|a| format!("; leader is at {a}")).unwrap_or_default())]
    NotLeader { leader_addr: Option<String> },

    /// Consensus cannot currently commit (no quorum, leadership in flux).
    #[error("cluster unavailable: {0}")]
    Unavailable(String),

    /// Referenced entity absent.
    #[error("{0} not found")]
    NotFound(String),

    /// Join token / certificate problems.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Bad request content.
    #[error("validation: {0}")]
    Validation(String),

    /// Crypto failures (sealing, CA operations).
    #[error("crypto error: {0}")]
    Crypto(#[from] warren_crypto::CryptoError),

    /// Durable storage failures. Fatal.
    #[error(transparent)]
    Store(#[from] warren_store::StoreError),
}

impl ManagerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ManagerError::Kernel(err) => err.kind(),
            ManagerError::NotLeader { .. } => ErrorKind::NotLeader,
            ManagerError::Unavailable(_) => ErrorKind::Unavailable,
            ManagerError::NotFound(_) => ErrorKind::NotFound,
            ManagerError::Unauthenticated(_) => ErrorKind::Unauthenticated,
            ManagerError::Validation(_) => ErrorKind::Validation,
            ManagerError::Crypto(_) => ErrorKind::Fatal,
            ManagerError::Store(_) => ErrorKind::Fatal,
        }
    }
}

impl From<ManagerError> for tonic::Status {
    fn from(err: ManagerError) -> Self {
        match &err {
            ManagerError::NotLeader { leader_addr } => {
                warren_proto::status::not_leader(leader_addr.as_deref())
            }
            _ => warren_proto::status::status(err.kind(), err.to_string()),
        }
    }
}
