//! Error-kind ↔ gRPC status mapping.
//!
//! Every Warren error carries an [`ErrorKind`]; this module is the single
//! place that decides which `tonic::Code` each kind travels as, plus the
//! metadata keys for machine-readable details (leader redirects, the
//! read-only local endpoint).

use tonic::metadata::MetadataValue;
use tonic::{Code, Status};
use warren_types::ErrorKind;

/// Metadata key carrying the current leader's address on `NotLeader`.
pub const LEADER_ADDR_KEY: &str = "x-warren-leader-addr";

/// Metadata key carrying the originating [`ErrorKind`].
pub const ERROR_KIND_KEY: &str = "x-warren-error-kind";

/// The gRPC code each kind travels as.
pub fn code_for(kind: ErrorKind) -> Code {
    match kind {
        ErrorKind::Validation => Code::InvalidArgument,
        ErrorKind::NotFound => Code::NotFound,
        ErrorKind::AlreadyExists => Code::AlreadyExists,
        ErrorKind::NotLeader => Code::FailedPrecondition,
        ErrorKind::Unavailable => Code::Unavailable,
        ErrorKind::Unauthenticated => Code::Unauthenticated,
        ErrorKind::PermissionDenied | ErrorKind::ReadOnlyEndpoint => Code::PermissionDenied,
        ErrorKind::Transient => Code::Aborted,
        ErrorKind::Fatal => Code::Internal,
    }
}

/// Builds a status tagged with its kind.
pub fn status(kind: ErrorKind, message: impl Into<String>) -> Status {
    let mut status = Status::new(code_for(kind), message.into());
    if let Ok(value) = MetadataValue::try_from(kind.as_str()) {
        status.metadata_mut().insert(ERROR_KIND_KEY, value);
    }
    status
}

/// `NotLeader`, carrying the leader's address when known so clients can
/// redial without a discovery round trip.
pub fn not_leader(leader_addr: Option<&str>) -> Status {
    let mut status = status(
        ErrorKind::NotLeader,
        match leader_addr {
            Some(addr) => format!("not the leader; leader is at {addr}"),
            None => "not the leader; no leader currently known".to_string(),
        },
    );
    if let Some(addr) = leader_addr {
        if let Ok(value) = MetadataValue::try_from(addr) {
            status.metadata_mut().insert(LEADER_ADDR_KEY, value);
        }
    }
    status
}

/// The structured rejection every mutating call gets on the local socket.
pub fn read_only_endpoint() -> Status {
    status(
        ErrorKind::ReadOnlyEndpoint,
        "local endpoint is read-only; use the remote endpoint with credentials",
    )
}

/// Client side: extracts the advertised leader address, if any.
pub fn leader_hint(status: &Status) -> Option<String> {
    status
        .metadata()
        .get(LEADER_ADDR_KEY)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Client side: recovers the originating kind, if tagged.
pub fn kind_of(status: &Status) -> Option<ErrorKind> {
    let tag = status.metadata().get(ERROR_KIND_KEY)?.to_str().ok()?;
    Some(match tag {
        "validation" => ErrorKind::Validation,
        "not-found" => ErrorKind::NotFound,
        "already-exists" => ErrorKind::AlreadyExists,
        "not-leader" => ErrorKind::NotLeader,
        "unavailable" => ErrorKind::Unavailable,
        "unauthenticated" => ErrorKind::Unauthenticated,
        "permission-denied" => ErrorKind::PermissionDenied,
        "read-only-endpoint" => ErrorKind::ReadOnlyEndpoint,
        "transient" => ErrorKind::Transient,
        "fatal" => ErrorKind::Fatal,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_leader_carries_the_address() {
        let status = not_leader(Some("10.0.0.3:7011"));
        assert_eq!(status.code(), Code::FailedPrecondition);
        assert_eq!(leader_hint(&status).as_deref(), Some("10.0.0.3:7011"));
        assert_eq!(kind_of(&status), Some(ErrorKind::NotLeader));
    }

    #[test]
    fn read_only_is_permission_denied_with_kind() {
        let status = read_only_endpoint();
        assert_eq!(status.code(), Code::PermissionDenied);
        assert_eq!(kind_of(&status), Some(ErrorKind::ReadOnlyEndpoint));
    }

    #[test]
    fn every_kind_has_a_code() {
        for kind in [
            ErrorKind::Validation,
            ErrorKind::NotFound,
            ErrorKind::AlreadyExists,
            ErrorKind::NotLeader,
            ErrorKind::Unavailable,
            ErrorKind::Unauthenticated,
            ErrorKind::PermissionDenied,
            ErrorKind::ReadOnlyEndpoint,
            ErrorKind::Transient,
            ErrorKind::Fatal,
        ] {
            let status = status(kind, "x");
            assert_eq!(kind_of(&status), Some(kind), "kind {kind} round-trips");
        }
    }
}
