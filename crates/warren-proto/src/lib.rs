//! # warren-proto: the wire surface
//!
//! Generated tonic/prost types for the control-plane RPC schema, the
//! conversions between wire and domain records, and the error-kind ↔
//! status-code mapping both sides of every call rely on.
//!
//! The schema lives in `proto/warren.proto`. IDs travel as 32-char hex
//! strings; timestamps as epoch milliseconds.

pub mod convert;
pub mod status;

/// Generated protobuf/gRPC types.
#[allow(clippy::pedantic, clippy::all)]
pub mod pb {
    tonic::include_proto!("warren");
}

pub use convert::ConvertError;
