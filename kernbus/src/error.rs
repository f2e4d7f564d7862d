//! Error types for the kernbus broker.

use thiserror::Error;

/// Errors returned by broker operations.
///
/// Every fallible operation in the crate reports one of these variants.
/// Lookup and policy failures are returned synchronously to the caller;
/// cleanup work triggered by disconnects is best-effort and never surfaces
/// through this type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// Unknown namespace, bus, endpoint, connection, or name.
    #[error("not found: {0}")]
    NotFound(String),

    /// Name or id collision on create.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Policy check failed.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Name acquisition failed and the caller requested neither
    /// replacement nor queueing (or the owner forbids them).
    #[error("name in use: {0}")]
    NameInUse(String),

    /// Malformed name, out-of-range deadline, oversized payload, or an
    /// operation issued against the wrong kind of connection.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation attempted on, or blocking call interrupted by, a
    /// disconnected connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// Id space or queue-depth limit reached.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BrokerError>;
