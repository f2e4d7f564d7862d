//! Core identifier types, credentials, and crate-wide limits.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
            Serialize, Deserialize,
        )]
        pub struct $name(u64);

        impl $name {
            /// Create an id with an explicit value.
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Raw value of this id.
            pub const fn value(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type! {
    /// Global identifier of a namespace.
    NamespaceId
}

id_type! {
    /// Identifier of a bus within its namespace.
    BusId
}

id_type! {
    /// Identifier of an endpoint within its bus.
    EndpointId
}

id_type! {
    /// Identifier of a connection within its bus.
    ///
    /// Ids are monotonic per bus and never reused while the bus lives.
    /// Id 0 is reserved for broker-synthesized messages.
    ConnectionId
}

id_type! {
    /// Identifier of a message within its bus, allocated at send time.
    MessageId
}

impl ConnectionId {
    /// Source id carried by broker-synthesized notification messages.
    pub const KERNEL: ConnectionId = ConnectionId(0);
}

/// User and group identity of the client behind a connection or the owner
/// of an endpoint. Supplied by the device-node layer when a node is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credentials {
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
}

impl Credentials {
    /// Create credentials from a uid/gid pair.
    pub const fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// Credentials of uid/gid 0.
    pub const fn root() -> Self {
        Self { uid: 0, gid: 0 }
    }
}

/// Logical lifecycle of a namespace, bus, endpoint, or connection.
///
/// Disconnect is one-way: no entity transitions back to `Active`. Physical
/// destruction is not a state here; it happens when the last handle is
/// dropped, which may be well after the disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Usable for new operations.
    Active,
    /// Logically removed; existing holders may still finish in-flight
    /// work, but every state-changing operation fails.
    Disconnected,
}

impl LifecycleState {
    /// Whether new operations may start against the entity.
    pub fn is_active(&self) -> bool {
        matches!(self, LifecycleState::Active)
    }
}

/// Resource limits enforced by the broker.
pub mod limits {
    use std::time::Duration;

    /// Maximum messages held in one connection's inbound queue.
    pub const MAX_QUEUE_DEPTH: usize = 1024;

    /// Maximum names a single connection may own or queue for.
    pub const MAX_NAMES_PER_CONNECTION: usize = 256;

    /// Maximum length of a well-known name, in bytes.
    pub const MAX_NAME_LEN: usize = 255;

    /// Maximum user payload size accepted by `send`, in bytes.
    pub const MAX_PAYLOAD_SIZE: usize = 8 * 1024 * 1024;

    /// Upper bound for a reply deadline.
    pub const MAX_REPLY_DEADLINE: Duration = Duration::from_secs(300);
}
