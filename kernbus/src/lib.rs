//! # Kernbus Message Broker
//!
//! An in-process message bus broker modeled on the capability-based
//! bus brokers of the systemd era:
//! - A tree of namespaces, each holding independent buses
//! - Buses with a default endpoint plus optional policy-scoped endpoints
//! - Connections with a hello handshake, unique bus-wide ids, and
//!   bounded FIFO inbound queues with async receive
//! - A well-known-name registry with replacement and wait-queue
//!   semantics and FIFO hand-off on release
//! - Unicast, name-addressed, and broadcast delivery with per-endpoint
//!   policy enforcement
//! - Synthetic broker notifications for name and id ownership changes
//!   and for expired or dead reply expectations
//!
//! Everything cascades on teardown: closing an owner connection
//! disconnects the bus or namespace it created, which closes every
//! connection underneath and releases every name they held.

#![deny(missing_docs)]

/// Broker root and control-plane operations.
pub mod broker;
/// Buses and their connection and endpoint tables.
pub mod bus;
/// Connections, the hello handshake, and reply deadlines.
pub mod connection;
/// Endpoints and the message send path.
pub mod endpoint;
/// Error types shared across the broker.
pub mod error;
/// Messages, queues, and async receive.
pub mod message;
/// The well-known-name registry.
pub mod names;
/// Namespace tree and device-number allocation.
pub mod namespace;
/// Synthetic broker notifications.
pub mod notify;
/// Per-endpoint policy database.
pub mod policy;
/// Identifiers, credentials, and broker-wide limits.
pub mod types;

// Public API exports
pub use broker::Broker;
pub use bus::Bus;
pub use connection::{Connection, ConnectionType, HelloFlags};
pub use endpoint::Endpoint;
pub use error::{BrokerError, Result};
pub use message::{Destination, KernelMessage, Message, MessageFlags, MessagePayload, MessageQueue};
pub use names::{name_is_valid, AcquireOutcome, NameFlags, NameInfo};
pub use namespace::{Namespace, DEFAULT_ENDPOINT_NAME};
pub use notify::Notification;
pub use policy::{PolicyAccess, PolicyDb, PolicyRule, PolicySubject};
pub use types::{
    limits, BusId, ConnectionId, Credentials, EndpointId, LifecycleState, MessageId, NamespaceId,
};
