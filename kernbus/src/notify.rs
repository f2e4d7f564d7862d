//! Broker-synthesized notifications.
//!
//! Four message kinds are synthesized here and injected into recipient
//! queues: name-owner-changed and id-owner-changed fan out bus-wide
//! (policy-filtered), reply-timeout and reply-dead are delivered to the
//! original sender only. All of them travel as ordinary [`KernelMessage`]s
//! with the `SYNTHETIC` flag and source id 0; the transport path is the
//! same one user messages take.
//!
//! Delivery is best-effort: a full or closed recipient queue drops the
//! notification silently. A dropped notification never fails the
//! operation that triggered it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bus::Bus;
use crate::connection::Connection;
use crate::message::{Destination, KernelMessage};
use crate::names::NameFlags;
use crate::policy::PolicyAccess;
use crate::types::ConnectionId;

/// Body of a broker-synthesized message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    /// Ownership of a well-known name changed. Either side may be absent:
    /// `old == None` for a first acquisition, `new == None` for a release
    /// with an empty queue.
    NameOwnerChanged {
        /// The name whose ownership changed.
        name: String,
        /// Previous owner, if any.
        old: Option<ConnectionId>,
        /// New owner, if any.
        new: Option<ConnectionId>,
        /// Flags the new ownership record carries.
        flags: NameFlags,
    },

    /// A connection appeared on the bus (completed its handshake).
    IdAdded(ConnectionId),

    /// A connection disappeared from the bus.
    IdRemoved(ConnectionId),

    /// An outstanding reply deadline expired before the reply arrived.
    ReplyTimeout {
        /// The connection the reply was expected from.
        peer: ConnectionId,
        /// Cookie of the original message.
        cookie: u64,
    },

    /// The destination of a reply-expecting message closed before
    /// replying.
    ReplyDead {
        /// The connection that closed.
        peer: ConnectionId,
        /// Cookie of the original message.
        cookie: u64,
    },
}

/// Broadcast a name-owner-changed notification to every eligible listener.
pub(crate) fn name_owner_changed(
    bus: &Arc<Bus>,
    name: &str,
    old: Option<ConnectionId>,
    new: Option<ConnectionId>,
    flags: NameFlags,
) {
    broadcast(
        bus,
        Notification::NameOwnerChanged {
            name: name.to_string(),
            old,
            new,
            flags,
        },
        Some(name),
    );
}

/// Broadcast an id-owner-changed notification for a connection that
/// appeared or disappeared on the bus.
pub(crate) fn id_changed(bus: &Arc<Bus>, id: ConnectionId, added: bool) {
    let note = if added {
        Notification::IdAdded(id)
    } else {
        Notification::IdRemoved(id)
    };
    broadcast(bus, note, None);
}

/// Deliver a notification to a single connection's queue.
pub(crate) fn deliver_to(bus: &Arc<Bus>, conn: &Connection, note: Notification) {
    let id = match bus.next_message_id() {
        Ok(id) => id,
        Err(err) => {
            tracing::trace!(%err, "skipping notification, bus gone");
            return;
        }
    };
    let message = Arc::new(KernelMessage::synthetic(
        id,
        Destination::Connection(conn.id()),
        note,
    ));
    if let Err(err) = conn.enqueue(message) {
        tracing::warn!(
            connection = %conn.id(),
            %err,
            "dropping undeliverable notification"
        );
    }
}

/// Fan a notification out to every active connection on the bus whose
/// endpoint policy lets it observe `name`. Per-recipient failures are
/// dropped silently.
fn broadcast(bus: &Arc<Bus>, note: Notification, name: Option<&str>) {
    let id = match bus.next_message_id() {
        Ok(id) => id,
        Err(err) => {
            tracing::trace!(%err, "skipping notification broadcast, bus gone");
            return;
        }
    };
    let message = Arc::new(KernelMessage::synthetic(id, Destination::Broadcast, note));

    for conn in bus.connections_snapshot() {
        if !conn.is_active() {
            continue;
        }
        let Ok(endpoint) = conn.endpoint() else {
            continue;
        };
        if !endpoint.policy().check(conn.creds(), PolicyAccess::RECV, name) {
            continue;
        }
        if let Err(err) = conn.enqueue(Arc::clone(&message)) {
            tracing::trace!(
                connection = %conn.id(),
                %err,
                "dropping notification for unreachable connection"
            );
        }
    }
}
