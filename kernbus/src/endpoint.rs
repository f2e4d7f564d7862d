//! Endpoints: attachment points on a bus, and the message send path.
//!
//! Every bus has a default endpoint; additional endpoints carry their own
//! policy database and can restrict which names their clients may own,
//! address, or observe. The send path lives here: destination resolution,
//! policy check, enqueue, and reply-deadline registration.

use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use crate::bus::Bus;
use crate::connection::Connection;
use crate::error::{BrokerError, Result};
use crate::message::{Destination, KernelMessage, Message, MessageFlags};
use crate::policy::{PolicyAccess, PolicyDb};
use crate::types::{ConnectionId, Credentials, EndpointId, LifecycleState, MessageId};

#[derive(Debug)]
struct EndpointInner {
    state: LifecycleState,
    /// Attached connections, non-owning; the bus connection table holds
    /// the owning references.
    connections: Vec<Weak<Connection>>,
}

/// An attachment point on a bus.
#[derive(Debug)]
pub struct Endpoint {
    name: String,
    id: EndpointId,
    /// Minor number within the namespace's major.
    minor: u64,
    mode: u32,
    owner: Credentials,
    bus: Weak<Bus>,
    policy: PolicyDb,
    inner: Mutex<EndpointInner>,
}

impl Endpoint {
    /// Create an endpoint on `bus`, with a minor already allocated from
    /// the namespace.
    pub(crate) fn create(
        bus: &Arc<Bus>,
        name: &str,
        mode: u32,
        owner: Credentials,
        minor: u64,
    ) -> Result<Arc<Self>> {
        let endpoint = bus.register_endpoint(name, |id| {
            Arc::new(Self {
                name: name.to_string(),
                id,
                minor,
                mode,
                owner,
                bus: Arc::downgrade(bus),
                policy: PolicyDb::new(),
                inner: Mutex::new(EndpointInner {
                    state: LifecycleState::Active,
                    connections: Vec::new(),
                }),
            })
        })?;
        tracing::debug!(endpoint = name, id = %endpoint.id(), minor, "endpoint created");
        Ok(endpoint)
    }

    /// Name of this endpoint, unique within its bus.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of this endpoint within its bus.
    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// Minor number of this endpoint in its namespace's major.
    pub fn minor(&self) -> u64 {
        self.minor
    }

    /// Permission mode of the endpoint node.
    pub fn mode(&self) -> u32 {
        self.mode
    }

    /// Credentials of the endpoint's owner.
    pub fn owner(&self) -> Credentials {
        self.owner
    }

    /// This endpoint's access-policy database.
    pub fn policy(&self) -> &PolicyDb {
        &self.policy
    }

    /// The bus behind this endpoint, if it is still alive.
    pub fn bus(&self) -> Option<Arc<Bus>> {
        self.bus.upgrade()
    }

    /// Whether the endpoint still accepts new operations.
    pub fn is_active(&self) -> bool {
        self.inner.lock().unwrap().state.is_active()
    }

    /// Attach a freshly opened connection.
    pub(crate) fn attach(&self, conn: &Arc<Connection>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.state.is_active() {
            return Err(BrokerError::NotFound(format!("endpoint '{}'", self.name)));
        }
        inner.connections.retain(|weak| weak.strong_count() > 0);
        inner.connections.push(Arc::downgrade(conn));
        Ok(())
    }

    /// Drop a closed connection from the attachment list.
    pub(crate) fn detach(&self, id: ConnectionId) {
        self.inner
            .lock()
            .unwrap()
            .connections
            .retain(|weak| weak.upgrade().is_some_and(|conn| conn.id() != id));
    }

    /// Send a message from `sender` through this endpoint.
    ///
    /// Resolves the destination (by connection id, by well-known name via
    /// the registry, or broadcast), checks policy, enqueues onto the
    /// destination queue (shared by reference for broadcast) and, when
    /// the message expects a reply with a deadline, registers that
    /// deadline on the sender for timeout scanning.
    ///
    /// Broadcast enqueue failures are dropped per recipient; unicast
    /// failures are returned to the caller.
    pub fn send(&self, sender: &Arc<Connection>, msg: Message) -> Result<MessageId> {
        sender.ensure_active()?;
        if sender.endpoint()?.id() != self.id {
            return Err(BrokerError::InvalidArgument(
                "sender is not attached to this endpoint".into(),
            ));
        }
        if !self.is_active() {
            return Err(BrokerError::NotFound(format!("endpoint '{}'", self.name)));
        }
        let bus = self
            .bus
            .upgrade()
            .ok_or_else(|| BrokerError::NotFound("bus".into()))?;

        let id = bus.next_message_id()?;
        let kmsg = Arc::new(KernelMessage::from_user(id, sender.id(), msg)?);

        match kmsg.destination.clone() {
            Destination::Broadcast => {
                for conn in bus.connections_snapshot() {
                    if conn.id() == sender.id() || !conn.is_active() {
                        continue;
                    }
                    let Ok(endpoint) = conn.endpoint() else {
                        continue;
                    };
                    if !endpoint
                        .policy()
                        .check(conn.creds(), PolicyAccess::RECV, None)
                    {
                        continue;
                    }
                    if let Err(err) = conn.enqueue(Arc::clone(&kmsg)) {
                        tracing::trace!(
                            connection = %conn.id(),
                            %err,
                            "dropping broadcast for unreachable connection"
                        );
                    }
                }
            }
            Destination::Name(name) => {
                if !self
                    .policy
                    .check(sender.creds(), PolicyAccess::SEND, Some(&name))
                {
                    return Err(BrokerError::PermissionDenied(format!(
                        "not allowed to send to '{name}'"
                    )));
                }
                let owner_id = bus
                    .registry()
                    .resolve(&name)
                    .ok_or_else(|| BrokerError::NotFound(format!("name '{name}'")))?;
                let dst = bus
                    .connection(owner_id)
                    .filter(|conn| conn.is_active())
                    .ok_or_else(|| BrokerError::NotFound(format!("owner of '{name}'")))?;
                self.deliver_unicast(sender, &dst, &kmsg)?;
            }
            Destination::Connection(dst_id) => {
                let dst = bus
                    .connection(dst_id)
                    .filter(|conn| conn.is_active())
                    .ok_or_else(|| BrokerError::NotFound(format!("connection {dst_id}")))?;
                self.deliver_unicast(sender, &dst, &kmsg)?;
            }
        }

        tracing::debug!(
            message = %id,
            src = %sender.id(),
            dst = ?kmsg.destination,
            "message sent"
        );
        Ok(id)
    }

    /// Unicast tail of the send path: reply correlation, enqueue, and
    /// deadline registration.
    fn deliver_unicast(
        &self,
        sender: &Arc<Connection>,
        dst: &Arc<Connection>,
        kmsg: &Arc<KernelMessage>,
    ) -> Result<()> {
        // An arriving reply cancels the matching pending deadline before
        // the next timer scan can see it.
        if kmsg.cookie_reply != 0 {
            dst.complete_reply(sender.id(), kmsg.cookie_reply);
        }
        dst.enqueue(Arc::clone(kmsg))?;
        if kmsg.flags.contains(MessageFlags::EXPECT_REPLY) {
            if let Some(deadline) = kmsg.reply_deadline {
                sender.register_reply(dst.id(), kmsg.cookie, Instant::now() + deadline);
            }
        }
        Ok(())
    }

    /// Logically remove this endpoint, closing every attached connection.
    ///
    /// Idempotent. The attachment list is collected under the endpoint
    /// lock and the closes run after it is released.
    pub fn disconnect(&self) {
        let connections = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.state.is_active() {
                return;
            }
            inner.state = LifecycleState::Disconnected;
            std::mem::take(&mut inner.connections)
        };
        for weak in connections {
            if let Some(conn) = weak.upgrade() {
                conn.close();
            }
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.detach_endpoint(self.id);
        }
        tracing::debug!(endpoint = %self.name, id = %self.id, "endpoint disconnected");
    }
}
