//! Connections: a client's live attachment to the broker.
//!
//! A connection is a tagged variant over the four things a client can
//! hold open: the control node, a namespace-owner slot, a bus-owner slot,
//! or an endpoint. Exactly one parent reference is populated per variant.
//!
//! Endpoint clients follow the state machine
//! `created → active (hello) → disconnected (terminal)`. While active they
//! send, receive, and operate on names; each one owns a reply tracker
//! whose outstanding deadlines are scanned periodically, synthesizing a
//! reply-timeout notification for every expired entry.
//!
//! Close is the two-phase teardown's first phase: the connection is
//! removed from every table, its names are released or handed off, its
//! blocked receivers are woken with `ConnectionClosed`, and peers waiting
//! on replies from it get a reply-dead notification. Storage is reclaimed
//! only when the last handle drops.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use tokio::task::JoinHandle;

use crate::bus::Bus;
use crate::endpoint::Endpoint;
use crate::error::{BrokerError, Result};
use crate::message::{KernelMessage, Message, MessageQueue};
use crate::names::{AcquireOutcome, NameFlags, NameInfo};
use crate::namespace::Namespace;
use crate::notify::{self, Notification};
use crate::policy::PolicyRule;
use crate::types::{ConnectionId, Credentials, LifecycleState, MessageId};

bitflags! {
    /// Flags for the hello handshake.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HelloFlags: u64 {
        /// Register as a starter connection. Carried on the handshake
        /// only; the broker attaches no further semantics to it.
        const STARTER = 1 << 0;
    }
}

/// Which kind of entity a connection is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    /// Attached to a namespace's control node.
    Control,
    /// Owns a namespace it created; closing disconnects the namespace.
    NamespaceOwner,
    /// Owns a bus it created; closing disconnects the bus.
    BusOwner,
    /// Attached to an endpoint for messaging.
    EndpointClient,
}

/// Per-variant parent reference. Exactly one payload is populated; the
/// owner variants hold the owning handle that keeps the created entity
/// alive until the connection closes.
#[derive(Debug)]
enum ConnectionKind {
    Control { namespace: Weak<Namespace> },
    NamespaceOwner(Arc<Namespace>),
    BusOwner(Arc<Bus>),
    EndpointClient(Arc<Endpoint>),
}

impl ConnectionKind {
    fn tag(&self) -> ConnectionType {
        match self {
            ConnectionKind::Control { .. } => ConnectionType::Control,
            ConnectionKind::NamespaceOwner(_) => ConnectionType::NamespaceOwner,
            ConnectionKind::BusOwner(_) => ConnectionType::BusOwner,
            ConnectionKind::EndpointClient(_) => ConnectionType::EndpointClient,
        }
    }
}

#[derive(Debug)]
struct ConnectionInner {
    state: LifecycleState,
    /// Whether the hello handshake has completed.
    active: bool,
    starter: bool,
    kind: ConnectionKind,
    owned_names: Vec<String>,
    queued_names: Vec<String>,
}

/// An outstanding reply deadline registered at send time.
#[derive(Debug)]
struct ReplyEntry {
    peer: ConnectionId,
    cookie: u64,
    deadline: Instant,
}

/// Reply deadlines of one connection, scanned by the timer task.
#[derive(Default)]
#[derive(Debug)]
struct ReplyTracker {
    entries: Mutex<Vec<ReplyEntry>>,
}

impl ReplyTracker {
    fn register(&self, peer: ConnectionId, cookie: u64, deadline: Instant) {
        self.entries.lock().unwrap().push(ReplyEntry {
            peer,
            cookie,
            deadline,
        });
    }

    /// Remove the entry matching an arrived reply. Returns whether an
    /// entry was pending.
    fn complete(&self, peer: ConnectionId, cookie: u64) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|entry| !(entry.peer == peer && entry.cookie == cookie));
        entries.len() != before
    }

    /// Remove and return every entry past `now`.
    fn take_expired(&self, now: Instant) -> Vec<ReplyEntry> {
        let mut entries = self.entries.lock().unwrap();
        let mut expired = Vec::new();
        entries.retain(|entry| {
            if entry.deadline <= now {
                expired.push(ReplyEntry {
                    peer: entry.peer,
                    cookie: entry.cookie,
                    deadline: entry.deadline,
                });
                false
            } else {
                true
            }
        });
        expired
    }

    /// Remove and return every entry waiting on `peer`.
    fn drain_for_peer(&self, peer: ConnectionId) -> Vec<ReplyEntry> {
        let mut entries = self.entries.lock().unwrap();
        let mut drained = Vec::new();
        entries.retain(|entry| {
            if entry.peer == peer {
                drained.push(ReplyEntry {
                    peer: entry.peer,
                    cookie: entry.cookie,
                    deadline: entry.deadline,
                });
                false
            } else {
                true
            }
        });
        drained
    }

    fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// A client's live attachment to a control node, owner slot, or endpoint.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    creds: Credentials,
    queue: MessageQueue,
    replies: ReplyTracker,
    inner: Mutex<ConnectionInner>,
    scanner: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Open a control connection on a namespace.
    pub(crate) fn control(namespace: &Arc<Namespace>, creds: Credentials) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::KERNEL,
            creds,
            queue: MessageQueue::new(),
            replies: ReplyTracker::default(),
            inner: Mutex::new(ConnectionInner {
                state: LifecycleState::Active,
                active: false,
                starter: false,
                kind: ConnectionKind::Control {
                    namespace: Arc::downgrade(namespace),
                },
                owned_names: Vec::new(),
                queued_names: Vec::new(),
            }),
            scanner: Mutex::new(None),
        })
    }

    /// Open an endpoint-client connection with a bus-allocated id.
    pub(crate) fn endpoint_client(
        endpoint: &Arc<Endpoint>,
        id: ConnectionId,
        creds: Credentials,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            creds,
            queue: MessageQueue::new(),
            replies: ReplyTracker::default(),
            inner: Mutex::new(ConnectionInner {
                state: LifecycleState::Active,
                active: false,
                starter: false,
                kind: ConnectionKind::EndpointClient(Arc::clone(endpoint)),
                owned_names: Vec::new(),
                queued_names: Vec::new(),
            }),
            scanner: Mutex::new(None),
        })
    }

    /// Id of this connection on its bus. Control connections carry id 0.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Credentials supplied by the device-node layer at open time.
    pub fn creds(&self) -> Credentials {
        self.creds
    }

    /// Which kind of entity this connection is attached to.
    pub fn connection_type(&self) -> ConnectionType {
        self.inner.lock().unwrap().kind.tag()
    }

    /// Whether the connection has not been closed yet.
    pub fn is_open(&self) -> bool {
        self.inner.lock().unwrap().state.is_active()
    }

    /// Whether the connection is open and has completed its handshake.
    pub fn is_active(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.state.is_active() && inner.active
    }

    /// Whether the connection registered as a starter.
    pub fn is_starter(&self) -> bool {
        self.inner.lock().unwrap().starter
    }

    /// Complete the hello handshake, activating the connection.
    ///
    /// Emits an id-owner-changed notification bus-wide. Fails on control
    /// and owner connections, on a second hello, and after close.
    pub fn hello(self: &Arc<Self>, flags: HelloFlags) -> Result<ConnectionId> {
        let endpoint = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.state.is_active() {
                return Err(BrokerError::ConnectionClosed);
            }
            let ConnectionKind::EndpointClient(endpoint) = &inner.kind else {
                return Err(BrokerError::InvalidArgument(
                    "hello is only valid on an endpoint connection".into(),
                ));
            };
            if inner.active {
                return Err(BrokerError::InvalidArgument(
                    "hello already exchanged".into(),
                ));
            }
            let endpoint = Arc::clone(endpoint);
            inner.active = true;
            inner.starter = flags.contains(HelloFlags::STARTER);
            endpoint
        };
        if let Some(bus) = endpoint.bus() {
            notify::id_changed(&bus, self.id, true);
        }
        tracing::debug!(connection = %self.id, "hello exchanged");
        Ok(self.id)
    }

    /// The endpoint this connection is attached to.
    ///
    /// Fails with `InvalidArgument` for control and owner connections.
    pub fn endpoint(&self) -> Result<Arc<Endpoint>> {
        let inner = self.inner.lock().unwrap();
        if !inner.state.is_active() {
            return Err(BrokerError::ConnectionClosed);
        }
        match &inner.kind {
            ConnectionKind::EndpointClient(endpoint) => Ok(Arc::clone(endpoint)),
            _ => Err(BrokerError::InvalidArgument(
                "connection is not attached to an endpoint".into(),
            )),
        }
    }

    /// Fail unless the connection is open and has said hello.
    pub(crate) fn ensure_active(&self) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        if !inner.state.is_active() {
            return Err(BrokerError::ConnectionClosed);
        }
        if !inner.active {
            return Err(BrokerError::InvalidArgument(
                "hello not yet exchanged".into(),
            ));
        }
        Ok(())
    }

    /// Send a message through this connection's endpoint.
    pub fn send(self: &Arc<Self>, msg: Message) -> Result<MessageId> {
        self.endpoint()?.send(self, msg)
    }

    /// Wait for the oldest message in this connection's queue.
    ///
    /// Blocks until a message arrives or the connection is disconnected,
    /// in which case it fails with `ConnectionClosed` rather than hanging.
    pub async fn recv(&self) -> Result<Arc<KernelMessage>> {
        self.queue.recv().await
    }

    /// This connection's inbound queue, for non-blocking inspection.
    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    /// Acquire a well-known name, or join its wait queue.
    pub fn name_acquire(self: &Arc<Self>, name: &str, flags: NameFlags) -> Result<AcquireOutcome> {
        let bus = self.bus()?;
        bus.registry().acquire(&bus, self, name, flags)
    }

    /// Release a well-known name this connection owns or awaits.
    pub fn name_release(self: &Arc<Self>, name: &str) -> Result<()> {
        let bus = self.bus()?;
        bus.registry().release(&bus, self, name)
    }

    /// List all names visible to this connection.
    pub fn name_list(self: &Arc<Self>) -> Result<Vec<NameInfo>> {
        let bus = self.bus()?;
        bus.registry().list(self)
    }

    /// Query the current owner of a name.
    pub fn name_query(self: &Arc<Self>, name: &str) -> Result<NameInfo> {
        self.ensure_active()?;
        let bus = self.bus()?;
        bus.registry().query(name)
    }

    /// Replace this connection's endpoint policy table.
    pub fn policy_load(&self, rules: Vec<PolicyRule>) -> Result<()> {
        self.endpoint()?.policy().load(rules)
    }

    /// Names this connection currently owns.
    pub fn owned_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().owned_names.clone()
    }

    /// Names this connection currently waits for.
    pub fn queued_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().queued_names.clone()
    }

    /// Outstanding reply deadlines, for diagnostics and tests.
    pub fn pending_replies(&self) -> usize {
        self.replies.len()
    }

    /// Turn a control connection into the owner of a namespace it created.
    pub(crate) fn become_namespace_owner(&self, namespace: Arc<Namespace>) -> Result<()> {
        self.become_owner(ConnectionKind::NamespaceOwner(namespace))
    }

    /// Turn a control connection into the owner of a bus it created.
    pub(crate) fn become_bus_owner(&self, bus: Arc<Bus>) -> Result<()> {
        self.become_owner(ConnectionKind::BusOwner(bus))
    }

    fn become_owner(&self, kind: ConnectionKind) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.state.is_active() {
            return Err(BrokerError::ConnectionClosed);
        }
        if !matches!(inner.kind, ConnectionKind::Control { .. }) {
            return Err(BrokerError::InvalidArgument(
                "connection already owns an entity or is not a control connection".into(),
            ));
        }
        inner.kind = kind;
        Ok(())
    }

    /// The namespace behind a control connection.
    pub(crate) fn control_namespace(&self) -> Result<Arc<Namespace>> {
        let inner = self.inner.lock().unwrap();
        if !inner.state.is_active() {
            return Err(BrokerError::ConnectionClosed);
        }
        match &inner.kind {
            ConnectionKind::Control { namespace } => namespace
                .upgrade()
                .ok_or_else(|| BrokerError::NotFound("namespace".into())),
            _ => Err(BrokerError::InvalidArgument(
                "not a control connection".into(),
            )),
        }
    }

    fn bus(&self) -> Result<Arc<Bus>> {
        self.endpoint()?
            .bus()
            .ok_or_else(|| BrokerError::NotFound("bus".into()))
    }

    /// Enqueue a message onto this connection's inbound queue.
    pub(crate) fn enqueue(&self, message: Arc<KernelMessage>) -> Result<()> {
        self.queue.push(message)
    }

    /// Register an outstanding reply deadline at send time.
    pub(crate) fn register_reply(&self, peer: ConnectionId, cookie: u64, deadline: Instant) {
        self.replies.register(peer, cookie, deadline);
    }

    /// Cancel a pending deadline for an arrived reply.
    pub(crate) fn complete_reply(&self, peer: ConnectionId, cookie: u64) -> bool {
        self.replies.complete(peer, cookie)
    }

    // -- Name bookkeeping, driven by the registry after its lock drops. --

    pub(crate) fn record_owned_name(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.owned_names.iter().any(|n| n == name) {
            inner.owned_names.push(name.to_string());
        }
    }

    pub(crate) fn forget_owned_name(&self, name: &str) {
        self.inner.lock().unwrap().owned_names.retain(|n| n != name);
    }

    pub(crate) fn record_queued_name(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.queued_names.iter().any(|n| n == name) {
            inner.queued_names.push(name.to_string());
        }
    }

    pub(crate) fn forget_queued_name(&self, name: &str) {
        self.inner
            .lock()
            .unwrap()
            .queued_names
            .retain(|n| n != name);
    }

    pub(crate) fn name_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.owned_names.len() + inner.queued_names.len()
    }

    /// Scan outstanding reply deadlines against `now`.
    ///
    /// Every expired entry is removed and synthesizes exactly one
    /// reply-timeout notification into this connection's own queue;
    /// subsequent scans cannot see a removed entry again. Returns the
    /// number of entries that expired.
    pub fn scan_reply_deadlines(self: &Arc<Self>, now: Instant) -> usize {
        let expired = self.replies.take_expired(now);
        if expired.is_empty() {
            return 0;
        }
        let bus = match self.bus() {
            Ok(bus) => bus,
            Err(_) => return expired.len(),
        };
        for entry in &expired {
            tracing::debug!(
                connection = %self.id,
                peer = %entry.peer,
                cookie = entry.cookie,
                "reply deadline expired"
            );
            notify::deliver_to(
                &bus,
                self,
                Notification::ReplyTimeout {
                    peer: entry.peer,
                    cookie: entry.cookie,
                },
            );
        }
        expired.len()
    }

    /// Spawn this connection's recurring reply-deadline scanner.
    ///
    /// The task re-arms itself each `period` regardless of individual
    /// scan outcomes and exits when the connection closes. Must be called
    /// from within a tokio runtime; tests may instead drive
    /// [`scan_reply_deadlines`](Self::scan_reply_deadlines) directly.
    pub fn spawn_reply_scanner(self: &Arc<Self>, period: Duration) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(conn) = weak.upgrade() else {
                    break;
                };
                if !conn.is_open() {
                    break;
                }
                conn.scan_reply_deadlines(Instant::now());
            }
        });
        let mut scanner = self.scanner.lock().unwrap();
        if let Some(old) = scanner.replace(handle) {
            old.abort();
        }
    }

    /// Close this connection. Idempotent; terminal.
    ///
    /// For endpoint clients: leaves the bus table and endpoint list,
    /// releases or hands off every owned and queued name, notifies peers
    /// whose outstanding replies can no longer arrive, emits the
    /// id-owner-changed notification, cancels the scanner, and drains the
    /// queue, waking blocked receivers. For owner connections: disconnects
    /// the owned namespace or bus, cascading.
    pub fn close(self: &Arc<Self>) {
        let (kind, was_active) = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.state.is_active() {
                return;
            }
            inner.state = LifecycleState::Disconnected;
            let was_active = inner.active;
            inner.active = false;
            let kind = std::mem::replace(
                &mut inner.kind,
                ConnectionKind::Control {
                    namespace: Weak::new(),
                },
            );
            (kind, was_active)
        };

        match kind {
            ConnectionKind::EndpointClient(endpoint) => {
                let bus = endpoint.bus();
                if let Some(bus) = &bus {
                    bus.remove_connection(self.id);
                }
                endpoint.detach(self.id);
                if let Some(bus) = &bus {
                    // Name hand-off and its notifications happen after we
                    // left the table, so we never observe our own wake.
                    bus.registry().remove_by_connection(bus, self);

                    // Peers waiting on replies from us will never get one.
                    for peer in bus.connections_snapshot() {
                        for entry in peer.replies.drain_for_peer(self.id) {
                            notify::deliver_to(
                                bus,
                                &peer,
                                Notification::ReplyDead {
                                    peer: self.id,
                                    cookie: entry.cookie,
                                },
                            );
                        }
                    }

                    if was_active {
                        notify::id_changed(bus, self.id, false);
                    }
                }
            }
            ConnectionKind::BusOwner(bus) => {
                bus.disconnect();
            }
            ConnectionKind::NamespaceOwner(namespace) => {
                namespace.disconnect();
            }
            ConnectionKind::Control { .. } => {}
        }

        if let Some(handle) = self.scanner.lock().unwrap().take() {
            handle.abort();
        }
        self.replies.clear();
        let dropped = self.queue.close();
        tracing::info!(connection = %self.id, dropped, "connection closed");
    }
}
