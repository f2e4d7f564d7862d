//! Buses: named IPC domains owning endpoints, connections, and a name
//! registry.
//!
//! A bus allocates every endpoint, connection, and message id from its own
//! monotonic counters, all mutated only under the bus lock; ids are never
//! reused while the bus lives. The connection table is the authoritative
//! membership set used for lookups and broadcast fan-out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::error::{BrokerError, Result};
use crate::names::NameRegistry;
use crate::namespace::Namespace;
use crate::types::{BusId, ConnectionId, EndpointId, LifecycleState, MessageId};

#[derive(Debug)]
struct BusInner {
    state: LifecycleState,
    next_endpoint_id: u64,
    next_connection_id: u64,
    next_message_id: u64,
    connections: HashMap<ConnectionId, Arc<Connection>>,
    endpoints: Vec<Arc<Endpoint>>,
    default_endpoint: Option<Arc<Endpoint>>,
}

/// A named IPC domain within a namespace.
#[derive(Debug)]
pub struct Bus {
    name: String,
    id: BusId,
    /// Opaque flags passed through from the creator to bus clients.
    flags: u64,
    mode: u32,
    namespace: Weak<Namespace>,
    registry: NameRegistry,
    inner: Mutex<BusInner>,
}

impl Bus {
    /// Plain construction; the caller (the namespace) holds its own lock,
    /// registers the bus, and attaches the default endpoint.
    pub(crate) fn create(
        namespace: &Arc<Namespace>,
        name: &str,
        id: BusId,
        flags: u64,
        mode: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            id,
            flags,
            mode,
            namespace: Arc::downgrade(namespace),
            registry: NameRegistry::new(),
            inner: Mutex::new(BusInner {
                state: LifecycleState::Active,
                next_endpoint_id: 1,
                next_connection_id: 1,
                next_message_id: 1,
                connections: HashMap::new(),
                endpoints: Vec::new(),
                default_endpoint: None,
            }),
        })
    }

    /// Name of this bus, unique within its namespace.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of this bus within its namespace.
    pub fn id(&self) -> BusId {
        self.id
    }

    /// Opaque creator-supplied flags.
    pub fn flags(&self) -> u64 {
        self.flags
    }

    /// Permission mode of the bus node.
    pub fn mode(&self) -> u32 {
        self.mode
    }

    /// The namespace this bus lives in, if it is still alive.
    pub fn namespace(&self) -> Option<Arc<Namespace>> {
        self.namespace.upgrade()
    }

    /// This bus's well-known-name registry.
    pub fn registry(&self) -> &NameRegistry {
        &self.registry
    }

    /// Whether the bus still accepts new operations.
    pub fn is_active(&self) -> bool {
        self.inner.lock().unwrap().state.is_active()
    }

    /// The default endpoint every bus is created with.
    pub fn default_endpoint(&self) -> Result<Arc<Endpoint>> {
        self.inner
            .lock()
            .unwrap()
            .default_endpoint
            .clone()
            .ok_or_else(|| BrokerError::NotFound(format!("default endpoint of bus '{}'", self.name)))
    }

    /// Look up an additional endpoint by name.
    pub fn find_endpoint(&self, name: &str) -> Option<Arc<Endpoint>> {
        let inner = self.inner.lock().unwrap();
        if !inner.state.is_active() {
            return None;
        }
        inner.endpoints.iter().find(|ep| ep.name() == name).cloned()
    }

    /// Look up a connection by id.
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let inner = self.inner.lock().unwrap();
        if !inner.state.is_active() {
            return None;
        }
        inner.connections.get(&id).cloned()
    }

    /// Snapshot of all connections currently in the table.
    pub(crate) fn connections_snapshot(&self) -> Vec<Arc<Connection>> {
        self.inner
            .lock()
            .unwrap()
            .connections
            .values()
            .cloned()
            .collect()
    }

    /// Number of connections currently in the table.
    pub fn connection_count(&self) -> usize {
        self.inner.lock().unwrap().connections.len()
    }

    /// Allocate the next message id. Fails once the bus is disconnected.
    pub(crate) fn next_message_id(&self) -> Result<MessageId> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.state.is_active() {
            return Err(BrokerError::NotFound(format!("bus '{}'", self.name)));
        }
        let id = MessageId::new(inner.next_message_id);
        inner.next_message_id += 1;
        Ok(id)
    }

    /// Register an endpoint, allocating its id under the bus lock.
    pub(crate) fn register_endpoint(
        &self,
        name: &str,
        build: impl FnOnce(EndpointId) -> Arc<Endpoint>,
    ) -> Result<Arc<Endpoint>> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.state.is_active() {
            return Err(BrokerError::NotFound(format!("bus '{}'", self.name)));
        }
        if inner.endpoints.iter().any(|ep| ep.name() == name) {
            return Err(BrokerError::AlreadyExists(format!("endpoint '{name}'")));
        }
        let id = EndpointId::new(inner.next_endpoint_id);
        inner.next_endpoint_id += 1;
        let endpoint = build(id);
        inner.endpoints.push(Arc::clone(&endpoint));
        Ok(endpoint)
    }

    /// Record the default endpoint right after bus creation.
    pub(crate) fn set_default_endpoint(&self, endpoint: &Arc<Endpoint>) {
        self.inner.lock().unwrap().default_endpoint = Some(Arc::clone(endpoint));
    }

    /// Remove a disconnected endpoint from the list.
    pub(crate) fn detach_endpoint(&self, id: EndpointId) {
        self.inner
            .lock()
            .unwrap()
            .endpoints
            .retain(|ep| ep.id() != id);
    }

    /// Register a connection, allocating its id under the bus lock.
    pub(crate) fn register_connection(
        &self,
        build: impl FnOnce(ConnectionId) -> Arc<Connection>,
    ) -> Result<Arc<Connection>> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.state.is_active() {
            return Err(BrokerError::NotFound(format!("bus '{}'", self.name)));
        }
        let id = ConnectionId::new(inner.next_connection_id);
        inner.next_connection_id += 1;
        let connection = build(id);
        inner.connections.insert(id, Arc::clone(&connection));
        Ok(connection)
    }

    /// Drop a closed connection from the table.
    pub(crate) fn remove_connection(&self, id: ConnectionId) {
        self.inner.lock().unwrap().connections.remove(&id);
    }

    /// Logically remove this bus: disconnect every endpoint, which closes
    /// every connection attached to it.
    ///
    /// Idempotent and one-way. Children are collected under the bus lock
    /// and acted on after it is released, so the per-connection teardown
    /// can re-enter bus bookkeeping without deadlocking.
    pub fn disconnect(self: &Arc<Self>) {
        let (endpoints, connections) = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.state.is_active() {
                return;
            }
            inner.state = LifecycleState::Disconnected;
            inner.default_endpoint = None;
            (
                std::mem::take(&mut inner.endpoints),
                inner
                    .connections
                    .drain()
                    .map(|(_, c)| c)
                    .collect::<Vec<_>>(),
            )
        };
        for endpoint in endpoints {
            endpoint.disconnect();
        }
        // Endpoint teardown closes attached connections; anything left
        // (e.g. connections whose endpoint died first) is closed here.
        for connection in connections {
            connection.close();
        }
        if let Some(namespace) = self.namespace.upgrade() {
            namespace.detach_bus(&self.name);
        }
        tracing::info!(bus = %self.name, id = %self.id, "bus disconnected");
    }
}
