//! The broker: root of the namespace tree and the control-plane API.
//!
//! A [`Broker`] owns the initial namespace and hands out control
//! connections, from which clients create namespaces, buses, and
//! endpoints and ultimately open endpoint connections for messaging.
//!
//! # Example
//!
//! ```
//! use kernbus::{Broker, Credentials, HelloFlags};
//!
//! # fn main() -> kernbus::Result<()> {
//! let broker = Broker::new();
//! let creds = Credentials::new(1000, 1000);
//!
//! let control = broker.open_control(&broker.root(), creds)?;
//! let bus = broker.create_bus(&control, "user-1000", 0, 0o660)?;
//!
//! let endpoint = bus.default_endpoint()?;
//! let conn = broker.open_endpoint(&endpoint, creds)?;
//! conn.hello(HelloFlags::empty())?;
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex};

use crate::bus::Bus;
use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::error::{BrokerError, Result};
use crate::namespace::{Namespace, DEFAULT_ENDPOINT_NAME};
use crate::types::{Credentials, NamespaceId};

struct BrokerInner {
    next_namespace_id: u64,
    next_major: u64,
}

/// Root handle over the whole broker instance.
pub struct Broker {
    root: Arc<Namespace>,
    inner: Mutex<BrokerInner>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    /// Create a broker with an empty initial namespace.
    pub fn new() -> Self {
        Self {
            root: Namespace::root(NamespaceId::new(0), 0),
            inner: Mutex::new(BrokerInner {
                next_namespace_id: 1,
                next_major: 1,
            }),
        }
    }

    /// The initial namespace, always present.
    pub fn root(&self) -> Arc<Namespace> {
        Arc::clone(&self.root)
    }

    /// Look up a namespace by name anywhere under the initial one.
    pub fn find_namespace(&self, name: &str) -> Option<Arc<Namespace>> {
        self.root.find_descendant(name)
    }

    /// Open a control connection on a namespace's control node.
    pub fn open_control(
        &self,
        namespace: &Arc<Namespace>,
        creds: Credentials,
    ) -> Result<Arc<Connection>> {
        if !namespace.is_active() {
            return Err(BrokerError::NotFound(format!(
                "namespace {:?}",
                namespace.name()
            )));
        }
        Ok(Connection::control(namespace, creds))
    }

    /// Create a child namespace. The control connection becomes its
    /// owner; closing the connection tears the namespace down.
    pub fn create_namespace(
        &self,
        conn: &Arc<Connection>,
        name: &str,
        mode: u32,
    ) -> Result<Arc<Namespace>> {
        let parent = conn.control_namespace()?;
        let (id, major) = {
            let mut inner = self.inner.lock().unwrap();
            let id = NamespaceId::new(inner.next_namespace_id);
            let major = inner.next_major;
            inner.next_namespace_id += 1;
            inner.next_major += 1;
            (id, major)
        };
        let namespace = Namespace::create_child(&parent, name, id, major, mode)?;
        if let Err(err) = conn.become_namespace_owner(Arc::clone(&namespace)) {
            namespace.disconnect();
            return Err(err);
        }
        tracing::info!(namespace = name, %id, "namespace created");
        Ok(namespace)
    }

    /// Create a bus inside the control connection's namespace, with its
    /// default endpoint. The connection becomes the bus owner.
    pub fn create_bus(
        &self,
        conn: &Arc<Connection>,
        name: &str,
        flags: u64,
        mode: u32,
    ) -> Result<Arc<Bus>> {
        let namespace = conn.control_namespace()?;
        let bus = namespace.create_bus(name, flags, mode, conn.creds())?;
        if let Err(err) = conn.become_bus_owner(Arc::clone(&bus)) {
            bus.disconnect();
            return Err(err);
        }
        tracing::info!(bus = name, id = %bus.id(), "bus created");
        Ok(bus)
    }

    /// Create an additional endpoint on a bus.
    ///
    /// The name `"bus"` is reserved for the default endpoint.
    pub fn create_endpoint(
        &self,
        bus: &Arc<Bus>,
        name: &str,
        mode: u32,
        owner: Credentials,
    ) -> Result<Arc<Endpoint>> {
        if name == DEFAULT_ENDPOINT_NAME {
            return Err(BrokerError::InvalidArgument(format!(
                "endpoint name {name:?} is reserved"
            )));
        }
        let namespace = bus
            .namespace()
            .ok_or_else(|| BrokerError::NotFound("namespace".into()))?;
        let minor = namespace.allocate_minor()?;
        let endpoint = Endpoint::create(bus, name, mode, owner, minor)?;
        tracing::info!(bus = bus.name(), endpoint = name, "endpoint created");
        Ok(endpoint)
    }

    /// Remove a custom endpoint, closing its connections.
    ///
    /// The default endpoint is only removed with its bus.
    pub fn remove_endpoint(&self, endpoint: &Arc<Endpoint>) -> Result<()> {
        let bus = endpoint
            .bus()
            .ok_or_else(|| BrokerError::NotFound("bus".into()))?;
        let default = bus.default_endpoint()?;
        if default.id() == endpoint.id() {
            return Err(BrokerError::InvalidArgument(
                "the default endpoint cannot be removed".into(),
            ));
        }
        endpoint.disconnect();
        Ok(())
    }

    /// Open a connection on an endpoint. The connection must complete
    /// [`hello`](Connection::hello) before sending or receiving.
    pub fn open_endpoint(
        &self,
        endpoint: &Arc<Endpoint>,
        creds: Credentials,
    ) -> Result<Arc<Connection>> {
        let bus = endpoint
            .bus()
            .ok_or_else(|| BrokerError::NotFound("bus".into()))?;
        if !endpoint.is_active() {
            return Err(BrokerError::NotFound(format!(
                "endpoint {:?}",
                endpoint.name()
            )));
        }
        let conn =
            bus.register_connection(|id| Connection::endpoint_client(endpoint, id, creds))?;
        if let Err(err) = endpoint.attach(&conn) {
            bus.remove_connection(conn.id());
            return Err(err);
        }
        tracing::debug!(bus = bus.name(), connection = %conn.id(), "connection opened");
        Ok(conn)
    }
}
