//! Namespaces: top-level containers owning a private id space and buses.
//!
//! A namespace owns the buses created within it plus any child namespaces,
//! and hands out the minor numbers that identify endpoints within its
//! major (id-space handle). The unnamed root namespace exists for the
//! broker's lifetime and is never disconnected.
//!
//! The lock order is strictly top-down: a namespace lock may be held while
//! taking a bus lock, never the reverse. Cascading disconnect collects
//! children under the lock and acts on them after releasing it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::bus::Bus;
use crate::endpoint::Endpoint;
use crate::error::{BrokerError, Result};
use crate::types::limits::MAX_NAME_LEN;
use crate::types::{BusId, Credentials, LifecycleState, NamespaceId};

/// Name of the default endpoint every bus is created with.
pub const DEFAULT_ENDPOINT_NAME: &str = "bus";

/// Check a namespace or bus node name: non-empty, bounded, and limited to
/// `[A-Za-z0-9_.-]` so it can double as a device-node path element.
pub(crate) fn node_name_is_valid(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

#[derive(Debug)]
struct NamespaceInner {
    state: LifecycleState,
    /// Next bus id; monotonic per namespace, never reused.
    next_bus_id: u64,
    /// Next endpoint minor in this namespace's major. Minor 0 is reserved
    /// for the control node.
    next_minor: u64,
    buses: HashMap<String, Arc<Bus>>,
    children: HashMap<String, Arc<Namespace>>,
}

/// An isolated top-level container for buses.
#[derive(Debug)]
pub struct Namespace {
    /// `None` for the root namespace.
    name: Option<String>,
    id: NamespaceId,
    /// Id-space handle; unique system-wide while the namespace is alive.
    major: u64,
    mode: u32,
    parent: Option<Weak<Namespace>>,
    inner: Mutex<NamespaceInner>,
}

impl Namespace {
    /// Create the root namespace. Called once per broker.
    pub(crate) fn root(id: NamespaceId, major: u64) -> Arc<Self> {
        Arc::new(Self {
            name: None,
            id,
            major,
            mode: 0o666,
            parent: None,
            inner: Mutex::new(NamespaceInner {
                state: LifecycleState::Active,
                next_bus_id: 1,
                next_minor: 1,
                buses: HashMap::new(),
                children: HashMap::new(),
            }),
        })
    }

    /// Create a child namespace under `parent`.
    pub(crate) fn create_child(
        parent: &Arc<Namespace>,
        name: &str,
        id: NamespaceId,
        major: u64,
        mode: u32,
    ) -> Result<Arc<Namespace>> {
        if !node_name_is_valid(name) {
            return Err(BrokerError::InvalidArgument(format!(
                "malformed namespace name '{name}'"
            )));
        }
        let mut inner = parent.inner.lock().unwrap();
        if !inner.state.is_active() {
            return Err(BrokerError::NotFound("parent namespace".into()));
        }
        if inner.children.contains_key(name) {
            return Err(BrokerError::AlreadyExists(format!("namespace '{name}'")));
        }
        let child = Arc::new(Self {
            name: Some(name.to_string()),
            id,
            major,
            mode,
            parent: Some(Arc::downgrade(parent)),
            inner: Mutex::new(NamespaceInner {
                state: LifecycleState::Active,
                next_bus_id: 1,
                next_minor: 1,
                buses: HashMap::new(),
                children: HashMap::new(),
            }),
        });
        inner.children.insert(name.to_string(), Arc::clone(&child));
        tracing::info!(namespace = name, %id, major, "namespace created");
        Ok(child)
    }

    /// Name of this namespace, or `None` for the root.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Global id of this namespace.
    pub fn id(&self) -> NamespaceId {
        self.id
    }

    /// This namespace's id-space handle.
    pub fn major(&self) -> u64 {
        self.major
    }

    /// Whether the namespace still accepts new operations.
    pub fn is_active(&self) -> bool {
        self.inner.lock().unwrap().state.is_active()
    }

    /// Create a bus inside this namespace, together with its default
    /// endpoint.
    ///
    /// `flags` are opaque and passed through to bus clients unchanged.
    pub fn create_bus(
        self: &Arc<Self>,
        name: &str,
        flags: u64,
        mode: u32,
        owner: Credentials,
    ) -> Result<Arc<Bus>> {
        if !node_name_is_valid(name) {
            return Err(BrokerError::InvalidArgument(format!(
                "malformed bus name '{name}'"
            )));
        }
        let mut inner = self.inner.lock().unwrap();
        if !inner.state.is_active() {
            return Err(BrokerError::NotFound("namespace".into()));
        }
        if inner.buses.contains_key(name) {
            return Err(BrokerError::AlreadyExists(format!("bus '{name}'")));
        }
        let id = BusId::new(inner.next_bus_id);
        inner.next_bus_id += 1;
        let minor = inner.next_minor;
        inner.next_minor += 1;

        let bus = Bus::create(self, name, id, flags, mode);
        let endpoint = Endpoint::create(&bus, DEFAULT_ENDPOINT_NAME, mode, owner, minor)?;
        bus.set_default_endpoint(&endpoint);
        inner.buses.insert(name.to_string(), Arc::clone(&bus));

        tracing::info!(bus = name, %id, "bus created");
        Ok(bus)
    }

    /// Allocate the next endpoint minor within this namespace's major.
    pub(crate) fn allocate_minor(&self) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.state.is_active() {
            return Err(BrokerError::NotFound("namespace".into()));
        }
        let minor = inner.next_minor;
        inner.next_minor += 1;
        Ok(minor)
    }

    /// Look up a bus by name. Returns `None` once the namespace is
    /// disconnected.
    pub fn find_bus(&self, name: &str) -> Option<Arc<Bus>> {
        let inner = self.inner.lock().unwrap();
        if !inner.state.is_active() {
            return None;
        }
        inner.buses.get(name).cloned()
    }

    /// Look up a direct child namespace by name.
    pub fn find_child(&self, name: &str) -> Option<Arc<Namespace>> {
        let inner = self.inner.lock().unwrap();
        if !inner.state.is_active() {
            return None;
        }
        inner.children.get(name).cloned()
    }

    /// Depth-first search for a descendant namespace by name.
    pub fn find_descendant(self: &Arc<Self>, name: &str) -> Option<Arc<Namespace>> {
        if let Some(child) = self.find_child(name) {
            return Some(child);
        }
        let children: Vec<Arc<Namespace>> = {
            let inner = self.inner.lock().unwrap();
            inner.children.values().cloned().collect()
        };
        children
            .into_iter()
            .find_map(|child| child.find_descendant(name))
    }

    /// Remove a disconnected bus from the lookup table.
    pub(crate) fn detach_bus(&self, name: &str) {
        self.inner.lock().unwrap().buses.remove(name);
    }

    /// Remove a disconnected child namespace from the lookup table.
    pub(crate) fn detach_child(&self, name: &str) {
        self.inner.lock().unwrap().children.remove(name);
    }

    /// Logically remove this namespace and everything below it.
    ///
    /// Idempotent and one-way. Disconnects every bus (which closes every
    /// connection attached to their endpoints) and every child namespace.
    /// Storage is reclaimed only when the last handle is dropped.
    pub fn disconnect(self: &Arc<Self>) {
        let (buses, children) = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.state.is_active() {
                return;
            }
            inner.state = LifecycleState::Disconnected;
            (
                inner.buses.drain().map(|(_, b)| b).collect::<Vec<_>>(),
                inner.children.drain().map(|(_, c)| c).collect::<Vec<_>>(),
            )
        };
        for bus in buses {
            bus.disconnect();
        }
        for child in children {
            child.disconnect();
        }
        if let (Some(parent), Some(name)) = (
            self.parent.as_ref().and_then(Weak::upgrade),
            self.name.as_deref(),
        ) {
            parent.detach_child(name);
        }
        tracing::info!(namespace = ?self.name, id = %self.id, "namespace disconnected");
    }
}
