//! Well-known-name registry: exclusive-or-queued ownership per bus.
//!
//! Each bus owns one registry. A name has at most one active owner at any
//! time plus a FIFO queue of waiting claimants. Operations on a single name
//! are linearized by the registry lock; notifications and per-connection
//! bookkeeping are applied strictly after that lock is released, preserving
//! the top-down lock order (Connection above NameRegistry).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::bus::Bus;
use crate::connection::Connection;
use crate::error::{BrokerError, Result};
use crate::notify;
use crate::policy::PolicyAccess;
use crate::types::limits::{MAX_NAMES_PER_CONNECTION, MAX_NAME_LEN};
use crate::types::ConnectionId;

bitflags! {
    /// Flags governing acquisition and hand-off of a well-known name.
    ///
    /// `ALLOW_REPLACEMENT` and `ALLOW_QUEUEING` are owner-side: they are
    /// remembered with the ownership record and govern later claimants.
    /// `REPLACE_EXISTING` and `QUEUE` are requester-side: they say what
    /// the caller wants when the name is already taken.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NameFlags: u64 {
        /// Owner permits another connection to take the name over.
        const ALLOW_REPLACEMENT = 1 << 0;
        /// Owner permits claimants to wait in the queue.
        const ALLOW_QUEUEING = 1 << 1;
        /// Requester wants to displace a willing owner.
        const REPLACE_EXISTING = 1 << 2;
        /// Requester wants to wait in FIFO order if the name is taken.
        /// Also keeps a displaced owner in the queue on replacement.
        const QUEUE = 1 << 3;
    }
}

impl Serialize for NameFlags {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for NameFlags {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bits = u64::deserialize(deserializer)?;
        NameFlags::from_bits(bits)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid name flag bits: {bits}")))
    }
}

/// Non-error outcome of a name acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquireOutcome {
    /// The caller is now the owner.
    Owner,
    /// The caller already owned the name; its flags were updated.
    AlreadyOwner,
    /// The name is taken; the caller waits in the FIFO queue.
    Queued,
}

/// Ownership record returned by queries and listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameInfo {
    /// The well-known name.
    pub name: String,
    /// Current owner's connection id.
    pub owner: ConnectionId,
    /// Flags the owner acquired the name with.
    pub flags: NameFlags,
}

/// Check whether `name` is a well-formed well-known name.
///
/// Rules: non-empty, at most [`MAX_NAME_LEN`] bytes, at least two
/// dot-separated elements, no empty element, element characters limited to
/// `[A-Za-z0-9_-]`, and no element starting with a digit. The check runs
/// before any registry lock is taken.
pub fn name_is_valid(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN || !name.contains('.') {
        return false;
    }
    for element in name.split('.') {
        if element.is_empty() {
            return false;
        }
        let mut chars = element.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '-' => {}
            _ => return false,
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return false;
        }
    }
    true
}

#[derive(Debug)]
struct QueuedClaim {
    id: ConnectionId,
    conn: Weak<Connection>,
    flags: NameFlags,
}

#[derive(Debug)]
struct NameEntry {
    /// Flags of the current owner's acquire call, in full: the owner-side
    /// bits govern claimants, the QUEUE bit keeps a displaced owner queued.
    flags: NameFlags,
    owner_id: ConnectionId,
    owner: Weak<Connection>,
    queue: VecDeque<QueuedClaim>,
}

/// An ownership change computed under the registry lock and applied after
/// it is released.
struct OwnerChange {
    name: String,
    old: Option<ConnectionId>,
    new: Option<ConnectionId>,
    flags: NameFlags,
}

/// Bookkeeping update for a connection's own name lists.
enum Book {
    Owned(Weak<Connection>, String),
    DisownedOwned(Weak<Connection>, String),
    Queued(Weak<Connection>, String),
    Dequeued(Weak<Connection>, String),
}

/// Deferred side effects of a registry mutation.
#[derive(Default)]
struct Effects {
    books: Vec<Book>,
    changes: Vec<OwnerChange>,
}

impl Effects {
    fn apply(self, bus: &Arc<Bus>) {
        for book in self.books {
            match book {
                Book::Owned(conn, name) => {
                    if let Some(conn) = conn.upgrade() {
                        conn.record_owned_name(&name);
                    }
                }
                Book::DisownedOwned(conn, name) => {
                    if let Some(conn) = conn.upgrade() {
                        conn.forget_owned_name(&name);
                    }
                }
                Book::Queued(conn, name) => {
                    if let Some(conn) = conn.upgrade() {
                        conn.record_queued_name(&name);
                    }
                }
                Book::Dequeued(conn, name) => {
                    if let Some(conn) = conn.upgrade() {
                        conn.forget_queued_name(&name);
                    }
                }
            }
        }
        for change in self.changes {
            tracing::debug!(
                name = %change.name,
                old = ?change.old,
                new = ?change.new,
                "name owner changed"
            );
            notify::name_owner_changed(bus, &change.name, change.old, change.new, change.flags);
        }
    }
}

/// Per-bus table of well-known names.
#[derive(Debug)]
pub struct NameRegistry {
    entries: Mutex<HashMap<String, NameEntry>>,
}

impl Default for NameRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NameRegistry {
    /// Create an empty registry.
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire `name` for `conn`, or join its wait queue.
    ///
    /// Returns [`AcquireOutcome::Queued`] as a status, not an error, when
    /// the caller ends up waiting. Exactly one name-owner-changed
    /// notification is emitted when ownership actually changes; a failed
    /// acquire emits nothing.
    pub fn acquire(
        &self,
        bus: &Arc<Bus>,
        conn: &Arc<Connection>,
        name: &str,
        flags: NameFlags,
    ) -> Result<AcquireOutcome> {
        if !name_is_valid(name) {
            return Err(BrokerError::InvalidArgument(format!(
                "malformed name '{name}'"
            )));
        }
        conn.ensure_active()?;
        let endpoint = conn.endpoint()?;
        if !endpoint
            .policy()
            .check(conn.creds(), PolicyAccess::OWN, Some(name))
        {
            return Err(BrokerError::PermissionDenied(format!(
                "not allowed to own '{name}'"
            )));
        }
        // Checked before the registry lock (the count lives behind the
        // connection lock, which ranks above it); enforced only by the
        // branches that actually add an owned or queued entry, so flag
        // updates on names already held keep working at the limit.
        let at_limit = conn.name_count() >= MAX_NAMES_PER_CONNECTION;
        let limit_reached = || {
            BrokerError::ResourceExhausted(format!(
                "connection {} holds {MAX_NAMES_PER_CONNECTION} names",
                conn.id()
            ))
        };

        let mut effects = Effects::default();
        let outcome = {
            let mut entries = self.entries.lock().unwrap();
            match entries.get_mut(name) {
                None => {
                    if at_limit {
                        return Err(limit_reached());
                    }
                    entries.insert(
                        name.to_string(),
                        NameEntry {
                            flags,
                            owner_id: conn.id(),
                            owner: Arc::downgrade(conn),
                            queue: VecDeque::new(),
                        },
                    );
                    effects
                        .books
                        .push(Book::Owned(Arc::downgrade(conn), name.to_string()));
                    effects.changes.push(OwnerChange {
                        name: name.to_string(),
                        old: None,
                        new: Some(conn.id()),
                        flags,
                    });
                    AcquireOutcome::Owner
                }
                Some(entry) if entry.owner_id == conn.id() => {
                    entry.flags = flags;
                    AcquireOutcome::AlreadyOwner
                }
                Some(entry)
                    if entry.flags.contains(NameFlags::ALLOW_REPLACEMENT)
                        && flags.contains(NameFlags::REPLACE_EXISTING) =>
                {
                    if at_limit {
                        return Err(limit_reached());
                    }
                    let old_id = entry.owner_id;
                    let old_conn = std::mem::replace(&mut entry.owner, Arc::downgrade(conn));
                    if entry.flags.contains(NameFlags::QUEUE) {
                        // The displaced owner asked to keep waiting.
                        entry.queue.push_back(QueuedClaim {
                            id: old_id,
                            conn: old_conn.clone(),
                            flags: entry.flags,
                        });
                        effects
                            .books
                            .push(Book::Queued(old_conn.clone(), name.to_string()));
                    }
                    effects
                        .books
                        .push(Book::DisownedOwned(old_conn, name.to_string()));
                    entry.owner_id = conn.id();
                    entry.flags = flags;
                    effects
                        .books
                        .push(Book::Owned(Arc::downgrade(conn), name.to_string()));
                    effects.changes.push(OwnerChange {
                        name: name.to_string(),
                        old: Some(old_id),
                        new: Some(conn.id()),
                        flags,
                    });
                    AcquireOutcome::Owner
                }
                Some(entry)
                    if flags.contains(NameFlags::QUEUE)
                        && entry.flags.contains(NameFlags::ALLOW_QUEUEING) =>
                {
                    if let Some(claim) = entry.queue.iter_mut().find(|c| c.id == conn.id()) {
                        claim.flags = flags;
                    } else {
                        if at_limit {
                            return Err(limit_reached());
                        }
                        entry.queue.push_back(QueuedClaim {
                            id: conn.id(),
                            conn: Arc::downgrade(conn),
                            flags,
                        });
                        effects
                            .books
                            .push(Book::Queued(Arc::downgrade(conn), name.to_string()));
                    }
                    AcquireOutcome::Queued
                }
                Some(_) => {
                    return Err(BrokerError::NameInUse(name.to_string()));
                }
            }
        };
        effects.apply(bus);
        Ok(outcome)
    }

    /// Release `name` held or awaited by `conn`.
    ///
    /// An owner release hands the name to the earliest live queue entry,
    /// or removes the entry when the queue is empty; a queued-only caller
    /// is simply removed from the queue. Only an actual ownership change
    /// emits a notification.
    pub fn release(&self, bus: &Arc<Bus>, conn: &Arc<Connection>, name: &str) -> Result<()> {
        if !name_is_valid(name) {
            return Err(BrokerError::InvalidArgument(format!(
                "malformed name '{name}'"
            )));
        }
        conn.ensure_active()?;

        let mut effects = Effects::default();
        {
            let mut entries = self.entries.lock().unwrap();
            let Some(entry) = entries.get_mut(name) else {
                return Err(BrokerError::NotFound(format!("name '{name}'")));
            };
            if entry.owner_id == conn.id() {
                Self::hand_off(&mut entries, name, &mut effects);
            } else {
                let before = entry.queue.len();
                entry.queue.retain(|claim| claim.id != conn.id());
                if entry.queue.len() == before {
                    return Err(BrokerError::NotFound(format!(
                        "connection {} neither owns nor awaits '{name}'",
                        conn.id()
                    )));
                }
                effects
                    .books
                    .push(Book::Dequeued(Arc::downgrade(conn), name.to_string()));
            }
        }
        effects.apply(bus);
        Ok(())
    }

    /// Look up the current owner of `name`.
    pub fn query(&self, name: &str) -> Result<NameInfo> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(name)
            .map(|entry| NameInfo {
                name: name.to_string(),
                owner: entry.owner_id,
                flags: entry.flags,
            })
            .ok_or_else(|| BrokerError::NotFound(format!("name '{name}'")))
    }

    /// List all names visible to `conn`, subject to its endpoint's policy.
    pub fn list(&self, conn: &Arc<Connection>) -> Result<Vec<NameInfo>> {
        conn.ensure_active()?;
        let endpoint = conn.endpoint()?;
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .iter()
            .filter(|(name, _)| {
                endpoint
                    .policy()
                    .check(conn.creds(), PolicyAccess::RECV, Some(name))
            })
            .map(|(name, entry)| NameInfo {
                name: name.clone(),
                owner: entry.owner_id,
                flags: entry.flags,
            })
            .collect())
    }

    /// Resolve `name` to the owning connection id, if any.
    pub(crate) fn resolve(&self, name: &str) -> Option<ConnectionId> {
        self.entries
            .lock()
            .unwrap()
            .get(name)
            .map(|entry| entry.owner_id)
    }

    /// Close-time sweep: release every name `conn` owns or awaits.
    ///
    /// Each owned name is handed off or removed, each with its own
    /// notification. Invoked while the connection is being torn down, so
    /// no activity check is made.
    pub(crate) fn remove_by_connection(&self, bus: &Arc<Bus>, conn: &Arc<Connection>) {
        let mut effects = Effects::default();
        {
            let mut entries = self.entries.lock().unwrap();
            let names: Vec<String> = entries.keys().cloned().collect();
            for name in names {
                let Some(entry) = entries.get_mut(&name) else {
                    continue;
                };
                if entry.owner_id == conn.id() {
                    Self::hand_off(&mut entries, &name, &mut effects);
                } else {
                    let before = entry.queue.len();
                    entry.queue.retain(|claim| claim.id != conn.id());
                    if entry.queue.len() != before {
                        effects
                            .books
                            .push(Book::Dequeued(Arc::downgrade(conn), name.clone()));
                    }
                }
            }
        }
        effects.apply(bus);
    }

    /// Number of registered names.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether no names are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Transfer ownership of `name` to the earliest live queue entry, or
    /// drop the entry entirely. Caller holds the registry lock; effects
    /// are recorded for application after it is released.
    fn hand_off(
        entries: &mut HashMap<String, NameEntry>,
        name: &str,
        effects: &mut Effects,
    ) {
        let Some(entry) = entries.get_mut(name) else {
            return;
        };
        let old_id = entry.owner_id;
        let old_conn = entry.owner.clone();
        effects
            .books
            .push(Book::DisownedOwned(old_conn, name.to_string()));

        // Skip claimants whose connection has died or closed meanwhile.
        let mut successor = None;
        while let Some(claim) = entry.queue.pop_front() {
            match claim.conn.upgrade() {
                Some(conn) if conn.is_open() => {
                    successor = Some((claim, conn));
                    break;
                }
                _ => {}
            }
        }

        match successor {
            Some((claim, conn)) => {
                entry.owner_id = claim.id;
                entry.owner = claim.conn.clone();
                entry.flags = claim.flags;
                effects
                    .books
                    .push(Book::Dequeued(Arc::downgrade(&conn), name.to_string()));
                effects
                    .books
                    .push(Book::Owned(Arc::downgrade(&conn), name.to_string()));
                effects.changes.push(OwnerChange {
                    name: name.to_string(),
                    old: Some(old_id),
                    new: Some(claim.id),
                    flags: claim.flags,
                });
            }
            None => {
                let flags = entry.flags;
                entries.remove(name);
                effects.changes.push(OwnerChange {
                    name: name.to_string(),
                    old: Some(old_id),
                    new: None,
                    flags,
                });
            }
        }
    }
}
