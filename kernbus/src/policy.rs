//! Per-endpoint access-control database.
//!
//! A policy database answers "may these credentials own, send to, or
//! receive traffic for this well-known name on this endpoint". Lookups are
//! read-mostly and take only a short read guard; the bulk load replaces the
//! whole table at once and excludes lookups only for the duration of the
//! swap. Partial application is not possible: every rule is validated
//! before the table is touched.
//!
//! An endpoint with an empty table is permissive (the default endpoint's
//! behavior). A non-empty table switches the endpoint to default-deny.
//! Policy is name-centric: checks without a name always pass.

use std::collections::HashMap;
use std::sync::RwLock;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, Result};
use crate::names::name_is_valid;
use crate::types::Credentials;

bitflags! {
    /// Actions a policy rule can grant.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PolicyAccess: u32 {
        /// May own the name.
        const OWN = 1 << 0;
        /// May send messages addressed to the name.
        const SEND = 1 << 1;
        /// May receive messages and notifications concerning the name,
        /// and see it in name listings.
        const RECV = 1 << 2;
    }
}

impl Serialize for PolicyAccess {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PolicyAccess {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bits = u32::deserialize(deserializer)?;
        PolicyAccess::from_bits(bits)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid policy access bits: {bits}")))
    }
}

/// Identity a policy rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicySubject {
    /// A specific user id.
    User(u32),
    /// A specific group id.
    Group(u32),
    /// Everyone.
    World,
}

/// One policy rule: subject may perform `access` on `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Who the rule applies to.
    pub subject: PolicySubject,
    /// The well-known name the rule governs.
    pub name: String,
    /// Granted actions.
    pub access: PolicyAccess,
}

type PolicyTable = HashMap<PolicySubject, HashMap<String, PolicyAccess>>;

/// Access-control table of one endpoint.
#[derive(Debug)]
pub struct PolicyDb {
    table: RwLock<PolicyTable>,
}

impl PolicyDb {
    /// Create an empty, permissive database.
    pub(crate) fn new() -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
        }
    }

    /// Atomically replace the table with `rules`.
    ///
    /// Every rule is validated first; a single malformed entry rejects the
    /// whole load and leaves the previous table in place.
    pub fn load(&self, rules: Vec<PolicyRule>) -> Result<()> {
        for rule in &rules {
            if !name_is_valid(&rule.name) {
                return Err(BrokerError::InvalidArgument(format!(
                    "malformed name '{}' in policy rule",
                    rule.name
                )));
            }
            if rule.access.is_empty() {
                return Err(BrokerError::InvalidArgument(format!(
                    "policy rule for '{}' grants nothing",
                    rule.name
                )));
            }
        }

        let mut table: PolicyTable = HashMap::new();
        for rule in rules {
            *table
                .entry(rule.subject)
                .or_default()
                .entry(rule.name)
                .or_insert(PolicyAccess::empty()) |= rule.access;
        }

        *self.table.write().unwrap() = table;
        Ok(())
    }

    /// Check whether `creds` may perform `access` on `name`.
    ///
    /// A `None` name always passes: policy governs well-known names only.
    pub fn check(&self, creds: Credentials, access: PolicyAccess, name: Option<&str>) -> bool {
        let table = self.table.read().unwrap();
        if table.is_empty() {
            return true;
        }
        let Some(name) = name else {
            return true;
        };
        for subject in [
            PolicySubject::User(creds.uid),
            PolicySubject::Group(creds.gid),
            PolicySubject::World,
        ] {
            if let Some(granted) = table.get(&subject).and_then(|names| names.get(name)) {
                if granted.contains(access) {
                    return true;
                }
            }
        }
        false
    }

    /// Whether the table is empty, i.e. the endpoint is permissive.
    pub fn is_permissive(&self) -> bool {
        self.table.read().unwrap().is_empty()
    }
}
