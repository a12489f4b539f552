//! Host identity and the inventory collaborator seam.
//!
//! The orchestration core treats a host as an opaque, comparable key. Real
//! inventory parsing (files, dynamic sources, group variable merging) lives
//! outside the core; [`Inventory`] is the interface it must satisfy, and
//! [`StaticInventory`] is the in-memory implementation used by embedders and
//! the test suite.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Opaque host identity.
///
/// The core never inspects anything beyond the name; equality and ordering
/// are all it needs to track per-host progress.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Host(String);

impl Host {
    /// Creates a host from its inventory name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The inventory name of this host.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Host {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Host {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Inventory collaborator: resolves a host pattern into concrete hosts.
///
/// Called once per play to size the run and once per batch to resolve serial
/// slices; the result order is significant and must be stable.
pub trait Inventory: Send + Sync {
    /// Resolves `pattern` to an ordered host list.
    fn get_hosts(&self, pattern: &str) -> Result<Vec<Host>>;
}

/// A fixed in-memory inventory of hosts and named groups.
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    hosts: Vec<Host>,
    groups: HashMap<String, Vec<Host>>,
}

impl StaticInventory {
    /// Creates an empty inventory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a host, optionally into a named group.
    pub fn add_host(&mut self, name: impl Into<String>, group: Option<&str>) {
        let host = Host::new(name);
        if !self.hosts.contains(&host) {
            self.hosts.push(host.clone());
        }
        if let Some(group) = group {
            let members = self.groups.entry(group.to_string()).or_default();
            if !members.contains(&host) {
                members.push(host);
            }
        }
    }

    /// Builds an inventory from a flat host name list.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut inventory = Self::new();
        for name in names {
            inventory.add_host(name, None);
        }
        inventory
    }

    /// Number of known hosts.
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// True when no hosts are registered.
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

impl Inventory for StaticInventory {
    fn get_hosts(&self, pattern: &str) -> Result<Vec<Host>> {
        if pattern == "all" || pattern == "*" {
            return Ok(self.hosts.clone());
        }

        if let Some(members) = self.groups.get(pattern) {
            return Ok(members.clone());
        }

        // ~ prefix selects by regex over host names
        if let Some(regex_pattern) = pattern.strip_prefix('~') {
            let re = regex::Regex::new(regex_pattern)
                .map_err(|_| Error::InvalidHostPattern(pattern.to_string()))?;
            return Ok(self
                .hosts
                .iter()
                .filter(|h| re.is_match(h.name()))
                .cloned()
                .collect());
        }

        // Comma-separated list of names, restricted to known hosts
        let wanted: Vec<Host> = pattern
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Host::new)
            .collect();
        Ok(self
            .hosts
            .iter()
            .filter(|h| wanted.contains(h))
            .cloned()
            .collect())
    }
}
