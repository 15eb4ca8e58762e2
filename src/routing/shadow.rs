//! Owner-tag shadow index.
//!
//! The kernel has no field to mark who created a route or rule, so the
//! engine records every entry it installs here, keyed by [`OwnerTag`].
//! Removal only ever touches entries found in this index.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::Ipv4Addr;

use super::netlink_ops::{RouteSpec, RuleSpec};

/// What an owned entry is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    DedicatedDefault,
    Subnet,
    HostRoute(Ipv4Addr),
    SourceRule,
    MainTableDefault,
    /// Superseded main-table entry awaiting deletion
    MainTableRetired,
}

impl Purpose {
    /// Entries living in the shared main table
    pub fn is_main_table(&self) -> bool {
        matches!(self, Purpose::MainTableDefault | Purpose::MainTableRetired)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct OwnerTag {
    pub interface: String,
    pub purpose: Purpose,
}

impl OwnerTag {
    pub fn new(interface: &str, purpose: Purpose) -> Self {
        Self { interface: interface.to_string(), purpose }
    }
}

impl fmt::Display for OwnerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}", self.interface, self.purpose)
    }
}

/// A kernel entry the engine owns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnedEntry {
    Route(RouteSpec),
    Rule(RuleSpec),
}

impl fmt::Display for OwnedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnedEntry::Route(r) => write!(f, "route {}", r),
            OwnedEntry::Rule(r) => write!(f, "rule {}", r),
        }
    }
}

/// The interface's recorded main-table default
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MainTableEntry {
    pub interface: String,
    pub if_index: u32,
    pub gateway: Ipv4Addr,
    pub metric: u32,
}

impl MainTableEntry {
    pub fn from_route(interface: &str, route: &RouteSpec) -> Option<Self> {
        Some(Self {
            interface: interface.to_string(),
            if_index: route.if_index,
            gateway: route.gateway?,
            metric: route.metric,
        })
    }

    pub fn route(&self) -> RouteSpec {
        RouteSpec::default_via(self.gateway, self.if_index, super::netlink_ops::MAIN_TABLE)
            .with_metric(self.metric)
    }
}

/// Engine bookkeeping of owned entries and claimed tables
#[derive(Debug, Default)]
pub struct ShadowIndex {
    entries: BTreeMap<OwnerTag, OwnedEntry>,
    tables: HashMap<String, u32>,
}

impl ShadowIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, tag: OwnerTag, entry: OwnedEntry) {
        self.entries.insert(tag, entry);
    }

    pub fn get(&self, tag: &OwnerTag) -> Option<&OwnedEntry> {
        self.entries.get(tag)
    }

    pub fn forget(&mut self, tag: &OwnerTag) -> Option<OwnedEntry> {
        self.entries.remove(tag)
    }

    /// Owned entries of one interface, in tag order
    pub fn entries_for(&self, interface: &str) -> Vec<(OwnerTag, OwnedEntry)> {
        self.entries
            .iter()
            .filter(|(tag, _)| tag.interface == interface)
            .map(|(tag, entry)| (tag.clone(), entry.clone()))
            .collect()
    }

    pub fn route(&self, interface: &str, purpose: Purpose) -> Option<RouteSpec> {
        match self.entries.get(&OwnerTag::new(interface, purpose)) {
            Some(OwnedEntry::Route(r)) => Some(r.clone()),
            _ => None,
        }
    }

    pub fn rule(&self, interface: &str) -> Option<RuleSpec> {
        match self.entries.get(&OwnerTag::new(interface, Purpose::SourceRule)) {
            Some(OwnedEntry::Rule(r)) => Some(r.clone()),
            _ => None,
        }
    }

    pub fn main_table_entry(&self, interface: &str) -> Option<MainTableEntry> {
        self.route(interface, Purpose::MainTableDefault)
            .and_then(|r| MainTableEntry::from_route(interface, &r))
    }

    /// Every main-table route any interface owns, retired ones included
    pub fn main_table_routes(&self, interface: &str) -> Vec<RouteSpec> {
        self.entries
            .iter()
            .filter(|(tag, _)| tag.interface == interface && tag.purpose.is_main_table())
            .filter_map(|(_, entry)| match entry {
                OwnedEntry::Route(r) => Some(r.clone()),
                OwnedEntry::Rule(_) => None,
            })
            .collect()
    }

    /// Host routes owned by an interface
    pub fn host_routes(&self, interface: &str) -> Vec<(Ipv4Addr, RouteSpec)> {
        self.entries
            .iter()
            .filter_map(|(tag, entry)| match (&tag.purpose, entry) {
                (Purpose::HostRoute(host), OwnedEntry::Route(r)) if tag.interface == interface => {
                    Some((*host, r.clone()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn claim_table(&mut self, interface: &str, table_id: u32) {
        self.tables.insert(interface.to_string(), table_id);
    }

    pub fn table_of(&self, interface: &str) -> Option<u32> {
        self.tables.get(interface).copied()
    }

    /// Interface already holding `table_id`, other than `interface`
    pub fn table_owner(&self, table_id: u32, interface: &str) -> Option<&str> {
        self.tables
            .iter()
            .find(|(name, id)| **id == table_id && name.as_str() != interface)
            .map(|(name, _)| name.as_str())
    }

    pub fn release_table(&mut self, interface: &str) {
        self.tables.remove(interface);
    }

    /// Interfaces with entries or a claimed table
    pub fn interfaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .keys()
            .map(|tag| tag.interface.clone())
            .chain(self.tables.keys().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn is_empty_for(&self, interface: &str) -> bool {
        !self.entries.keys().any(|tag| tag.interface == interface)
    }
}
