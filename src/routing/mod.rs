//! Per-interface source routing.
//!
//! Every managed interface gets a dedicated table holding its default route
//! (plus the on-link subnet route and any host routes) and a
//! `from <address> lookup <table>` rule. Optionally it also gets a default
//! route in the shared main table, at a metric below every default that was
//! there before it.
//!
//! Two backends sit behind [`RouteBackend`]: the netlink fast path for the
//! dedicated tables and rules, and the iproute2 declarative path for
//! main-table defaults. [`OperationKind`] selects between them. Everything
//! the engine installs is recorded in a [`ShadowIndex`] under an owner tag,
//! and removal only touches recorded entries.

pub mod ip_route;
pub mod netlink_ops;
pub mod reconciler;
pub mod shadow;

#[cfg(test)]
pub(crate) mod mocks;

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::config::RoutingSettings;
use crate::error::{NetagentError, NetagentResult};
use crate::interface::{self, Ipv4Cidr};

pub use ip_route::IpRouteBackend;
pub use netlink_ops::{NetlinkBackend, RouteBackend, RouteSpec, RuleBackend, RuleSpec, MAIN_TABLE};
pub use reconciler::MainTableReconciler;
pub use shadow::{MainTableEntry, OwnedEntry, OwnerTag, Purpose, ShadowIndex};

/// Which backend a route operation goes through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Dedicated tables, rules and host routes: fast path
    Dedicated,
    /// Main-table default routes: declarative path
    MainTableDefault,
}

/// A managed link present at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedLink {
    pub name: String,
    pub if_index: u32,
}

/// Routing an interface should have, derived from its current lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntendedInterface {
    pub name: String,
    pub if_index: u32,
    pub address: Ipv4Cidr,
    pub gateway: Ipv4Addr,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub adopted: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEntry {
    pub tag: OwnerTag,
    pub entry: String,
}

/// Engine-side view of one interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutingStatus {
    pub interface: String,
    pub table_id: Option<u32>,
    pub main_table: Option<MainTableEntry>,
    pub entries: Vec<StatusEntry>,
}

pub struct RoutingEngine {
    settings: RoutingSettings,
    fast_routes: Arc<dyn RouteBackend>,
    rules: Arc<dyn RuleBackend>,
    reconciler: MainTableReconciler,
    shadow: Arc<StdMutex<ShadowIndex>>,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RoutingEngine {
    pub fn new<F>(settings: RoutingSettings, fast: Arc<F>, declarative: Arc<dyn RouteBackend>) -> Self
    where
        F: RouteBackend + RuleBackend + 'static,
    {
        let shadow = Arc::new(StdMutex::new(ShadowIndex::new()));
        let reconciler = MainTableReconciler::new(declarative, shadow.clone(), &settings);
        let fast_routes: Arc<dyn RouteBackend> = fast.clone();
        let rules: Arc<dyn RuleBackend> = fast;
        Self {
            settings,
            fast_routes,
            rules,
            reconciler,
            shadow,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Production engine: rtnetlink fast path, iproute2 declarative path
    pub fn connect(settings: RoutingSettings) -> NetagentResult<Self> {
        let fast = Arc::new(NetlinkBackend::connect()?);
        Ok(Self::new(settings, fast, Arc::new(IpRouteBackend::new())))
    }

    pub fn backend(&self, kind: OperationKind) -> &Arc<dyn RouteBackend> {
        match kind {
            OperationKind::Dedicated => &self.fast_routes,
            OperationKind::MainTableDefault => self.reconciler.backend(),
        }
    }

    fn shadow(&self) -> MutexGuard<'_, ShadowIndex> {
        match self.shadow.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Per-interface critical section
    async fn lock_interface(&self, interface: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks.entry(interface.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Resolve and claim the dedicated table of an interface
    fn claim_table(&self, interface: &str, if_index: u32) -> NetagentResult<u32> {
        let violation = |reason: String| NetagentError::InvariantViolation {
            interface: interface.to_string(),
            reason,
        };

        let table_id = interface::table_id_for(self.settings.table_base, if_index)
            .map_err(|e| violation(e.to_string()))?;

        let mut shadow = self.shadow();
        if let Some(owner) = shadow.table_owner(table_id, interface) {
            return Err(violation(format!("table {} already belongs to {}", table_id, owner)));
        }
        if let Some(existing) = shadow.table_of(interface) {
            if existing != table_id && !shadow.is_empty_for(interface) {
                return Err(violation(format!(
                    "interface moved from table {} to {} without cleanup",
                    existing, table_id
                )));
            }
        }
        shadow.claim_table(interface, table_id);
        Ok(table_id)
    }

    fn record(&self, interface: &str, purpose: Purpose, entry: OwnedEntry) {
        self.shadow().record(OwnerTag::new(interface, purpose), entry);
    }

    fn forget(&self, interface: &str, purpose: Purpose) {
        self.shadow().forget(&OwnerTag::new(interface, purpose));
    }

    /// Install the dedicated default route (and on-link subnet route)
    ///
    /// A changed gateway is swapped in with a single replace, so the table
    /// never holds zero or two defaults. Returns the table id.
    pub async fn apply_dedicated_route(
        &self,
        interface: &str,
        if_index: u32,
        address: Ipv4Cidr,
        gateway: Ipv4Addr,
    ) -> NetagentResult<u32> {
        let _guard = self.lock_interface(interface).await;
        let table_id = self.claim_table(interface, if_index)?;
        let fast = self.backend(OperationKind::Dedicated);

        let old_subnet = self.shadow().route(interface, Purpose::Subnet);
        if address.prefix_len < 32 {
            let subnet = RouteSpec::subnet(address, if_index, table_id);
            fast.route_replace(&subnet).await?;
            self.record(interface, Purpose::Subnet, OwnedEntry::Route(subnet.clone()));
            if let Some(old) = old_subnet.filter(|old| !old.same_key(&subnet)) {
                fast.route_del(&old).await?;
            }
        } else if let Some(old) = old_subnet {
            fast.route_del(&old).await?;
            self.forget(interface, Purpose::Subnet);
        }

        let default = RouteSpec::default_via(gateway, if_index, table_id);
        let old_default = self.shadow().route(interface, Purpose::DedicatedDefault);
        fast.route_replace(&default).await?;
        self.record(interface, Purpose::DedicatedDefault, OwnedEntry::Route(default.clone()));
        if let Some(old) = old_default.filter(|old| !old.same_key(&default)) {
            fast.route_del(&old).await?;
        }

        // Host routes follow the gateway
        let host_routes = self.shadow().host_routes(interface);
        for (host, route) in host_routes {
            if route.gateway != Some(gateway) || route.if_index != if_index {
                let moved = RouteSpec::host(host, gateway, if_index, table_id);
                fast.route_replace(&moved).await?;
                self.record(interface, Purpose::HostRoute(host), OwnedEntry::Route(moved));
            }
        }

        info!("Dedicated table {} for {}: {}", table_id, interface, default);
        Ok(table_id)
    }

    /// Ensure `from <address> lookup <table>` exists for the interface
    pub async fn ensure_rule(&self, interface: &str, address: Ipv4Addr) -> NetagentResult<()> {
        let _guard = self.lock_interface(interface).await;
        let table_id = self.shadow().table_of(interface).ok_or_else(|| {
            NetagentError::InvariantViolation {
                interface: interface.to_string(),
                reason: "no dedicated table claimed".to_string(),
            }
        })?;

        let rule = RuleSpec::from_address(address, table_id, self.settings.rule_priority);
        let old = self.shadow().rule(interface);

        // Add before delete so the address is never without a rule
        self.rules.rule_add(&rule).await?;
        self.record(interface, Purpose::SourceRule, OwnedEntry::Rule(rule.clone()));
        if let Some(old) = old.filter(|old| *old != rule) {
            self.rules.rule_del(&old).await?;
        }

        debug!("Rule for {}: {}", interface, rule);
        Ok(())
    }

    /// Add the interface's default route to the main table
    ///
    /// Runs on the declarative path and may take several seconds.
    pub async fn apply_main_table_default(
        &self,
        interface: &str,
        gateway: Ipv4Addr,
    ) -> NetagentResult<MainTableEntry> {
        let _guard = self.lock_interface(interface).await;
        let if_index = self
            .shadow()
            .route(interface, Purpose::DedicatedDefault)
            .map(|r| r.if_index)
            .ok_or_else(|| NetagentError::InvariantViolation {
                interface: interface.to_string(),
                reason: "main-table default requested before dedicated route".to_string(),
            })?;

        self.reconciler.apply(interface, if_index, gateway).await
    }

    /// Route one host through the interface's gateway in its dedicated table
    pub async fn add_host_route(&self, interface: &str, host: Ipv4Addr) -> NetagentResult<()> {
        let _guard = self.lock_interface(interface).await;
        let default = self
            .shadow()
            .route(interface, Purpose::DedicatedDefault)
            .ok_or_else(|| NetagentError::InvalidParameter(format!("{} has no active route", interface)))?;
        let gateway = default.gateway.ok_or_else(|| {
            NetagentError::InvalidParameter(format!("{} default route has no gateway", interface))
        })?;

        let route = RouteSpec::host(host, gateway, default.if_index, default.table_id);
        self.fast_routes.route_replace(&route).await?;
        self.record(interface, Purpose::HostRoute(host), OwnedEntry::Route(route));
        Ok(())
    }

    pub async fn remove_host_route(&self, interface: &str, host: Ipv4Addr) -> NetagentResult<()> {
        let _guard = self.lock_interface(interface).await;
        let route = self.shadow().route(interface, Purpose::HostRoute(host));
        if let Some(route) = route {
            self.fast_routes.route_del(&route).await?;
        }
        self.forget(interface, Purpose::HostRoute(host));
        Ok(())
    }

    /// Remove everything the interface owns
    ///
    /// Dedicated-table routes first, then the rule, then the recorded
    /// main-table entry. Every entry is attempted; entries that fail to
    /// delete stay recorded and the first error is returned.
    pub async fn remove_all(&self, interface: &str) -> NetagentResult<()> {
        let _guard = self.lock_interface(interface).await;
        let entries = self.shadow().entries_for(interface);
        let mut first_err = None;

        for (tag, entry) in &entries {
            if tag.purpose.is_main_table() {
                continue;
            }
            if let OwnedEntry::Route(route) = entry {
                match self.fast_routes.route_del(route).await {
                    Ok(()) => {
                        self.shadow().forget(tag);
                    }
                    Err(e) => {
                        warn!("Failed to delete {} ({}): {}", route, tag, e);
                        first_err.get_or_insert(e);
                    }
                }
            }
        }

        for (tag, entry) in &entries {
            if let OwnedEntry::Rule(rule) = entry {
                match self.rules.rule_del(rule).await {
                    Ok(()) => {
                        self.shadow().forget(tag);
                    }
                    Err(e) => {
                        warn!("Failed to delete {} ({}): {}", rule, tag, e);
                        first_err.get_or_insert(e);
                    }
                }
            }
        }

        if let Err(e) = self.reconciler.remove(interface).await {
            warn!("Failed to remove main-table default of {}: {}", interface, e);
            first_err.get_or_insert(e);
        }

        {
            let mut shadow = self.shadow();
            if shadow.is_empty_for(interface) {
                shadow.release_table(interface);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => {
                if !entries.is_empty() {
                    info!("Removed {} routing entries of {}", entries.len(), interface);
                }
                Ok(())
            }
        }
    }

    /// Engine metrics are `max(existing, baseline) + step`, so anything above
    /// the baseline may be ours even when it sits off the step grid.
    fn is_engine_metric(&self, metric: u32) -> bool {
        metric > self.settings.metric_baseline
    }

    /// Rebuild the shadow index after a restart
    ///
    /// Live entries shaped like the engine's own are adopted when they match
    /// `intended` and deleted otherwise. Entries of any other shape are left
    /// alone.
    pub async fn reconcile_startup(
        &self,
        managed: &[ManagedLink],
        intended: &[IntendedInterface],
    ) -> NetagentResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let base = self.settings.table_base;

        let by_table: HashMap<u32, &IntendedInterface> = intended
            .iter()
            .filter_map(|i| interface::table_id_for(base, i.if_index).ok().map(|t| (t, i)))
            .collect();

        for rule in self.rules.rule_list().await? {
            if rule.priority != self.settings.rule_priority || rule.table_id <= base {
                continue;
            }
            match by_table.get(&rule.table_id) {
                Some(i) if rule.source == i.address.address && rule.source_len == 32 => {
                    let mut shadow = self.shadow();
                    shadow.claim_table(&i.name, rule.table_id);
                    shadow.record(OwnerTag::new(&i.name, Purpose::SourceRule), OwnedEntry::Rule(rule));
                    report.adopted += 1;
                }
                _ => {
                    debug!("Removing stale rule {}", rule);
                    self.rules.rule_del(&rule).await?;
                    report.removed += 1;
                }
            }
        }

        for link in managed {
            let Ok(table_id) = interface::table_id_for(base, link.if_index) else {
                continue;
            };
            let intent = intended.iter().find(|i| i.name == link.name);
            let expected_default = intent.map(|i| RouteSpec::default_via(i.gateway, link.if_index, table_id));
            let expected_subnet = intent
                .filter(|i| i.address.prefix_len < 32)
                .map(|i| RouteSpec::subnet(i.address, link.if_index, table_id));

            for route in self.fast_routes.route_list(table_id).await? {
                let purpose = if expected_default.as_ref().is_some_and(|e| same_route(e, &route)) {
                    Some(Purpose::DedicatedDefault)
                } else if expected_subnet.as_ref().is_some_and(|e| same_route(e, &route)) {
                    Some(Purpose::Subnet)
                } else {
                    None
                };

                match purpose {
                    Some(purpose) => {
                        let mut shadow = self.shadow();
                        shadow.claim_table(&link.name, table_id);
                        shadow.record(OwnerTag::new(&link.name, purpose), OwnedEntry::Route(route));
                        report.adopted += 1;
                    }
                    None => {
                        debug!("Removing stale route {}", route);
                        self.fast_routes.route_del(&route).await?;
                        report.removed += 1;
                    }
                }
            }
        }

        let managed_indexes: HashMap<u32, &ManagedLink> =
            managed.iter().map(|l| (l.if_index, l)).collect();
        let mut adopted_main: HashSet<String> = HashSet::new();

        for route in self.reconciler.live_defaults().await? {
            let Some(link) = managed_indexes.get(&route.if_index) else {
                continue;
            };
            if !self.is_engine_metric(route.metric) {
                continue;
            }
            let intent = intended.iter().find(|i| i.name == link.name);
            let matches = intent.is_some_and(|i| route.gateway == Some(i.gateway));

            if matches && adopted_main.insert(link.name.clone()) {
                self.record(&link.name, Purpose::MainTableDefault, OwnedEntry::Route(route));
                report.adopted += 1;
            } else {
                debug!("Removing stale main-table default {}", route);
                self.reconciler.backend().route_del(&route).await?;
                report.removed += 1;
            }
        }

        info!(
            "Startup reconciliation: adopted {} entries, removed {}",
            report.adopted, report.removed
        );
        Ok(report)
    }

    pub fn status(&self, interface: &str) -> Option<RoutingStatus> {
        let shadow = self.shadow();
        let table_id = shadow.table_of(interface);
        let entries = shadow.entries_for(interface);
        if table_id.is_none() && entries.is_empty() {
            return None;
        }
        Some(RoutingStatus {
            interface: interface.to_string(),
            table_id,
            main_table: shadow.main_table_entry(interface),
            entries: entries
                .into_iter()
                .map(|(tag, entry)| StatusEntry { tag, entry: entry.to_string() })
                .collect(),
        })
    }

    /// Remove every interface's entries
    pub async fn shutdown(&self) {
        let interfaces = self.shadow().interfaces();
        for interface in interfaces {
            if let Err(e) = self.remove_all(&interface).await {
                error!("Failed to clean up routing for {}: {}", interface, e);
            }
        }
    }
}

fn same_route(expected: &RouteSpec, live: &RouteSpec) -> bool {
    expected.same_key(live) && expected.gateway == live.gateway && expected.if_index == live.if_index
}
