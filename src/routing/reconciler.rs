//! Main-table default route reconciliation.
//!
//! Each job diffs the interface's desired main-table default against the
//! live main table and commits the difference through the declarative
//! backend. Jobs run on a bounded pool of worker permits, each attempt is
//! bounded by a timeout, and failed attempts are retried with exponential
//! backoff. Commits to the shared main table are serialized because the
//! metric of a new entry depends on every other entry.

use backoff::future::retry;
use backoff::ExponentialBackoffBuilder;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use super::netlink_ops::{RouteBackend, RouteSpec, MAIN_TABLE};
use super::shadow::{MainTableEntry, OwnedEntry, OwnerTag, Purpose, ShadowIndex};
use crate::config::RoutingSettings;
use crate::error::{NetagentError, NetagentResult};

/// How the new entry is installed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Install {
    /// Same metric as the current entry: swap in place
    Replace(RouteSpec),
    /// New metric: add next to the current entry, which is then deleted
    Add(RouteSpec),
}

/// Result of diffing desired against live state
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MainTablePlan {
    pub install: Option<Install>,
    pub delete: Vec<RouteSpec>,
    /// The entry the interface owns once the plan is committed
    pub result: Option<RouteSpec>,
}

fn is_live(route: &RouteSpec, live: &[RouteSpec]) -> bool {
    live.iter()
        .any(|r| r.same_key(route) && r.if_index == route.if_index && r.gateway == route.gateway)
}

/// Metric for a new entry: above every default the interface does not own
pub fn compute_metric(live: &[RouteSpec], owned: &[RouteSpec], baseline: u32, step: u32) -> u32 {
    live.iter()
        .filter(|r| r.is_default() && r.table_id == MAIN_TABLE)
        .filter(|r| !owned.iter().any(|o| o.same_key(r) && o.if_index == r.if_index))
        .map(|r| r.metric)
        .fold(baseline, u32::max)
        .saturating_add(step)
}

/// Diff one interface's main-table state
///
/// `current` is the recorded entry, `retired` are superseded entries still
/// recorded, `desired` is `(if_index, gateway)` or `None` for removal.
pub fn plan_main_table(
    live: &[RouteSpec],
    current: Option<&RouteSpec>,
    retired: &[RouteSpec],
    desired: Option<(u32, Ipv4Addr)>,
    baseline: u32,
    step: u32,
) -> MainTablePlan {
    let mut delete: Vec<RouteSpec> = retired.to_vec();

    let Some((if_index, gateway)) = desired else {
        delete.extend(current.cloned());
        return MainTablePlan { install: None, delete, result: None };
    };

    if let Some(cur) = current {
        if cur.gateway == Some(gateway) && cur.if_index == if_index && is_live(cur, live) {
            return MainTablePlan { install: None, delete, result: Some(cur.clone()) };
        }
    }

    let mut owned: Vec<RouteSpec> = retired.to_vec();
    owned.extend(current.cloned());
    let metric = compute_metric(live, &owned, baseline, step);
    let new = RouteSpec::default_via(gateway, if_index, MAIN_TABLE).with_metric(metric);

    let install = match current {
        Some(cur) if cur.metric == metric => Install::Replace(new.clone()),
        Some(cur) => {
            delete.push(cur.clone());
            Install::Add(new.clone())
        }
        None => Install::Add(new.clone()),
    };

    MainTablePlan { install: Some(install), delete, result: Some(new) }
}

/// Runs main-table jobs for every interface
pub struct MainTableReconciler {
    backend: Arc<dyn RouteBackend>,
    shadow: Arc<StdMutex<ShadowIndex>>,
    workers: Arc<Semaphore>,
    commit_lock: Mutex<()>,
    metric_baseline: u32,
    metric_step: u32,
    attempt_timeout: Duration,
    max_elapsed: Duration,
}

impl MainTableReconciler {
    pub fn new(
        backend: Arc<dyn RouteBackend>,
        shadow: Arc<StdMutex<ShadowIndex>>,
        settings: &RoutingSettings,
    ) -> Self {
        Self {
            backend,
            shadow,
            workers: Arc::new(Semaphore::new(settings.declarative_workers.max(1))),
            commit_lock: Mutex::new(()),
            metric_baseline: settings.metric_baseline,
            metric_step: settings.metric_step,
            attempt_timeout: settings.declarative_timeout(),
            max_elapsed: settings.declarative_max_elapsed(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn RouteBackend> {
        &self.backend
    }

    /// Install or update the interface's main-table default
    pub async fn apply(
        &self,
        interface: &str,
        if_index: u32,
        gateway: Ipv4Addr,
    ) -> NetagentResult<MainTableEntry> {
        let route = self.run_job(interface, Some((if_index, gateway))).await?;
        route
            .as_ref()
            .and_then(|r| MainTableEntry::from_route(interface, r))
            .ok_or_else(|| NetagentError::InvariantViolation {
                interface: interface.to_string(),
                reason: "main-table job produced no entry".to_string(),
            })
    }

    /// Delete every main-table entry the interface owns
    pub async fn remove(&self, interface: &str) -> NetagentResult<()> {
        if self.owned_routes(interface).is_empty() {
            return Ok(());
        }
        self.run_job(interface, None).await.map(|_| ())
    }

    /// Live main-table default routes
    pub async fn live_defaults(&self) -> NetagentResult<Vec<RouteSpec>> {
        let live = self.backend.route_list(MAIN_TABLE).await?;
        Ok(live.into_iter().filter(|r| r.is_default()).collect())
    }

    fn owned_routes(&self, interface: &str) -> Vec<RouteSpec> {
        match self.shadow.lock() {
            Ok(shadow) => shadow.main_table_routes(interface),
            Err(poisoned) => poisoned.into_inner().main_table_routes(interface),
        }
    }

    async fn run_job(
        &self,
        interface: &str,
        desired: Option<(u32, Ipv4Addr)>,
    ) -> NetagentResult<Option<RouteSpec>> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(200))
            .with_max_interval(self.attempt_timeout)
            .with_max_elapsed_time(Some(self.max_elapsed))
            .build();

        let mut attempt = 0u32;
        retry(policy, || {
            attempt += 1;
            let n = attempt;
            async move {
                let _permit = self
                    .workers
                    .acquire()
                    .await
                    .map_err(|_| backoff::Error::permanent(NetagentError::ChannelClosed("declarative workers".into())))?;

                match tokio::time::timeout(self.attempt_timeout, self.attempt(interface, desired)).await {
                    Ok(Ok(route)) => Ok(route),
                    Ok(Err(e @ NetagentError::InterfaceNotFound(_))) => Err(backoff::Error::permanent(e)),
                    Ok(Err(e)) => {
                        warn!("Main-table job for {} failed (attempt {}): {}", interface, n, e);
                        Err(backoff::Error::transient(e))
                    }
                    Err(_) => {
                        warn!(
                            "Main-table job for {} timed out after {:?} (attempt {})",
                            interface, self.attempt_timeout, n
                        );
                        Err(backoff::Error::transient(NetagentError::Timeout(format!(
                            "main-table job for {}",
                            interface
                        ))))
                    }
                }
            }
        })
        .await
    }

    async fn attempt(
        &self,
        interface: &str,
        desired: Option<(u32, Ipv4Addr)>,
    ) -> NetagentResult<Option<RouteSpec>> {
        let _commit = self.commit_lock.lock().await;

        let live = self.backend.route_list(MAIN_TABLE).await?;
        let (current, retired) = {
            let shadow = self.shadow_guard();
            let current = shadow.route(interface, Purpose::MainTableDefault);
            let retired: Vec<RouteSpec> =
                shadow.route(interface, Purpose::MainTableRetired).into_iter().collect();
            (current, retired)
        };

        let plan = plan_main_table(
            &live,
            current.as_ref(),
            &retired,
            desired,
            self.metric_baseline,
            self.metric_step,
        );
        debug!("Main-table plan for {}: {:?}", interface, plan);

        // Record intent before touching the kernel so an aborted job never
        // leaves an untracked entry behind
        if let Some(new) = &plan.result {
            let mut shadow = self.shadow_guard();
            if let Some(cur) = current.as_ref().filter(|c| *c != new && !c.same_key(new)) {
                shadow.record(
                    OwnerTag::new(interface, Purpose::MainTableRetired),
                    OwnedEntry::Route(cur.clone()),
                );
            }
            shadow.record(
                OwnerTag::new(interface, Purpose::MainTableDefault),
                OwnedEntry::Route(new.clone()),
            );
        }

        match &plan.install {
            Some(Install::Replace(route)) => self.backend.route_replace(route).await?,
            Some(Install::Add(route)) => self.backend.route_add(route).await?,
            None => {}
        }

        for route in &plan.delete {
            if plan.result.as_ref().is_some_and(|r| r == route) {
                continue;
            }
            self.backend.route_del(route).await?;
            let mut shadow = self.shadow_guard();
            for purpose in [Purpose::MainTableRetired, Purpose::MainTableDefault] {
                let tag = OwnerTag::new(interface, purpose);
                if shadow.get(&tag) == Some(&OwnedEntry::Route(route.clone())) {
                    shadow.forget(&tag);
                }
            }
        }

        if let Some(route) = &plan.result {
            if plan.install.is_some() {
                info!("Main-table default for {}: {}", interface, route);
            }
        }
        Ok(plan.result)
    }

    fn shadow_guard(&self) -> std::sync::MutexGuard<'_, ShadowIndex> {
        match self.shadow.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
