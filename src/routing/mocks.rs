//! Stateful in-memory kernel for routing tests.
//!
//! The mock tracks the routes and rules that exist rather than the calls
//! made, so tests assert on kernel state after a lifecycle operation. Both
//! backends share one [`KernelState`]; the declarative view only differs in
//! the key its failure and stall injections are looked up under.

#![cfg(test)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::netlink_ops::{RouteBackend, RouteSpec, RuleBackend, RuleSpec, MAIN_TABLE};
use crate::error::{NetagentError, NetagentResult};

#[derive(Debug, Default)]
pub struct KernelState {
    pub routes: Vec<RouteSpec>,
    pub rules: Vec<RuleSpec>,
    /// Operation key -> error message
    pub fail_on: HashMap<String, String>,
    /// Operation key -> delay before the operation runs
    pub stall_on: HashMap<String, Duration>,
    /// (table, number of default routes) after every route mutation
    pub default_counts: Vec<(u32, usize)>,
}

impl KernelState {
    fn note_defaults(&mut self, table_id: u32) {
        let count = self
            .routes
            .iter()
            .filter(|r| r.table_id == table_id && r.is_default())
            .count();
        self.default_counts.push((table_id, count));
    }
}

fn matches_delete(existing: &RouteSpec, wanted: &RouteSpec) -> bool {
    existing.table_id == wanted.table_id
        && existing.destination == wanted.destination
        && existing.prefix_len == wanted.prefix_len
        && (wanted.metric == 0 || existing.metric == wanted.metric)
        && (wanted.gateway.is_none() || existing.gateway == wanted.gateway)
        && (wanted.if_index == 0 || existing.if_index == wanted.if_index)
}

#[derive(Clone)]
pub struct MockKernel {
    pub state: Arc<Mutex<KernelState>>,
    prefix: &'static str,
}

impl MockKernel {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(KernelState::default())),
            prefix: "",
        }
    }

    /// A view of the same kernel used as the declarative backend
    pub fn declarative(&self) -> Self {
        Self { state: self.state.clone(), prefix: "decl_" }
    }

    fn key(&self, op: &str) -> String {
        format!("{}{}", self.prefix, op)
    }

    pub fn fail_on(&self, op: &str, message: &str) {
        let key = self.key(op);
        self.state.lock().unwrap().fail_on.insert(key, message.to_string());
    }

    pub fn stall_on(&self, op: &str, delay: Duration) {
        let key = self.key(op);
        self.state.lock().unwrap().stall_on.insert(key, delay);
    }

    pub fn clear_faults(&self) {
        let mut s = self.state.lock().unwrap();
        s.fail_on.clear();
        s.stall_on.clear();
    }

    pub fn seed_route(&self, route: RouteSpec) {
        self.state.lock().unwrap().routes.push(route);
    }

    pub fn seed_rule(&self, rule: RuleSpec) {
        self.state.lock().unwrap().rules.push(rule);
    }

    pub fn routes_in(&self, table_id: u32) -> Vec<RouteSpec> {
        self.state
            .lock()
            .unwrap()
            .routes
            .iter()
            .filter(|r| r.table_id == table_id)
            .cloned()
            .collect()
    }

    pub fn rules(&self) -> Vec<RuleSpec> {
        self.state.lock().unwrap().rules.clone()
    }

    pub fn main_defaults(&self) -> Vec<RouteSpec> {
        self.routes_in(MAIN_TABLE).into_iter().filter(|r| r.is_default()).collect()
    }

    pub fn default_counts(&self, table_id: u32) -> Vec<usize> {
        self.state
            .lock()
            .unwrap()
            .default_counts
            .iter()
            .filter(|(t, _)| *t == table_id)
            .map(|(_, c)| *c)
            .collect()
    }

    async fn enter(&self, op: &str) -> NetagentResult<()> {
        let key = self.key(op);
        let (stall, fail) = {
            let s = self.state.lock().unwrap();
            (s.stall_on.get(&key).copied(), s.fail_on.get(&key).cloned())
        };
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        match fail {
            Some(msg) => Err(NetagentError::Netlink(msg)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RouteBackend for MockKernel {
    async fn route_add(&self, route: &RouteSpec) -> NetagentResult<()> {
        self.enter("route_add").await?;
        let mut s = self.state.lock().unwrap();
        // EEXIST maps to success
        if !s.routes.iter().any(|r| r.same_key(route)) {
            s.routes.push(route.clone());
        }
        s.note_defaults(route.table_id);
        Ok(())
    }

    async fn route_replace(&self, route: &RouteSpec) -> NetagentResult<()> {
        self.enter("route_replace").await?;
        let mut s = self.state.lock().unwrap();
        match s.routes.iter_mut().find(|r| r.same_key(route)) {
            Some(existing) => *existing = route.clone(),
            None => s.routes.push(route.clone()),
        }
        s.note_defaults(route.table_id);
        Ok(())
    }

    async fn route_del(&self, route: &RouteSpec) -> NetagentResult<()> {
        self.enter("route_del").await?;
        let mut s = self.state.lock().unwrap();
        // Like the kernel, one delete removes one matching route; ESRCH maps to success
        if let Some(pos) = s.routes.iter().position(|r| matches_delete(r, route)) {
            s.routes.remove(pos);
        }
        s.note_defaults(route.table_id);
        Ok(())
    }

    async fn route_list(&self, table_id: u32) -> NetagentResult<Vec<RouteSpec>> {
        self.enter("route_list").await?;
        Ok(self.routes_in(table_id))
    }
}

#[async_trait]
impl RuleBackend for MockKernel {
    async fn rule_add(&self, rule: &RuleSpec) -> NetagentResult<()> {
        self.enter("rule_add").await?;
        let mut s = self.state.lock().unwrap();
        if !s.rules.contains(rule) {
            s.rules.push(rule.clone());
        }
        Ok(())
    }

    async fn rule_del(&self, rule: &RuleSpec) -> NetagentResult<()> {
        self.enter("rule_del").await?;
        self.state.lock().unwrap().rules.retain(|r| r != rule);
        Ok(())
    }

    async fn rule_list(&self) -> NetagentResult<Vec<RuleSpec>> {
        self.enter("rule_list").await?;
        Ok(self.rules())
    }
}
