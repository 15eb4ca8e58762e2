//! Kernel route/rule types and the fast-path netlink backend.
//!
//! [`RouteSpec`] and [`RuleSpec`] decouple the engine from the netlink wire
//! format. [`RouteBackend`] and [`RuleBackend`] are the seams the engine
//! mutates the kernel through; [`NetlinkBackend`] is the production fast
//! path over an `rtnetlink::Handle`.

use async_trait::async_trait;
use futures::TryStreamExt;
use rtnetlink::packet_route::route::{RouteAddress, RouteAttribute, RouteMessage, RouteScope};
use rtnetlink::packet_route::rule::{RuleAction, RuleAttribute, RuleMessage};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use tracing::debug;

use crate::error::{NetagentError, NetagentResult};
use crate::interface::Ipv4Cidr;

/// Kernel id of the main routing table
pub const MAIN_TABLE: u32 = 254;

// ============================================================================
// Domain Types
// ============================================================================

/// IPv4 route decoupled from the wire format.
///
/// `metric` 0 means "no priority attribute". The kernel keys routes by
/// (table, destination, prefix, metric).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteSpec {
    pub destination: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Option<Ipv4Addr>,
    pub if_index: u32,
    pub table_id: u32,
    pub metric: u32,
    pub pref_source: Option<Ipv4Addr>,
    pub scope_link: bool,
}

impl RouteSpec {
    /// `default via <gateway> dev <if_index> table <table_id>`
    pub fn default_via(gateway: Ipv4Addr, if_index: u32, table_id: u32) -> Self {
        Self {
            destination: Ipv4Addr::UNSPECIFIED,
            prefix_len: 0,
            gateway: Some(gateway),
            if_index,
            table_id,
            metric: 0,
            pref_source: None,
            scope_link: false,
        }
    }

    /// On-link route for the interface's own network
    pub fn subnet(address: Ipv4Cidr, if_index: u32, table_id: u32) -> Self {
        Self {
            destination: address.network(),
            prefix_len: address.prefix_len,
            gateway: None,
            if_index,
            table_id,
            metric: 0,
            pref_source: Some(address.address),
            scope_link: true,
        }
    }

    /// `/32` route to one host via a gateway
    pub fn host(host: Ipv4Addr, gateway: Ipv4Addr, if_index: u32, table_id: u32) -> Self {
        Self {
            destination: host,
            prefix_len: 32,
            ..Self::default_via(gateway, if_index, table_id)
        }
    }

    pub fn with_metric(mut self, metric: u32) -> Self {
        self.metric = metric;
        self
    }

    pub fn is_default(&self) -> bool {
        self.prefix_len == 0
    }

    /// Same kernel identity, so `replace` swaps one for the other
    pub fn same_key(&self, other: &RouteSpec) -> bool {
        self.table_id == other.table_id
            && self.destination == other.destination
            && self.prefix_len == other.prefix_len
            && self.metric == other.metric
    }
}

impl fmt::Display for RouteSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default() {
            write!(f, "default")?;
        } else {
            write!(f, "{}/{}", self.destination, self.prefix_len)?;
        }
        if let Some(gw) = self.gateway {
            write!(f, " via {}", gw)?;
        }
        write!(f, " dev #{} table {}", self.if_index, self.table_id)?;
        if self.metric != 0 {
            write!(f, " metric {}", self.metric)?;
        }
        Ok(())
    }
}

/// `from <source>/<len> lookup <table_id>` at `priority`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleSpec {
    pub source: Ipv4Addr,
    pub source_len: u8,
    pub table_id: u32,
    pub priority: u32,
}

impl RuleSpec {
    pub fn from_address(source: Ipv4Addr, table_id: u32, priority: u32) -> Self {
        Self { source, source_len: 32, table_id, priority }
    }
}

impl fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "from {}/{} lookup {} pref {}",
            self.source, self.source_len, self.table_id, self.priority
        )
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Route mutations against one kernel view.
///
/// Implementations map "already exists" on add and "not found" on delete to
/// success.
#[async_trait]
pub trait RouteBackend: Send + Sync {
    async fn route_add(&self, route: &RouteSpec) -> NetagentResult<()>;
    async fn route_replace(&self, route: &RouteSpec) -> NetagentResult<()>;
    async fn route_del(&self, route: &RouteSpec) -> NetagentResult<()>;
    /// IPv4 unicast routes of one table
    async fn route_list(&self, table_id: u32) -> NetagentResult<Vec<RouteSpec>>;
}

/// Policy rule mutations
#[async_trait]
pub trait RuleBackend: Send + Sync {
    async fn rule_add(&self, rule: &RuleSpec) -> NetagentResult<()>;
    async fn rule_del(&self, rule: &RuleSpec) -> NetagentResult<()>;
    async fn rule_list(&self) -> NetagentResult<Vec<RuleSpec>>;
}

// ============================================================================
// Real Implementation
// ============================================================================

/// Fast path: request/response netlink calls through `rtnetlink`
#[derive(Clone)]
pub struct NetlinkBackend {
    handle: rtnetlink::Handle,
}

impl NetlinkBackend {
    pub fn new(handle: rtnetlink::Handle) -> Self {
        Self { handle }
    }

    /// Open a netlink connection and drive it on the runtime
    pub fn connect() -> NetagentResult<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()
            .map_err(|e| NetagentError::Netlink(format!("Failed to create rtnetlink connection: {}", e)))?;
        tokio::spawn(connection);
        Ok(Self::new(handle))
    }

    fn build_route_message(spec: &RouteSpec) -> RouteMessage {
        let mut builder = rtnetlink::RouteMessageBuilder::<Ipv4Addr>::default()
            .destination_prefix(spec.destination, spec.prefix_len)
            .output_interface(spec.if_index)
            .table_id(spec.table_id);
        if let Some(gw) = spec.gateway {
            builder = builder.gateway(gw);
        }
        if spec.metric != 0 {
            builder = builder.priority(spec.metric);
        }
        if let Some(src) = spec.pref_source {
            builder = builder.pref_source(src);
        }
        if spec.scope_link {
            builder = builder.scope(RouteScope::Link);
        }
        builder.build()
    }

    fn route_message_to_spec(msg: &RouteMessage) -> Option<RouteSpec> {
        let if_index = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Oif(idx) => Some(*idx),
            _ => None,
        })?;

        let destination = msg
            .attributes
            .iter()
            .find_map(|a| match a {
                RouteAttribute::Destination(RouteAddress::Inet(ip)) => Some(*ip),
                _ => None,
            })
            .unwrap_or(Ipv4Addr::UNSPECIFIED);

        let gateway = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Gateway(RouteAddress::Inet(ip)) => Some(*ip),
            _ => None,
        });

        // Tables above 255 only appear in the attribute
        let table_id = msg
            .attributes
            .iter()
            .find_map(|a| match a {
                RouteAttribute::Table(id) => Some(*id),
                _ => None,
            })
            .unwrap_or(u32::from(msg.header.table));

        let metric = msg
            .attributes
            .iter()
            .find_map(|a| match a {
                RouteAttribute::Priority(p) => Some(*p),
                _ => None,
            })
            .unwrap_or(0);

        let pref_source = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::PrefSource(RouteAddress::Inet(ip)) => Some(*ip),
            _ => None,
        });

        Some(RouteSpec {
            destination,
            prefix_len: msg.header.destination_prefix_length,
            gateway,
            if_index,
            table_id,
            metric,
            pref_source,
            scope_link: msg.header.scope == RouteScope::Link,
        })
    }

    fn rule_message_to_spec(msg: &RuleMessage) -> Option<RuleSpec> {
        let source = msg.attributes.iter().find_map(|a| match a {
            RuleAttribute::Source(IpAddr::V4(ip)) => Some(*ip),
            _ => None,
        })?;
        let table_id = msg
            .attributes
            .iter()
            .find_map(|a| match a {
                RuleAttribute::Table(t) => Some(*t),
                _ => None,
            })
            .unwrap_or(u32::from(msg.header.table));
        let priority = msg
            .attributes
            .iter()
            .find_map(|a| match a {
                RuleAttribute::Priority(p) => Some(*p),
                _ => None,
            })
            .unwrap_or(0);

        Some(RuleSpec {
            source,
            source_len: msg.header.src_len,
            table_id,
            priority,
        })
    }
}

fn netlink_errno(err: &rtnetlink::Error) -> Option<i32> {
    match err {
        rtnetlink::Error::NetlinkError(msg) => Some(-msg.raw_code()),
        _ => None,
    }
}

/// EEXIST on add means the entry is already in place
fn ignore_exists(result: Result<(), rtnetlink::Error>) -> NetagentResult<()> {
    match result {
        Err(e) if netlink_errno(&e) == Some(libc::EEXIST) => Ok(()),
        other => other.map_err(NetagentError::from),
    }
}

/// ENOENT/ESRCH on delete means the entry is already gone
fn ignore_missing(result: Result<(), rtnetlink::Error>) -> NetagentResult<()> {
    match result {
        Err(e) if matches!(netlink_errno(&e), Some(libc::ENOENT) | Some(libc::ESRCH)) => Ok(()),
        other => other.map_err(NetagentError::from),
    }
}

#[async_trait]
impl RouteBackend for NetlinkBackend {
    async fn route_add(&self, route: &RouteSpec) -> NetagentResult<()> {
        debug!("netlink: route add {}", route);
        let msg = Self::build_route_message(route);
        ignore_exists(self.handle.route().add(msg).execute().await)
    }

    async fn route_replace(&self, route: &RouteSpec) -> NetagentResult<()> {
        debug!("netlink: route replace {}", route);
        let msg = Self::build_route_message(route);
        self.handle.route().add(msg).replace().execute().await?;
        Ok(())
    }

    async fn route_del(&self, route: &RouteSpec) -> NetagentResult<()> {
        debug!("netlink: route del {}", route);
        let msg = Self::build_route_message(route);
        ignore_missing(self.handle.route().del(msg).execute().await)
    }

    async fn route_list(&self, table_id: u32) -> NetagentResult<Vec<RouteSpec>> {
        let msg = rtnetlink::RouteMessageBuilder::<Ipv4Addr>::default()
            .table_id(table_id)
            .build();
        let routes: Vec<_> = self.handle.route().get(msg).execute().try_collect().await?;

        Ok(routes
            .iter()
            .filter_map(Self::route_message_to_spec)
            .filter(|r| r.table_id == table_id)
            .collect())
    }
}

#[async_trait]
impl RuleBackend for NetlinkBackend {
    async fn rule_add(&self, rule: &RuleSpec) -> NetagentResult<()> {
        debug!("netlink: rule add {}", rule);
        let result = self
            .handle
            .rule()
            .add()
            .v4()
            .source_prefix(rule.source, rule.source_len)
            .table_id(rule.table_id)
            .priority(rule.priority)
            .action(RuleAction::ToTable)
            .execute()
            .await;
        ignore_exists(result)
    }

    async fn rule_del(&self, rule: &RuleSpec) -> NetagentResult<()> {
        debug!("netlink: rule del {}", rule);
        let rules: Vec<_> = self
            .handle
            .rule()
            .get(rtnetlink::IpVersion::V4)
            .execute()
            .try_collect()
            .await?;

        for msg in rules {
            if Self::rule_message_to_spec(&msg).as_ref() == Some(rule) {
                return ignore_missing(self.handle.rule().del(msg).execute().await);
            }
        }

        // Absent rule: nothing to do
        Ok(())
    }

    async fn rule_list(&self) -> NetagentResult<Vec<RuleSpec>> {
        let rules: Vec<_> = self
            .handle
            .rule()
            .get(rtnetlink::IpVersion::V4)
            .execute()
            .try_collect()
            .await?;

        Ok(rules.iter().filter_map(Self::rule_message_to_spec).collect())
    }
}
