//! Declarative path: main-table routes through iproute2.
//!
//! iproute2 resolves device names and keeps multiple default routes with
//! distinct metrics apart reliably, at the cost of a process per call.
//! Only main-table default routes go through here.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use tokio::process::Command;
use tracing::debug;

use super::netlink_ops::{RouteBackend, RouteSpec};
use crate::error::{NetagentError, NetagentResult};

/// Route backend that shells out to `ip`
#[derive(Debug, Clone)]
pub struct IpRouteBackend {
    ip_bin: String,
}

impl IpRouteBackend {
    pub fn new() -> Self {
        Self { ip_bin: "ip".to_string() }
    }

    async fn run_ip(&self, args: &[String]) -> NetagentResult<String> {
        let cmd_str = format!("{} {}", self.ip_bin, args.join(" "));
        debug!("declarative: {}", cmd_str);

        // Dropping the future (worker timeout) must not leave `ip` running
        let output = Command::new(&self.ip_bin)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| NetagentError::CommandFailed {
                cmd: cmd_str.clone(),
                code: None,
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(NetagentError::CommandFailed {
                cmd: cmd_str,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        String::from_utf8(output.stdout)
            .map_err(|e| NetagentError::Parse(format!("Invalid UTF-8 in ip output: {}", e)))
    }

    /// ifindex -> name for every link
    async fn link_names(&self) -> NetagentResult<HashMap<u32, String>> {
        let out = self
            .run_ip(&["-json".to_string(), "link".to_string(), "show".to_string()])
            .await?;
        parse_link_names(&out)
    }

    async fn device_name(&self, if_index: u32) -> NetagentResult<String> {
        self.link_names()
            .await?
            .remove(&if_index)
            .ok_or_else(|| NetagentError::InterfaceNotFound(format!("ifindex {}", if_index)))
    }

    async fn mutate(&self, verb: &str, route: &RouteSpec) -> NetagentResult<()> {
        let dev = self.device_name(route.if_index).await?;
        self.run_ip(&route_args(verb, route, &dev)).await.map(|_| ())
    }
}

impl Default for IpRouteBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RouteBackend for IpRouteBackend {
    async fn route_add(&self, route: &RouteSpec) -> NetagentResult<()> {
        match self.mutate("add", route).await {
            Err(NetagentError::CommandFailed { ref stderr, .. }) if stderr.contains("File exists") => Ok(()),
            other => other,
        }
    }

    async fn route_replace(&self, route: &RouteSpec) -> NetagentResult<()> {
        self.mutate("replace", route).await
    }

    async fn route_del(&self, route: &RouteSpec) -> NetagentResult<()> {
        let dev = match self.device_name(route.if_index).await {
            Ok(dev) => dev,
            // Link gone, its routes went with it
            Err(NetagentError::InterfaceNotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        match self.run_ip(&route_args("del", route, &dev)).await {
            Err(NetagentError::CommandFailed { ref stderr, .. }) if is_missing_route(stderr) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn route_list(&self, table_id: u32) -> NetagentResult<Vec<RouteSpec>> {
        let names = self.link_names().await?;
        let args: Vec<String> = ["-4", "-json", "route", "show", "table"]
            .iter()
            .map(|s| s.to_string())
            .chain(std::iter::once(table_id.to_string()))
            .collect();
        let out = self.run_ip(&args).await?;
        parse_route_json(&out, table_id, &names)
    }
}

fn is_missing_route(stderr: &str) -> bool {
    stderr.contains("No such process") || stderr.contains("Cannot find")
}

/// Arguments for `ip -4 route <verb> ...`
pub fn route_args(verb: &str, route: &RouteSpec, dev: &str) -> Vec<String> {
    let mut args = vec!["-4".to_string(), "route".to_string(), verb.to_string()];
    if route.is_default() {
        args.push("default".to_string());
    } else {
        args.push(format!("{}/{}", route.destination, route.prefix_len));
    }
    if let Some(gw) = route.gateway {
        args.extend(["via".to_string(), gw.to_string()]);
    }
    args.extend(["dev".to_string(), dev.to_string()]);
    args.extend(["table".to_string(), route.table_id.to_string()]);
    if route.metric != 0 {
        args.extend(["metric".to_string(), route.metric.to_string()]);
    }
    if let Some(src) = route.pref_source {
        args.extend(["src".to_string(), src.to_string()]);
    }
    if route.scope_link {
        args.extend(["scope".to_string(), "link".to_string()]);
    }
    args
}

/// Parse `ip -json link show` into ifindex -> name
pub fn parse_link_names(json_str: &str) -> NetagentResult<HashMap<u32, String>> {
    let json: serde_json::Value = serde_json::from_str(json_str)?;
    let mut names = HashMap::new();
    if let Some(arr) = json.as_array() {
        for link in arr {
            if let (Some(index), Some(name)) = (
                link.get("ifindex").and_then(|v| v.as_u64()),
                link.get("ifname").and_then(|v| v.as_str()),
            ) {
                names.insert(index as u32, name.to_string());
            }
        }
    }
    Ok(names)
}

/// Parse `ip -4 -json route show table <t>`
///
/// Routes on devices missing from `names` and non-unicast entries are skipped.
pub fn parse_route_json(
    json_str: &str,
    table_id: u32,
    names: &HashMap<u32, String>,
) -> NetagentResult<Vec<RouteSpec>> {
    let json: serde_json::Value = serde_json::from_str(json_str)?;
    let Some(arr) = json.as_array() else {
        return Err(NetagentError::Parse("expected a JSON array from ip route".to_string()));
    };

    let by_name: HashMap<&str, u32> = names.iter().map(|(i, n)| (n.as_str(), *i)).collect();
    let mut routes = Vec::new();

    for entry in arr {
        if entry.get("type").and_then(|v| v.as_str()).is_some_and(|t| t != "unicast") {
            continue;
        }
        let Some(dst) = entry.get("dst").and_then(|v| v.as_str()) else {
            continue;
        };
        let Some(if_index) = entry
            .get("dev")
            .and_then(|v| v.as_str())
            .and_then(|d| by_name.get(d).copied())
        else {
            continue;
        };

        let (destination, prefix_len) = if dst == "default" {
            (Ipv4Addr::UNSPECIFIED, 0)
        } else {
            match crate::validation::parse_ipv4_cidr(dst) {
                Ok(parsed) => parsed,
                Err(_) => continue,
            }
        };

        routes.push(RouteSpec {
            destination,
            prefix_len,
            gateway: entry.get("gateway").and_then(|v| v.as_str()).and_then(|g| g.parse().ok()),
            if_index,
            table_id,
            metric: entry.get("metric").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            pref_source: entry.get("prefsrc").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()),
            scope_link: entry.get("scope").and_then(|v| v.as_str()) == Some("link"),
        });
    }

    Ok(routes)
}
