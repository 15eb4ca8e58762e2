//! Managed interface data model
//!
//! Per-interface records owned by the manager, plus a small controller that
//! reads link state through `ip -json` and sysfs.

use crate::dhcp_lease::DhcpLease;
use crate::error::{NetagentError, NetagentResult};
use crate::validation;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;
use tokio::fs;
use tokio::process::Command;

/// IPv4 address with prefix length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ipv4Cidr {
    pub address: Ipv4Addr,
    pub prefix_len: u8,
}

impl Ipv4Cidr {
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Self {
        Self { address, prefix_len }
    }

    /// Network address of this prefix
    pub fn network(&self) -> Ipv4Addr {
        validation::network_address(self.address, self.prefix_len)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = NetagentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, prefix_len) = validation::parse_ipv4_cidr(s)?;
        Ok(Self { address, prefix_len })
    }
}

/// Administrative and carrier state of a link
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStatus {
    pub admin_up: bool,
    pub carrier: bool,
}

impl LinkStatus {
    /// Both preconditions for acquiring an address hold
    pub fn is_usable(&self) -> bool {
        self.admin_up && self.carrier
    }
}

/// Per-interface lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    #[default]
    Discovered,
    Acquiring,
    Active,
    Cleanup,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Discovered => "discovered",
            LifecycleState::Acquiring => "acquiring",
            LifecycleState::Active => "active",
            LifecycleState::Cleanup => "cleanup",
        };
        f.write_str(s)
    }
}

/// A managed interface as seen by the manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub index: u32,
    pub name: String,
    pub mac_address: Option<String>,
    pub link: LinkStatus,
    pub addresses: Vec<Ipv4Cidr>,
    pub gateway: Option<Ipv4Addr>,
    pub lease: Option<DhcpLease>,
    pub state: LifecycleState,
    pub table_id: u32,
}

impl InterfaceInfo {
    pub fn new(index: u32, name: impl Into<String>, table_id: u32) -> Self {
        Self {
            index,
            name: name.into(),
            mac_address: None,
            link: LinkStatus::default(),
            addresses: Vec::new(),
            gateway: None,
            lease: None,
            state: LifecycleState::Discovered,
            table_id,
        }
    }
}

/// Dedicated table id for an interface index
///
/// Fails when the id would overflow or land on a kernel-reserved table.
pub fn table_id_for(table_base: u32, if_index: u32) -> NetagentResult<u32> {
    let table_id = table_base.checked_add(if_index).ok_or_else(|| {
        NetagentError::InvalidParameter(format!(
            "table id overflow for base {} and ifindex {}",
            table_base, if_index
        ))
    })?;
    if validation::is_reserved_table(table_id) {
        return Err(NetagentError::InvalidParameter(format!(
            "table id {} for ifindex {} is reserved",
            table_id, if_index
        )));
    }
    Ok(table_id)
}

/// Link state captured from one `ip -json addr show` row
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSnapshot {
    pub index: u32,
    pub name: String,
    pub mac_address: Option<String>,
    pub link: LinkStatus,
    pub addresses: Vec<Ipv4Cidr>,
}

/// Reads interface state from iproute2 and sysfs
pub struct InterfaceController {}

impl InterfaceController {
    pub fn new() -> Self {
        Self {}
    }

    /// All links with their IPv4 addresses
    pub async fn list_links(&self) -> NetagentResult<Vec<LinkSnapshot>> {
        let output = self.run_ip_json(&["-json", "addr", "show"]).await?;
        parse_ip_addr_json(&output)
    }

    /// Wireless interfaces expose a `wireless` or `phy80211` sysfs node
    pub async fn is_wireless(&self, interface: &str) -> bool {
        if validation::validate_interface_name(interface).is_err() {
            return false;
        }
        let base = format!("/sys/class/net/{}", interface);
        fs::metadata(format!("{}/wireless", base)).await.is_ok()
            || fs::metadata(format!("{}/phy80211", base)).await.is_ok()
    }

    /// Interface index from sysfs
    pub async fn index_of(&self, interface: &str) -> NetagentResult<u32> {
        validation::validate_interface_name(interface)?;

        let sys_path = format!("/sys/class/net/{}", interface);
        if !Path::new(&sys_path).exists() {
            return Err(NetagentError::InterfaceNotFound(interface.to_string()));
        }

        self.read_sysfs_string(interface, "ifindex")
            .await
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| NetagentError::InterfaceNotFound(interface.to_string()))
    }

    async fn run_ip_json(&self, args: &[&str]) -> NetagentResult<String> {
        let cmd_str = format!("ip {}", args.join(" "));
        let output = Command::new("ip")
            .args(args)
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
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        String::from_utf8(output.stdout)
            .map_err(|e| NetagentError::Parse(format!("Invalid UTF-8 in JSON output: {}", e)))
    }

    async fn read_sysfs_string(&self, interface: &str, file: &str) -> Option<String> {
        let path = format!("/sys/class/net/{}/{}", interface, file);
        fs::read_to_string(path).await.ok().map(|s| s.trim().to_string())
    }
}

impl Default for InterfaceController {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `ip -json addr show` output
pub fn parse_ip_addr_json(json_str: &str) -> NetagentResult<Vec<LinkSnapshot>> {
    let json: serde_json::Value = serde_json::from_str(json_str)?;
    let Some(arr) = json.as_array() else {
        return Err(NetagentError::Parse("expected a JSON array from ip".to_string()));
    };

    let mut links = Vec::with_capacity(arr.len());
    for iface in arr {
        let (Some(index), Some(name)) = (
            iface.get("ifindex").and_then(|v| v.as_u64()),
            iface.get("ifname").and_then(|v| v.as_str()),
        ) else {
            continue;
        };

        let flags: Vec<&str> = iface
            .get("flags")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|f| f.as_str()).collect())
            .unwrap_or_default();

        let mut addresses = Vec::new();
        if let Some(addr_info) = iface.get("addr_info").and_then(|v| v.as_array()) {
            for addr in addr_info {
                if addr.get("family").and_then(|v| v.as_str()) != Some("inet") {
                    continue;
                }
                if let (Some(local), Some(prefixlen)) = (
                    addr.get("local").and_then(|v| v.as_str()),
                    addr.get("prefixlen").and_then(|v| v.as_u64()),
                ) {
                    if let Ok(address) = local.parse() {
                        addresses.push(Ipv4Cidr::new(address, prefixlen as u8));
                    }
                }
            }
        }

        links.push(LinkSnapshot {
            index: index as u32,
            name: name.to_string(),
            mac_address: iface.get("address").and_then(|v| v.as_str()).map(String::from),
            link: LinkStatus {
                admin_up: flags.contains(&"UP"),
                carrier: flags.contains(&"LOWER_UP"),
            },
            addresses,
        });
    }

    Ok(links)
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP_ADDR_JSON: &str = r#"[
        {"ifindex":1,"ifname":"lo","flags":["LOOPBACK","UP","LOWER_UP"],"mtu":65536,
         "address":"00:00:00:00:00:00",
         "addr_info":[{"family":"inet","local":"127.0.0.1","prefixlen":8,"scope":"host"}]},
        {"ifindex":3,"ifname":"wlan0","flags":["BROADCAST","MULTICAST","UP","LOWER_UP"],
         "address":"dc:a6:32:01:02:03",
         "addr_info":[{"family":"inet","local":"10.0.0.5","prefixlen":24},
                      {"family":"inet6","local":"fe80::1","prefixlen":64}]},
        {"ifindex":4,"ifname":"wlan1","flags":["NO-CARRIER","BROADCAST","UP"],"addr_info":[]}
    ]"#;

    #[test]
    fn test_parse_ip_addr_json() {
        let links = parse_ip_addr_json(IP_ADDR_JSON).unwrap();
        assert_eq!(links.len(), 3);

        let wlan0 = &links[1];
        assert_eq!(wlan0.index, 3);
        assert_eq!(wlan0.mac_address.as_deref(), Some("dc:a6:32:01:02:03"));
        assert!(wlan0.link.is_usable());
        assert_eq!(wlan0.addresses, vec![Ipv4Cidr::new(Ipv4Addr::new(10, 0, 0, 5), 24)]);

        let wlan1 = &links[2];
        assert!(wlan1.link.admin_up);
        assert!(!wlan1.link.carrier);
        assert!(wlan1.addresses.is_empty());
    }

    #[test]
    fn test_parse_rejects_non_array() {
        assert!(parse_ip_addr_json("{}").is_err());
        assert!(parse_ip_addr_json("not json").is_err());
    }

    #[test]
    fn test_table_id_for() {
        assert_eq!(table_id_for(1000, 3).unwrap(), 1003);
        assert!(table_id_for(250, 4).is_err());
        assert!(table_id_for(u32::MAX, 1).is_err());
    }

    #[test]
    fn test_cidr_display_and_network() {
        let cidr: Ipv4Cidr = "10.0.0.5/24".parse().unwrap();
        assert_eq!(cidr.to_string(), "10.0.0.5/24");
        assert_eq!(cidr.network(), Ipv4Addr::new(10, 0, 0, 0));
    }
}
