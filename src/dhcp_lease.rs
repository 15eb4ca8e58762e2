//! dhclient lease file parsing
//!
//! dhclient appends a `lease { ... }` block on every bind or renewal; the last
//! block in the file is the current lease.
//!
//! ```text
//! lease {
//!   interface "wlan1";
//!   fixed-address 192.168.6.47;
//!   option subnet-mask 255.255.255.0;
//!   option routers 192.168.6.1;
//!   option domain-name-servers 192.168.6.1;
//!   renew 2 2025/07/15 23:12:28;
//!   rebind 3 2025/07/16 10:37:10;
//!   expire 3 2025/07/16 14:35:27;
//! }
//! ```

use crate::error::{NetagentError, NetagentResult};
use crate::interface::Ipv4Cidr;
use crate::validation;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;

/// A lease deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseDate {
    Never,
    At(DateTime<Utc>),
}

impl LeaseDate {
    /// Parse `W YYYY/MM/DD HH:MM:SS` (UTC), `epoch <secs>` or `never`
    pub fn parse(value: &str) -> NetagentResult<Self> {
        let value = value.trim();
        if value == "never" {
            return Ok(LeaseDate::Never);
        }

        if let Some(secs) = value.strip_prefix("epoch") {
            let secs: i64 = secs
                .trim()
                .parse()
                .map_err(|_| NetagentError::Parse(format!("bad epoch lease date: {}", value)))?;
            return Utc
                .timestamp_opt(secs, 0)
                .single()
                .map(LeaseDate::At)
                .ok_or_else(|| NetagentError::Parse(format!("epoch out of range: {}", value)));
        }

        // Leading token is the weekday, redundant with the date
        let (_, datetime) = value
            .split_once(' ')
            .ok_or_else(|| NetagentError::Parse(format!("bad lease date: {}", value)))?;
        let naive = NaiveDateTime::parse_from_str(datetime.trim(), "%Y/%m/%d %H:%M:%S")
            .map_err(|e| NetagentError::Parse(format!("bad lease date '{}': {}", value, e)))?;
        Ok(LeaseDate::At(naive.and_utc()))
    }

    pub fn has_passed(&self, now: DateTime<Utc>) -> bool {
        match self {
            LeaseDate::Never => false,
            LeaseDate::At(at) => *at <= now,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            LeaseDate::Never => None,
            LeaseDate::At(at) => Some(*at),
        }
    }
}

/// The current DHCP binding of one interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhcpLease {
    pub interface: String,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
    pub dns_servers: Vec<Ipv4Addr>,
    pub lease_time: Option<u32>,
    pub server: Option<Ipv4Addr>,
    pub renew: LeaseDate,
    pub rebind: LeaseDate,
    pub expire: LeaseDate,
}

impl DhcpLease {
    pub fn cidr(&self) -> Ipv4Cidr {
        Ipv4Cidr::new(self.address, self.prefix_len)
    }

    /// Address, prefix or gateway differ, so routes must be re-applied
    pub fn binding_differs(&self, other: &DhcpLease) -> bool {
        self.address != other.address
            || self.prefix_len != other.prefix_len
            || self.gateway != other.gateway
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire.has_passed(now)
    }
}

/// Parse the last lease block of a lease file
///
/// Returns `Ok(None)` when the file holds no lease block yet.
pub fn parse_leases(content: &str) -> NetagentResult<Option<DhcpLease>> {
    let Some(start) = content.rfind("lease {") else {
        return Ok(None);
    };
    let block = &content[start + "lease {".len()..];
    // A half-written block has no closing brace yet
    let Some(end) = block.find('}') else {
        return Err(NetagentError::Parse("unterminated lease block".to_string()));
    };

    parse_block(&block[..end]).map(Some)
}

fn parse_block(block: &str) -> NetagentResult<DhcpLease> {
    let mut interface = None;
    let mut address = None;
    let mut mask = None;
    let mut gateway = None;
    let mut dns_servers = Vec::new();
    let mut lease_time = None;
    let mut server = None;
    let mut renew = LeaseDate::Never;
    let mut rebind = LeaseDate::Never;
    let mut expire = LeaseDate::Never;

    for statement in block.split(';') {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        let (key, rest) = statement.split_once(char::is_whitespace).unwrap_or((statement, ""));
        let rest = rest.trim();

        match key {
            "interface" => interface = Some(rest.trim_matches('"').to_string()),
            "fixed-address" => address = Some(validation::validate_ipv4_address(rest)?),
            "renew" => renew = LeaseDate::parse(rest)?,
            "rebind" => rebind = LeaseDate::parse(rest)?,
            "expire" => expire = LeaseDate::parse(rest)?,
            "option" => {
                let (name, value) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
                let value = value.trim();
                match name {
                    "subnet-mask" => mask = Some(validation::validate_ipv4_address(value)?),
                    // Several routers may be listed; the first is the default gateway
                    "routers" => {
                        let first = value.split(',').next().unwrap_or(value);
                        gateway = Some(validation::validate_ipv4_address(first)?);
                    }
                    "domain-name-servers" => {
                        dns_servers = value
                            .split(',')
                            .map(validation::validate_ipv4_address)
                            .collect::<NetagentResult<Vec<_>>>()?;
                    }
                    "dhcp-lease-time" => lease_time = value.parse().ok(),
                    "dhcp-server-identifier" => server = value.parse().ok(),
                    _ => {}
                }
            }
            _ => {}
        }
    }

    let interface =
        interface.ok_or_else(|| NetagentError::Parse("lease has no interface".to_string()))?;
    let address =
        address.ok_or_else(|| NetagentError::Parse("lease has no fixed-address".to_string()))?;
    let gateway =
        gateway.ok_or_else(|| NetagentError::Parse("lease has no routers option".to_string()))?;
    let prefix_len = match mask {
        Some(mask) => validation::netmask_to_prefix_len(mask)?,
        None => 32,
    };

    Ok(DhcpLease {
        interface,
        address,
        prefix_len,
        gateway,
        dns_servers,
        lease_time,
        server,
        renew,
        rebind,
        expire,
    })
}

/// Read and parse a lease file; a missing file is `Ok(None)`
pub async fn read_lease_file(path: &Path) -> NetagentResult<Option<DhcpLease>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => parse_leases(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
