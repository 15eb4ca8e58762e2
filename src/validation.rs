//! Input validation
//!
//! Interface names and addresses end up on `ip` and DHCP client command
//! lines, so everything coming from config or lease files passes through here.

use crate::error::{NetagentError, NetagentResult};
use std::net::Ipv4Addr;

/// Maximum length for interface names (Linux kernel limit is 15)
const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Maximum length for error messages carried on the event bus
const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Kernel-reserved routing tables: unspec, default, main, local
pub const RESERVED_TABLE_IDS: [u32; 4] = [0, 253, 254, 255];

/// Priority of the kernel's own `from all lookup main` rule
pub const MAIN_RULE_PRIORITY: u32 = 32766;

/// Validate interface name to prevent command injection
///
/// Interface names must be alphanumeric with optional dashes, underscores
/// and dots, and no longer than 15 characters (Linux kernel limit)
pub fn validate_interface_name(name: &str) -> NetagentResult<()> {
    if name.is_empty() {
        return Err(NetagentError::InvalidParameter(
            "Interface name cannot be empty".to_string(),
        ));
    }

    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(NetagentError::InvalidParameter(format!(
            "Interface name too long (max {} characters)",
            MAX_INTERFACE_NAME_LEN
        )));
    }

    for c in name.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '_' && c != '.' {
            return Err(NetagentError::InvalidParameter(format!(
                "Invalid interface name '{}': contains invalid character '{}'",
                name, c
            )));
        }
    }

    // Could be read as an option by ip/dhclient
    if name.starts_with('-') {
        return Err(NetagentError::InvalidParameter(
            "Interface name cannot start with dash".to_string(),
        ));
    }

    Ok(())
}

/// Validate an IPv4 address
pub fn validate_ipv4_address(addr: &str) -> NetagentResult<Ipv4Addr> {
    addr.trim()
        .parse::<Ipv4Addr>()
        .map_err(|_| NetagentError::InvalidParameter(format!("Invalid IPv4 address: {}", addr)))
}

/// Validate IPv4 prefix length
pub fn validate_prefix_len(prefix: u8) -> NetagentResult<()> {
    if prefix > 32 {
        return Err(NetagentError::InvalidParameter(format!(
            "Prefix length {} exceeds maximum 32",
            prefix
        )));
    }
    Ok(())
}

/// Parse `a.b.c.d/len`; a bare address is taken as /32
pub fn parse_ipv4_cidr(cidr: &str) -> NetagentResult<(Ipv4Addr, u8)> {
    match cidr.split_once('/') {
        Some((addr, len)) => {
            let addr = validate_ipv4_address(addr)?;
            let len: u8 = len.trim().parse().map_err(|_| {
                NetagentError::InvalidParameter(format!("Invalid prefix length in {}", cidr))
            })?;
            validate_prefix_len(len)?;
            Ok((addr, len))
        }
        None => Ok((validate_ipv4_address(cidr)?, 32)),
    }
}

/// Convert a dotted subnet mask to a prefix length, rejecting non-contiguous masks
pub fn netmask_to_prefix_len(mask: Ipv4Addr) -> NetagentResult<u8> {
    let bits = u32::from(mask);
    let len = bits.leading_ones();
    if bits.checked_shl(len).unwrap_or(0) != 0 {
        return Err(NetagentError::InvalidParameter(format!(
            "Non-contiguous subnet mask: {}",
            mask
        )));
    }
    Ok(len as u8)
}

/// Network address of `addr/prefix_len`
pub fn network_address(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let mask = if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len.min(32)))
    };
    Ipv4Addr::from(u32::from(addr) & mask)
}

/// The dedicated table base must keep every ifindex clear of reserved ids
pub fn validate_table_base(base: u32) -> NetagentResult<()> {
    if base <= 255 {
        return Err(NetagentError::Config(format!(
            "routing.table_base {} must be above 255",
            base
        )));
    }
    Ok(())
}

/// Rule priority sits between operator overrides and the main-table lookup
pub fn validate_rule_priority(priority: u32) -> NetagentResult<()> {
    if priority == 0 || priority >= MAIN_RULE_PRIORITY {
        return Err(NetagentError::Config(format!(
            "routing.rule_priority {} must be in 1..{}",
            priority, MAIN_RULE_PRIORITY
        )));
    }
    Ok(())
}

pub fn is_reserved_table(table_id: u32) -> bool {
    RESERVED_TABLE_IDS.contains(&table_id)
}

/// Truncate messages before they leave the process
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.trim().to_string();

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let mut cut = MAX_ERROR_MESSAGE_LEN;
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str("... (truncated)");
    }

    sanitized
}
