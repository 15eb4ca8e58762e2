//! Error types for netagent

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetagentError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Netlink request failed
    #[error("Netlink error: {0}")]
    Netlink(String),
    /// Command execution failed
    #[error("Command '{cmd}' failed{}: {stderr}", code_suffix(.code))]
    CommandFailed { cmd: String, code: Option<i32>, stderr: String },
    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    /// Interface not found
    #[error("Interface not found: {0}")]
    InterfaceNotFound(String),
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),
    /// No DHCP lease arrived within the allowed wait
    #[error("Timed out waiting for DHCP lease on {interface} after {secs}s")]
    LeaseTimeout { interface: String, secs: u64 },
    /// Timeout
    #[error("Timeout: {0}")]
    Timeout(String),
    /// A routing invariant would be broken (e.g. table id collision)
    #[error("Invariant violation on {interface}: {reason}")]
    InvariantViolation { interface: String, reason: String },
    /// Internal channel closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
    /// Kernel interface visibility lost
    #[error("Netlink monitor degraded: {0}")]
    MonitorDegraded(String),
}

fn code_suffix(code: &Option<i32>) -> String {
    code.map(|c| format!(" with code {}", c)).unwrap_or_default()
}

impl From<serde_json::Error> for NetagentError {
    fn from(error: serde_json::Error) -> Self {
        NetagentError::Parse(error.to_string())
    }
}

impl From<rtnetlink::Error> for NetagentError {
    fn from(error: rtnetlink::Error) -> Self {
        NetagentError::Netlink(error.to_string())
    }
}

pub type NetagentResult<T> = Result<T, NetagentError>;
