//! Outward connectivity events and the supplicant signal

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use tokio::sync::broadcast;

use crate::error::NetagentError;
use crate::validation::sanitize_error_message;

/// Why an interface lost connectivity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LossReason {
    LinkDown,
    CarrierLost,
    SupplicantDisconnected,
    LeaseExpired,
    InterfaceRemoved,
}

impl fmt::Display for LossReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LossReason::LinkDown => "link-down",
            LossReason::CarrierLost => "carrier-lost",
            LossReason::SupplicantDisconnected => "supplicant-disconnected",
            LossReason::LeaseExpired => "lease-expired",
            LossReason::InterfaceRemoved => "interface-removed",
        };
        f.write_str(s)
    }
}

/// Events published on the external bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConnectivityEvent {
    Established {
        interface: String,
        address: Ipv4Addr,
        gateway: Ipv4Addr,
        timestamp: DateTime<Utc>,
    },
    Lost {
        interface: String,
        reason: LossReason,
        timestamp: DateTime<Utc>,
    },
    MonitorDegraded {
        timestamp: DateTime<Utc>,
    },
    MonitorRecovered {
        timestamp: DateTime<Utc>,
    },
    Error {
        interface: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl ConnectivityEvent {
    pub fn established(interface: &str, address: Ipv4Addr, gateway: Ipv4Addr) -> Self {
        ConnectivityEvent::Established {
            interface: interface.to_string(),
            address,
            gateway,
            timestamp: Utc::now(),
        }
    }

    pub fn lost(interface: &str, reason: LossReason) -> Self {
        ConnectivityEvent::Lost {
            interface: interface.to_string(),
            reason,
            timestamp: Utc::now(),
        }
    }

    /// Error report; long messages (e.g. client stderr) are truncated
    pub fn error(interface: &str, message: impl AsRef<str>) -> Self {
        ConnectivityEvent::Error {
            interface: interface.to_string(),
            message: sanitize_error_message(message.as_ref()),
            timestamp: Utc::now(),
        }
    }

    /// Interface the event concerns, if any
    pub fn interface(&self) -> Option<&str> {
        match self {
            ConnectivityEvent::Established { interface, .. }
            | ConnectivityEvent::Lost { interface, .. }
            | ConnectivityEvent::Error { interface, .. } => Some(interface),
            ConnectivityEvent::MonitorDegraded { .. } | ConnectivityEvent::MonitorRecovered { .. } => {
                None
            }
        }
    }
}

/// Broadcast bus for [`ConnectivityEvent`]s
///
/// Publishing never fails; with no subscribers the event is dropped.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ConnectivityEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ConnectivityEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Connectivity as reported by the wireless supplicant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupplicantState {
    Connected,
    Disconnected,
    Inactive,
    InterfaceDisabled,
}

impl SupplicantState {
    /// Association lost above the link layer
    pub fn is_disconnect(&self) -> bool {
        !matches!(self, SupplicantState::Connected)
    }
}

impl FromStr for SupplicantState {
    type Err = NetagentError;

    /// Accepts wpa_supplicant `wpa_state` names as well
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "connected" | "completed" => Ok(SupplicantState::Connected),
            "disconnected" => Ok(SupplicantState::Disconnected),
            "inactive" => Ok(SupplicantState::Inactive),
            "interface_disabled" | "interface-disabled" => Ok(SupplicantState::InterfaceDisabled),
            other => Err(NetagentError::InvalidParameter(format!(
                "unknown supplicant state: {}",
                other
            ))),
        }
    }
}
