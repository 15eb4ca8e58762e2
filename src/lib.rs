//! netagent - Network Control Agent Library
//!
//! Async on-device network control for test hardware with several uplinks:
//! - Netlink link/address/route monitoring
//! - DHCP client supervision and lease tracking
//! - Per-interface routing tables and source rules
//! - wpa_supplicant association polling
//! - Interface lifecycle and connectivity events

pub mod config;
pub mod dhcp_client;
pub mod dhcp_lease;
pub mod error;
pub mod events;
pub mod interface;
pub mod manager;
pub mod network_monitor;
pub mod routing;
pub mod supplicant;
pub mod validation;

// Re-export commonly used types
pub use config::{AgentConfig, InterfacePolicy};
pub use dhcp_client::{DhcpLeaseManager, LeaseClient, LeaseEvent};
pub use dhcp_lease::{DhcpLease, LeaseDate};
pub use error::{NetagentError, NetagentResult};
pub use events::{ConnectivityEvent, EventBus, LossReason, SupplicantState};
pub use interface::{InterfaceController, InterfaceInfo, Ipv4Cidr, LifecycleState, LinkStatus};
pub use manager::{ManagerHandle, ManagerStatus, NetworkControlManager};
pub use network_monitor::{EventQueue, MonitorEvent, NetlinkMonitor};
pub use routing::{RoutingEngine, RoutingStatus};
pub use supplicant::SupplicantWatcher;
