//! Configuration management for netagent

use crate::error::{NetagentError, NetagentResult};
use crate::validation;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main netagent configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Routing engine tuning
    #[serde(default)]
    pub routing: RoutingSettings,
    /// DHCP client settings
    #[serde(default)]
    pub dhcp: DhcpSettings,
    /// Netlink monitor settings
    #[serde(default)]
    pub monitor: MonitorSettings,
    /// Manager settings
    #[serde(default)]
    pub manager: ManagerSettings,
    /// wpa_supplicant state polling
    #[serde(default)]
    pub supplicant: SupplicantSettings,
    /// Per-interface policy
    #[serde(default)]
    pub interfaces: Vec<InterfacePolicy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingSettings {
    /// Dedicated table id = table_base + ifindex
    #[serde(default = "default_table_base")]
    pub table_base: u32,
    /// Priority of the `from <addr> lookup <table>` rules
    #[serde(default = "default_rule_priority")]
    pub rule_priority: u32,
    /// Lowest metric the engine computes from
    #[serde(default = "default_metric_baseline")]
    pub metric_baseline: u32,
    /// Added on top of the highest existing main-table default metric
    #[serde(default = "default_metric_step")]
    pub metric_step: u32,
    /// Size of the declarative-path worker pool
    #[serde(default = "default_declarative_workers")]
    pub declarative_workers: usize,
    /// Per-attempt bound for a declarative job (ms)
    #[serde(default = "default_declarative_timeout_ms")]
    pub declarative_timeout_ms: u64,
    /// Total retry budget for a declarative job (ms)
    #[serde(default = "default_declarative_max_elapsed_ms")]
    pub declarative_max_elapsed_ms: u64,
    /// Delay before re-submitting an exhausted main-table job (s)
    #[serde(default = "default_main_table_retry_secs")]
    pub main_table_retry_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhcpSettings {
    /// DHCP client binary
    #[serde(default = "default_client_bin")]
    pub client_bin: PathBuf,
    /// Extra arguments placed before the generated ones
    #[serde(default)]
    pub client_args: Vec<String>,
    /// Directory for per-interface lease and pid files
    #[serde(default = "default_lease_dir")]
    pub lease_dir: PathBuf,
    /// Wait for the first lease (s)
    #[serde(default = "default_lease_timeout_secs")]
    pub lease_timeout_secs: u64,
    /// Grace period between SIGTERM and SIGKILL (ms)
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Lease file poll interval backing the file watcher (ms)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// Bounded event queue capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Fixed delay before recreating the netlink socket (ms)
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,
    /// Consecutive failures before the monitor reports itself degraded
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// A reopened socket that stays up this long without an error is healthy
    /// even if no message arrived (ms)
    #[serde(default = "default_stable_after_ms")]
    pub stable_after_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerSettings {
    /// Upper bound for one interface teardown (ms)
    #[serde(default = "default_teardown_timeout_ms")]
    pub teardown_timeout_ms: u64,
    /// Manage wireless interfaces that have no explicit policy
    #[serde(default = "default_manage_wireless")]
    pub manage_wireless: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupplicantSettings {
    /// Watch `wpa_state` of managed wireless interfaces
    #[serde(default = "default_supplicant_enabled")]
    pub enabled: bool,
    /// wpa_cli binary
    #[serde(default = "default_wpa_cli_bin")]
    pub cli_bin: PathBuf,
    #[serde(default = "default_supplicant_poll_ms")]
    pub poll_interval_ms: u64,
}

/// Policy for a single interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfacePolicy {
    /// Interface name
    pub name: String,
    /// Whether the agent manages this interface
    #[serde(default = "default_managed")]
    pub managed: bool,
    /// Static address in CIDR form; bypasses DHCP when set
    #[serde(default)]
    pub static_address: Option<String>,
    /// Static gateway used with `static_address`
    #[serde(default)]
    pub static_gateway: Option<Ipv4Addr>,
}

/// Parsed static override
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticOverride {
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
}

fn default_table_base() -> u32 {
    1000
}

fn default_rule_priority() -> u32 {
    10000
}

fn default_metric_baseline() -> u32 {
    1024
}

fn default_metric_step() -> u32 {
    100
}

fn default_declarative_workers() -> usize {
    2
}

fn default_declarative_timeout_ms() -> u64 {
    5000
}

fn default_declarative_max_elapsed_ms() -> u64 {
    20000
}

fn default_main_table_retry_secs() -> u64 {
    30
}

fn default_client_bin() -> PathBuf {
    PathBuf::from("/sbin/dhclient")
}

fn default_lease_dir() -> PathBuf {
    PathBuf::from("/var/lib/netagent")
}

fn default_lease_timeout_secs() -> u64 {
    30
}

fn default_stop_grace_ms() -> u64 {
    3000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_restart_backoff_ms() -> u64 {
    500
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_stable_after_ms() -> u64 {
    5000
}

fn default_supplicant_enabled() -> bool {
    true
}

fn default_wpa_cli_bin() -> PathBuf {
    PathBuf::from("/usr/sbin/wpa_cli")
}

fn default_supplicant_poll_ms() -> u64 {
    2000
}

fn default_teardown_timeout_ms() -> u64 {
    10000
}

fn default_manage_wireless() -> bool {
    true
}

fn default_managed() -> bool {
    true
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            table_base: default_table_base(),
            rule_priority: default_rule_priority(),
            metric_baseline: default_metric_baseline(),
            metric_step: default_metric_step(),
            declarative_workers: default_declarative_workers(),
            declarative_timeout_ms: default_declarative_timeout_ms(),
            declarative_max_elapsed_ms: default_declarative_max_elapsed_ms(),
            main_table_retry_secs: default_main_table_retry_secs(),
        }
    }
}

impl Default for DhcpSettings {
    fn default() -> Self {
        Self {
            client_bin: default_client_bin(),
            client_args: Vec::new(),
            lease_dir: default_lease_dir(),
            lease_timeout_secs: default_lease_timeout_secs(),
            stop_grace_ms: default_stop_grace_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            restart_backoff_ms: default_restart_backoff_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
            stable_after_ms: default_stable_after_ms(),
        }
    }
}

impl Default for SupplicantSettings {
    fn default() -> Self {
        Self {
            enabled: default_supplicant_enabled(),
            cli_bin: default_wpa_cli_bin(),
            poll_interval_ms: default_supplicant_poll_ms(),
        }
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            teardown_timeout_ms: default_teardown_timeout_ms(),
            manage_wireless: default_manage_wireless(),
        }
    }
}

impl RoutingSettings {
    pub fn declarative_timeout(&self) -> Duration {
        Duration::from_millis(self.declarative_timeout_ms)
    }

    pub fn declarative_max_elapsed(&self) -> Duration {
        Duration::from_millis(self.declarative_max_elapsed_ms)
    }

    pub fn main_table_retry(&self) -> Duration {
        Duration::from_secs(self.main_table_retry_secs)
    }
}

impl DhcpSettings {
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl MonitorSettings {
    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }

    pub fn stable_after(&self) -> Duration {
        Duration::from_millis(self.stable_after_ms)
    }
}

impl SupplicantSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl ManagerSettings {
    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }
}

impl InterfacePolicy {
    /// Parse the static override, if one is configured
    pub fn static_override(&self) -> NetagentResult<Option<StaticOverride>> {
        let (Some(address), Some(gateway)) = (&self.static_address, self.static_gateway) else {
            return Ok(None);
        };
        let (address, prefix_len) = validation::parse_ipv4_cidr(address)?;
        Ok(Some(StaticOverride { address, prefix_len, gateway }))
    }
}

impl AgentConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> NetagentResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| NetagentError::Config(format!("Failed to read config: {}", e)))?;

        let config: AgentConfig = toml::from_str(&content)
            .map_err(|e| NetagentError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> NetagentResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| NetagentError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| NetagentError::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> NetagentResult<()> {
        validation::validate_table_base(self.routing.table_base)?;
        validation::validate_rule_priority(self.routing.rule_priority)?;

        if self.routing.metric_step == 0 {
            return Err(NetagentError::Config("routing.metric_step must be positive".to_string()));
        }
        if self.routing.declarative_workers == 0 {
            return Err(NetagentError::Config(
                "routing.declarative_workers must be positive".to_string(),
            ));
        }
        if self.monitor.queue_capacity == 0 {
            return Err(NetagentError::Config("monitor.queue_capacity must be positive".to_string()));
        }
        if self.supplicant.poll_interval_ms == 0 {
            return Err(NetagentError::Config(
                "supplicant.poll_interval_ms must be positive".to_string(),
            ));
        }

        for policy in &self.interfaces {
            validation::validate_interface_name(&policy.name)
                .map_err(|e| NetagentError::Config(format!("interfaces: {}", e)))?;
            if policy.static_address.is_some() != policy.static_gateway.is_some() {
                return Err(NetagentError::Config(format!(
                    "interfaces.{}: static_address and static_gateway must be set together",
                    policy.name
                )));
            }
            policy
                .static_override()
                .map_err(|e| NetagentError::Config(format!("interfaces.{}: {}", policy.name, e)))?;
        }
        Ok(())
    }

    /// Explicit policy for an interface, if any
    pub fn policy(&self, name: &str) -> Option<&InterfacePolicy> {
        self.interfaces.iter().find(|p| p.name == name)
    }

    /// Whether an interface is managed; `is_wireless` decides unlisted ones
    pub fn is_managed(&self, name: &str, is_wireless: bool) -> bool {
        match self.policy(name) {
            Some(policy) => policy.managed,
            None => self.manager.manage_wireless && is_wireless,
        }
    }

    /// Ensure the lease directory exists
    pub fn ensure_directories(&self) -> NetagentResult<()> {
        std::fs::create_dir_all(&self.dhcp.lease_dir).map_err(|e| {
            NetagentError::Config(format!("Failed to create directory {:?}: {}", self.dhcp.lease_dir, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: AgentConfig = toml::from_str("").unwrap();
        assert_eq!(config, AgentConfig::default());
        assert_eq!(config.routing.table_base, 1000);
        assert_eq!(config.routing.rule_priority, 10000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_sections() {
        let config: AgentConfig = toml::from_str(
            r#"
            [routing]
            metric_step = 10

            [[interfaces]]
            name = "wlan1"
            static_address = "10.0.0.5/24"
            static_gateway = "10.0.0.1"
            "#,
        )
        .unwrap();

        assert_eq!(config.routing.metric_step, 10);
        assert_eq!(config.routing.metric_baseline, 1024);
        let policy = config.policy("wlan1").unwrap();
        assert!(policy.managed);
        let over = policy.static_override().unwrap().unwrap();
        assert_eq!(over.address, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(over.prefix_len, 24);
        assert_eq!(over.gateway, Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn test_managed_resolution() {
        let mut config = AgentConfig::default();
        config.interfaces.push(InterfacePolicy {
            name: "eth0".to_string(),
            managed: false,
            static_address: None,
            static_gateway: None,
        });

        assert!(!config.is_managed("eth0", false));
        assert!(config.is_managed("wlan0", true));
        assert!(!config.is_managed("eth1", false));

        config.manager.manage_wireless = false;
        assert!(!config.is_managed("wlan0", true));
    }

    #[test]
    fn test_validate_rejects_reserved_table_base() {
        let mut config = AgentConfig::default();
        config.routing.table_base = 200;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_half_static_override() {
        let mut config = AgentConfig::default();
        config.interfaces.push(InterfacePolicy {
            name: "wlan0".to_string(),
            managed: true,
            static_address: Some("10.0.0.5/24".to_string()),
            static_gateway: None,
        });
        assert!(config.validate().is_err());
    }
}
