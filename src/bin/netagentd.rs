//! Network Control Agent Daemon (netagentd)
//!
//! Wires the netlink monitor, DHCP lease manager, routing engine,
//! supplicant watchers and network control manager together and runs until
//! SIGTERM/SIGINT.
//!
//! # Usage
//!
//! ```bash
//! # Start the agent (requires root/CAP_NET_ADMIN)
//! sudo netagentd --config /etc/netagent/netagent.toml
//!
//! # Validate a configuration file and exit
//! netagentd --config ./netagent.toml --check-config
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use libnetagent::config::AgentConfig;
use libnetagent::dhcp_client::{DhcpLeaseManager, LeaseClient};
use libnetagent::events::{ConnectivityEvent, EventBus};
use libnetagent::interface::InterfaceController;
use libnetagent::interface::LinkSnapshot;
use libnetagent::manager::{ManagerHandle, NetworkControlManager};
use libnetagent::network_monitor::NetlinkMonitor;
use libnetagent::routing::RoutingEngine;
use libnetagent::supplicant::SupplicantWatcher;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_CONFIG: &str = "/etc/netagent/netagent.toml";
const EVENT_BUS_CAPACITY: usize = 256;

/// Network Control Agent Daemon
#[derive(Parser, Debug)]
#[command(name = "netagentd")]
#[command(version)]
#[command(about = "Network control agent - per-interface routing and DHCP coordination", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = load_config(args.config.as_deref())?;
    if args.check_config {
        println!("Configuration OK");
        return Ok(());
    }

    info!("Starting Network Control Agent (netagentd)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    #[cfg(target_os = "linux")]
    {
        let uid = unsafe { libc::getuid() };
        if uid != 0 {
            warn!("Not running as root - route and rule changes will fail");
        }
    }

    config.ensure_directories()?;

    // Monitor first so no link event between the dump and the subscription is lost
    let monitor = NetlinkMonitor::new(config.monitor.clone());
    monitor.start().context("failed to start netlink monitor")?;

    let engine = Arc::new(RoutingEngine::connect(config.routing.clone()).context("failed to open rtnetlink")?);

    let (lease_tx, lease_rx) = mpsc::unbounded_channel();
    let leases: Arc<dyn LeaseClient> = Arc::new(DhcpLeaseManager::new(config.dhcp.clone(), lease_tx));

    let bus = EventBus::new(EVENT_BUS_CAPACITY);
    tokio::spawn(log_events(bus.subscribe()));

    let links = match InterfaceController::new().list_links().await {
        Ok(links) => links,
        Err(e) => {
            warn!("Initial link dump failed, relying on the monitor: {}", e);
            Vec::new()
        }
    };
    info!("Found {} links", links.len());

    // Association changes reach the manager through wpa_cli polling
    let watcher = config.supplicant.enabled.then(|| SupplicantWatcher::new(config.supplicant.clone()));
    let wireless = wireless_links(&config, &links).await;

    let (manager, handle) = NetworkControlManager::new(config, engine, leases, lease_rx, monitor.events(), bus);
    let manager_task = tokio::spawn(manager.run(links));
    if let Some(watcher) = watcher {
        spawn_watchers(&watcher, wireless, &handle);
    }

    info!("Network Control Agent is ready");
    wait_for_signal().await?;

    info!("Shutting down Network Control Agent...");
    if let Err(e) = handle.shutdown().await {
        error!("Error during shutdown: {}", e);
    }
    monitor.stop();
    if let Err(e) = manager_task.await {
        error!("Manager task failed: {}", e);
    }

    info!("Network Control Agent stopped");
    Ok(())
}

/// Managed wireless interfaces present at startup
async fn wireless_links(config: &AgentConfig, links: &[LinkSnapshot]) -> Vec<String> {
    let controller = InterfaceController::new();
    let mut names = Vec::new();
    for link in links {
        if controller.is_wireless(&link.name).await && config.is_managed(&link.name, true) {
            names.push(link.name.clone());
        }
    }
    names
}

fn spawn_watchers(watcher: &SupplicantWatcher, interfaces: Vec<String>, handle: &ManagerHandle) {
    for interface in interfaces {
        watcher.spawn(interface, handle.clone());
    }
}

fn load_config(path: Option<&Path>) -> Result<AgentConfig> {
    match path {
        Some(path) => {
            AgentConfig::load(path).with_context(|| format!("invalid configuration {}", path.display()))
        }
        None if Path::new(DEFAULT_CONFIG).exists() => {
            AgentConfig::load(DEFAULT_CONFIG).with_context(|| format!("invalid configuration {}", DEFAULT_CONFIG))
        }
        None => {
            warn!("{} not found, using defaults", DEFAULT_CONFIG);
            Ok(AgentConfig::default())
        }
    }
}

/// Initialize logging based on command-line arguments
fn init_logging(args: &Args) {
    let log_level = if args.verbose { "debug" } else { &args.log_level };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "netagent={},netagentd={},libnetagent={}",
            log_level, log_level, log_level
        ))
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(atty::is(atty::Stream::Stdout))
        .init();
}

/// Log connectivity events as they are published
async fn log_events(mut events: broadcast::Receiver<ConnectivityEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => info!("event: {}", json),
                Err(e) => warn!("Unserializable event {:?}: {}", event, e),
            },
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("Event log skipped {} events", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Wait for SIGTERM or SIGINT; SIGHUP is logged and ignored
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("failed to register SIGHUP handler")?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
                return Ok(());
            }
            _ = sigint.recv() => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                return Ok(());
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, configuration reload requires a restart");
            }
        }
    }
}
