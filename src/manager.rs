//! Network control manager
//!
//! A single dispatch task owns the interface registry. Every managed
//! interface gets its own worker task fed through a FIFO channel, so one
//! interface's events are handled strictly in order while different
//! interfaces progress concurrently. Workers run the lifecycle
//! `Discovered -> Acquiring -> Active -> Cleanup -> Discovered` and drive the
//! DHCP client and the routing engine.

use crate::config::{AgentConfig, InterfacePolicy, ManagerSettings};
use crate::dhcp_client::{self, LeaseClient, LeaseEvent};
use crate::dhcp_lease::{self, DhcpLease};
use crate::error::{NetagentError, NetagentResult};
use crate::events::{ConnectivityEvent, EventBus, LossReason, SupplicantState};
use crate::interface::{self, InterfaceController, InterfaceInfo, Ipv4Cidr, LifecycleState, LinkSnapshot, LinkStatus};
use crate::network_monitor::{EventQueue, MonitorEvent};
use crate::routing::{IntendedInterface, ManagedLink, RoutingEngine, MAIN_TABLE};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const WORKER_QUEUE: usize = 64;
const COMMAND_QUEUE: usize = 64;

/// Requests accepted by the manager
#[derive(Debug)]
pub enum ManagerCommand {
    Supplicant {
        interface: String,
        state: SupplicantState,
    },
    ConfigureInterface {
        name: String,
        force_dhcp: bool,
        reply: oneshot::Sender<NetagentResult<()>>,
    },
    RemoveInterface {
        name: String,
        reply: oneshot::Sender<NetagentResult<()>>,
    },
    Status {
        reply: oneshot::Sender<ManagerStatus>,
    },
    HostRoute {
        interface: String,
        host: Ipv4Addr,
        add: bool,
        reply: oneshot::Sender<NetagentResult<()>>,
    },
    RenewLease {
        interface: String,
        reply: oneshot::Sender<NetagentResult<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub degraded: bool,
    pub interfaces: Vec<InterfaceInfo>,
}

/// Cloneable handle for talking to a running manager
#[derive(Clone)]
pub struct ManagerHandle {
    tx: mpsc::Sender<ManagerCommand>,
}

impl ManagerHandle {
    /// Handle whose commands land in the returned receiver
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::Receiver<ManagerCommand>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        (Self { tx }, rx)
    }

    async fn send(&self, command: ManagerCommand) -> NetagentResult<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| NetagentError::ChannelClosed("manager".to_string()))
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand) -> NetagentResult<T> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply)).await?;
        rx.await.map_err(|_| NetagentError::ChannelClosed("manager reply".to_string()))
    }

    /// Report the supplicant's view of an interface
    pub async fn supplicant_state(&self, interface: &str, state: SupplicantState) -> NetagentResult<()> {
        self.send(ManagerCommand::Supplicant { interface: interface.to_string(), state }).await
    }

    /// Take an interface under management and (re)start acquisition
    pub async fn configure_interface(&self, name: &str, force_dhcp: bool) -> NetagentResult<()> {
        self.request(|reply| ManagerCommand::ConfigureInterface { name: name.to_string(), force_dhcp, reply })
            .await?
    }

    /// Tear an interface down and stop managing it
    pub async fn remove_interface(&self, name: &str) -> NetagentResult<()> {
        self.request(|reply| ManagerCommand::RemoveInterface { name: name.to_string(), reply })
            .await?
    }

    pub async fn status(&self) -> NetagentResult<ManagerStatus> {
        self.request(|reply| ManagerCommand::Status { reply }).await
    }

    pub async fn add_host_route(&self, interface: &str, host: Ipv4Addr) -> NetagentResult<()> {
        self.request(|reply| ManagerCommand::HostRoute { interface: interface.to_string(), host, add: true, reply })
            .await?
    }

    pub async fn remove_host_route(&self, interface: &str, host: Ipv4Addr) -> NetagentResult<()> {
        self.request(|reply| ManagerCommand::HostRoute { interface: interface.to_string(), host, add: false, reply })
            .await?
    }

    /// Ask the DHCP client of an active interface for a fresh lease
    ///
    /// The renewed lease is applied like any other lease update.
    pub async fn renew_lease(&self, interface: &str) -> NetagentResult<()> {
        self.request(|reply| ManagerCommand::RenewLease { interface: interface.to_string(), reply })
            .await?
    }

    /// Tear down every interface and stop the manager
    pub async fn shutdown(&self) -> NetagentResult<()> {
        self.request(|reply| ManagerCommand::Shutdown { reply }).await
    }
}

/// Per-interface worker input
#[derive(Debug)]
enum Input {
    LinkUp,
    LinkDown,
    CarrierAcquired,
    CarrierLost,
    LinkState(LinkStatus),
    AddressAdded(Ipv4Cidr),
    AddressRemoved(Ipv4Cidr),
    RouteRemoved { table_id: u32, default: bool },
    Lease(LeaseEvent),
    Supplicant(SupplicantState),
    Configure {
        force_dhcp: bool,
        reply: oneshot::Sender<NetagentResult<()>>,
    },
    HostRoute {
        host: Ipv4Addr,
        add: bool,
        reply: oneshot::Sender<NetagentResult<()>>,
    },
    Renew {
        reply: oneshot::Sender<NetagentResult<()>>,
    },
    /// Interface visibility is back; re-evaluate held acquisitions
    Resume,
    /// Tear down and exit
    Retire {
        reason: Option<LossReason>,
        reply: Option<oneshot::Sender<()>>,
    },
}

/// Address and gateway an active interface routes with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Binding {
    address: Ipv4Cidr,
    gateway: Ipv4Addr,
}

impl From<&DhcpLease> for Binding {
    fn from(lease: &DhcpLease) -> Self {
        Self { address: lease.cidr(), gateway: lease.gateway }
    }
}

enum Acquisition {
    Lease(DhcpLease),
    Failed(NetagentError),
    Interrupted,
}

struct Registered {
    name: String,
    tx: mpsc::Sender<Input>,
    snapshot: watch::Receiver<InterfaceInfo>,
    task: JoinHandle<()>,
}

/// Root actor
pub struct NetworkControlManager {
    config: AgentConfig,
    engine: Arc<RoutingEngine>,
    leases: Arc<dyn LeaseClient>,
    bus: EventBus,
    monitor: Arc<EventQueue>,
    lease_events: mpsc::UnboundedReceiver<LeaseEvent>,
    commands: mpsc::Receiver<ManagerCommand>,
    controller: InterfaceController,
    registry: HashMap<u32, Registered>,
    /// Links seen but not managed
    unmanaged: HashMap<u32, LinkSnapshot>,
    retiring: Vec<JoinHandle<()>>,
    degraded: watch::Sender<bool>,
}

impl NetworkControlManager {
    pub fn new(
        config: AgentConfig,
        engine: Arc<RoutingEngine>,
        leases: Arc<dyn LeaseClient>,
        lease_events: mpsc::UnboundedReceiver<LeaseEvent>,
        monitor: Arc<EventQueue>,
        bus: EventBus,
    ) -> (Self, ManagerHandle) {
        let (tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (degraded, _) = watch::channel(false);
        let manager = Self {
            config,
            engine,
            leases,
            bus,
            monitor,
            lease_events,
            commands,
            controller: InterfaceController::new(),
            registry: HashMap::new(),
            unmanaged: HashMap::new(),
            retiring: Vec::new(),
            degraded,
        };
        (manager, ManagerHandle { tx })
    }

    /// Reconcile leftover kernel state, then serve events until shutdown
    pub async fn run(mut self, initial_links: Vec<LinkSnapshot>) {
        self.startup(initial_links).await;

        let monitor = self.monitor.clone();
        let mut monitor_open = true;
        let mut leases_open = true;

        loop {
            tokio::select! {
                event = monitor.recv(), if monitor_open => match event {
                    Some(event) => self.on_monitor_event(event).await,
                    None => {
                        warn!("Monitor event queue closed");
                        monitor_open = false;
                    }
                },
                event = self.lease_events.recv(), if leases_open => match event {
                    Some(event) => self.on_lease_event(event).await,
                    None => leases_open = false,
                },
                command = self.commands.recv() => match command {
                    Some(ManagerCommand::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.on_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
            }
        }
        info!("Network control manager stopped");
    }

    async fn is_managed(&self, name: &str) -> bool {
        if let Some(policy) = self.config.policy(name) {
            return policy.managed;
        }
        let wireless = self.controller.is_wireless(name).await;
        self.config.is_managed(name, wireless)
    }

    async fn startup(&mut self, links: Vec<LinkSnapshot>) {
        let mut managed_links = Vec::new();
        for link in links {
            if self.is_managed(&link.name).await {
                managed_links.push(link);
            } else {
                self.unmanaged.insert(link.index, link);
            }
        }

        let managed: Vec<ManagedLink> = managed_links
            .iter()
            .map(|l| ManagedLink { name: l.name.clone(), if_index: l.index })
            .collect();
        let mut intended = Vec::new();
        for link in &managed_links {
            if let Some(binding) = self.previous_binding(link).await {
                intended.push(IntendedInterface {
                    name: link.name.clone(),
                    if_index: link.index,
                    address: binding.address,
                    gateway: binding.gateway,
                });
            }
        }

        match self.engine.reconcile_startup(&managed, &intended).await {
            Ok(report) => info!(
                "Reconciled routing state: {} adopted, {} removed",
                report.adopted, report.removed
            ),
            Err(e) => error!("Startup routing reconciliation failed: {}", e),
        }

        for link in managed_links {
            self.register(link);
        }
    }

    /// Binding the interface held before a restart, if it still holds it
    async fn previous_binding(&self, link: &LinkSnapshot) -> Option<Binding> {
        if let Some(over) = self.config.policy(&link.name).and_then(|p| p.static_override().ok().flatten()) {
            return Some(Binding {
                address: Ipv4Cidr::new(over.address, over.prefix_len),
                gateway: over.gateway,
            });
        }
        let path = dhcp_client::lease_file_in(&self.config.dhcp.lease_dir, &link.name);
        match dhcp_lease::read_lease_file(&path).await {
            Ok(Some(lease)) if !lease.is_expired(Utc::now()) && link.addresses.contains(&lease.cidr()) => {
                Some(Binding::from(&lease))
            }
            Ok(_) => None,
            Err(e) => {
                debug!("Ignoring previous lease of {}: {}", link.name, e);
                None
            }
        }
    }

    fn register(&mut self, link: LinkSnapshot) {
        let table_id = interface::table_id_for(self.config.routing.table_base, link.index).unwrap_or_default();
        let mut info = InterfaceInfo::new(link.index, link.name.clone(), table_id);
        info.mac_address = link.mac_address;
        info.link = link.link;
        info.addresses = link.addresses;

        let (tx, rx) = mpsc::channel(WORKER_QUEUE);
        let (snapshot_tx, snapshot) = watch::channel(info.clone());
        let worker = InterfaceWorker {
            info,
            policy: self.config.policy(&link.name).cloned(),
            settings: self.config.manager.clone(),
            main_table_retry: self.config.routing.main_table_retry(),
            engine: self.engine.clone(),
            leases: self.leases.clone(),
            bus: self.bus.clone(),
            degraded: self.degraded.subscribe(),
            snapshot: snapshot_tx,
            pending: None,
            main_job: None,
            binding: None,
            dhcp_running: false,
            client_exited: false,
            force_dhcp: false,
            faulted: false,
        };
        info!("Managing interface {} (index {})", link.name, link.index);
        let task = tokio::spawn(worker.run(rx));
        self.registry.insert(link.index, Registered { name: link.name, tx, snapshot, task });
    }

    async fn forward(&self, index: u32, input: Input) {
        if let Some(registered) = self.registry.get(&index) {
            if registered.tx.send(input).await.is_err() {
                warn!("Worker for {} is gone", registered.name);
            }
        }
    }

    fn index_of(&self, name: &str) -> Option<u32> {
        self.registry.iter().find(|(_, r)| r.name == name).map(|(i, _)| *i)
    }

    fn retire(&mut self, index: u32, reason: Option<LossReason>, reply: Option<oneshot::Sender<()>>) {
        if let Some(registered) = self.registry.remove(&index) {
            let Registered { name, tx, task, .. } = registered;
            // Queued behind the worker's backlog, off the dispatch task
            tokio::spawn(async move {
                if tx.send(Input::Retire { reason, reply }).await.is_err() {
                    warn!("Worker for {} is gone", name);
                }
            });
            self.retiring.push(task);
        }
        self.retiring.retain(|task| !task.is_finished());
    }

    async fn on_monitor_event(&mut self, event: MonitorEvent) {
        match event {
            MonitorEvent::LinkDiscovered { index, name, mac_address, link } => {
                if self.registry.contains_key(&index) {
                    self.forward(index, Input::LinkState(link)).await;
                } else if self.is_managed(&name).await {
                    self.unmanaged.remove(&index);
                    self.register(LinkSnapshot { index, name, mac_address, link, addresses: Vec::new() });
                } else {
                    debug!("Ignoring unmanaged interface {}", name);
                    self.unmanaged.insert(index, LinkSnapshot { index, name, mac_address, link, addresses: Vec::new() });
                }
            }
            MonitorEvent::LinkUp { index, .. } => {
                self.track_unmanaged(index, |l| l.admin_up = true);
                self.forward(index, Input::LinkUp).await;
            }
            MonitorEvent::LinkDown { index, .. } => {
                self.track_unmanaged(index, |l| l.admin_up = false);
                self.forward(index, Input::LinkDown).await;
            }
            MonitorEvent::CarrierAcquired { index, .. } => {
                self.track_unmanaged(index, |l| l.carrier = true);
                self.forward(index, Input::CarrierAcquired).await;
            }
            MonitorEvent::CarrierLost { index, .. } => {
                self.track_unmanaged(index, |l| l.carrier = false);
                self.forward(index, Input::CarrierLost).await;
            }
            MonitorEvent::AddressAdded { index, address } => {
                self.forward(index, Input::AddressAdded(address)).await;
            }
            MonitorEvent::AddressRemoved { index, address } => {
                self.forward(index, Input::AddressRemoved(address)).await;
            }
            MonitorEvent::RouteChanged { table_id, destination, if_index, removed } => {
                if !removed {
                    return;
                }
                let default = destination.prefix_len == 0;
                match if_index {
                    Some(index) => self.forward(index, Input::RouteRemoved { table_id, default }).await,
                    None => debug!("Route {} removed from table {}", destination, table_id),
                }
            }
            MonitorEvent::LinkRemoved { index, name } => {
                self.unmanaged.remove(&index);
                if self.registry.contains_key(&index) {
                    info!("Interface {} removed from the kernel", name);
                    self.retire(index, Some(LossReason::InterfaceRemoved), None);
                }
            }
            MonitorEvent::Gap { dropped } => {
                warn!("Monitor dropped {} events, resynchronizing link state", dropped);
                self.resync_links().await;
            }
            MonitorEvent::Degraded { failures } => {
                error!(
                    "Interface visibility lost after {} monitor failures, holding new acquisitions",
                    failures
                );
                self.degraded.send_replace(true);
                self.bus.publish(ConnectivityEvent::MonitorDegraded { timestamp: Utc::now() });
            }
            MonitorEvent::Recovered => {
                info!("Interface visibility restored");
                self.degraded.send_replace(false);
                self.bus.publish(ConnectivityEvent::MonitorRecovered { timestamp: Utc::now() });
                let indexes: Vec<u32> = self.registry.keys().copied().collect();
                for index in indexes {
                    self.forward(index, Input::Resume).await;
                }
            }
        }
    }

    fn track_unmanaged(&mut self, index: u32, update: impl FnOnce(&mut LinkStatus)) {
        if let Some(link) = self.unmanaged.get_mut(&index) {
            update(&mut link.link);
        }
    }

    async fn resync_links(&mut self) {
        let links = match self.controller.list_links().await {
            Ok(links) => links,
            Err(e) => {
                warn!("Failed to list links for resync: {}", e);
                return;
            }
        };
        for link in links {
            if self.registry.contains_key(&link.index) {
                self.forward(link.index, Input::LinkState(link.link)).await;
            } else if let Some(known) = self.unmanaged.get_mut(&link.index) {
                known.link = link.link;
            }
        }
    }

    async fn on_lease_event(&mut self, event: LeaseEvent) {
        match self.index_of(event.interface()) {
            Some(index) => self.forward(index, Input::Lease(event)).await,
            None => debug!("Lease event for unmanaged interface {}", event.interface()),
        }
    }

    async fn on_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::Supplicant { interface, state } => match self.index_of(&interface) {
                Some(index) => self.forward(index, Input::Supplicant(state)).await,
                None => debug!("Supplicant state {:?} for unmanaged interface {}", state, interface),
            },
            ManagerCommand::ConfigureInterface { name, force_dhcp, reply } => {
                if self.index_of(&name).is_none() {
                    let found = self.unmanaged.iter().find(|(_, l)| l.name == name).map(|(i, _)| *i);
                    match found.and_then(|index| self.unmanaged.remove(&index)) {
                        Some(link) => self.register(link),
                        None => {
                            let _ = reply.send(Err(NetagentError::InterfaceNotFound(name)));
                            return;
                        }
                    }
                }
                if let Some(index) = self.index_of(&name) {
                    self.forward(index, Input::Configure { force_dhcp, reply }).await;
                }
            }
            ManagerCommand::RemoveInterface { name, reply } => {
                let Some(index) = self.index_of(&name) else {
                    let _ = reply.send(Err(NetagentError::InterfaceNotFound(name)));
                    return;
                };
                let snapshot = self.registry.get(&index).map(|r| r.snapshot.borrow().clone());
                let (done_tx, done_rx) = oneshot::channel();
                self.retire(index, Some(LossReason::InterfaceRemoved), Some(done_tx));
                if let Some(info) = snapshot {
                    self.unmanaged.insert(
                        index,
                        LinkSnapshot {
                            index,
                            name: info.name,
                            mac_address: info.mac_address,
                            link: info.link,
                            addresses: info.addresses,
                        },
                    );
                }
                // Reply once teardown finished without holding up dispatch
                tokio::spawn(async move {
                    let _ = done_rx.await;
                    let _ = reply.send(Ok(()));
                });
            }
            ManagerCommand::Status { reply } => {
                let mut interfaces: Vec<InterfaceInfo> =
                    self.registry.values().map(|r| r.snapshot.borrow().clone()).collect();
                interfaces.sort_by_key(|i| i.index);
                let _ = reply.send(ManagerStatus { degraded: *self.degraded.borrow(), interfaces });
            }
            ManagerCommand::HostRoute { interface, host, add, reply } => match self.index_of(&interface) {
                Some(index) => self.forward(index, Input::HostRoute { host, add, reply }).await,
                None => {
                    let _ = reply.send(Err(NetagentError::InterfaceNotFound(interface)));
                }
            },
            ManagerCommand::RenewLease { interface, reply } => match self.index_of(&interface) {
                Some(index) => self.forward(index, Input::Renew { reply }).await,
                None => {
                    let _ = reply.send(Err(NetagentError::InterfaceNotFound(interface)));
                }
            },
            ManagerCommand::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
            }
        }
    }

    async fn shutdown(&mut self) {
        info!("Shutting down network control manager");
        let mut waits = Vec::new();
        for registered in self.registry.values() {
            let (tx, rx) = oneshot::channel();
            if registered
                .tx
                .send(Input::Retire { reason: None, reply: Some(tx) })
                .await
                .is_ok()
            {
                waits.push((registered.name.clone(), rx));
            }
        }

        let bound = self.config.manager.teardown_timeout() * 2;
        for (name, rx) in waits {
            if tokio::time::timeout(bound, rx).await.is_err() {
                warn!("Teardown of {} did not finish in time", name);
            }
        }
        for registered in self.registry.drain().map(|(_, r)| r) {
            registered.task.abort();
        }
        for task in self.retiring.drain(..) {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }

        self.leases.shutdown().await;
        self.engine.shutdown().await;
    }
}

/// Lifecycle of one interface
struct InterfaceWorker {
    info: InterfaceInfo,
    policy: Option<InterfacePolicy>,
    settings: ManagerSettings,
    main_table_retry: Duration,
    engine: Arc<RoutingEngine>,
    leases: Arc<dyn LeaseClient>,
    bus: EventBus,
    degraded: watch::Receiver<bool>,
    snapshot: watch::Sender<InterfaceInfo>,
    /// Input that interrupted an acquisition, handled next
    pending: Option<Input>,
    main_job: Option<JoinHandle<()>>,
    binding: Option<Binding>,
    dhcp_running: bool,
    client_exited: bool,
    force_dhcp: bool,
    /// Invariant violation: no acquisitions until reconfigured
    faulted: bool,
}

impl InterfaceWorker {
    fn name(&self) -> &str {
        &self.info.name
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Input>) {
        loop {
            let input = match self.pending.take() {
                Some(input) => input,
                None => match rx.recv().await {
                    Some(input) => input,
                    None => Input::Retire { reason: None, reply: None },
                },
            };
            if let Input::Retire { reason, reply } = input {
                self.cleanup(reason).await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                break;
            }
            self.handle(input, &mut rx).await;
        }
        debug!("Worker for {} finished", self.name());
    }

    fn set_state(&mut self, state: LifecycleState) {
        if self.info.state != state {
            info!("{}: {} -> {}", self.info.name, self.info.state, state);
            self.info.state = state;
        }
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(self.info.clone());
    }

    fn is_engaged(&self) -> bool {
        matches!(self.info.state, LifecycleState::Acquiring | LifecycleState::Active)
    }

    /// Cleanup trigger carried by an input, if any
    fn loss_reason(&self, input: &Input) -> Option<LossReason> {
        match input {
            Input::LinkDown => Some(LossReason::LinkDown),
            Input::CarrierLost => Some(LossReason::CarrierLost),
            Input::LinkState(status) if self.info.link.admin_up && !status.admin_up => Some(LossReason::LinkDown),
            Input::LinkState(status) if self.info.link.carrier && !status.carrier => Some(LossReason::CarrierLost),
            Input::Supplicant(state) if state.is_disconnect() => Some(LossReason::SupplicantDisconnected),
            Input::Lease(LeaseEvent::Expired { .. }) => Some(LossReason::LeaseExpired),
            _ => None,
        }
    }

    fn apply_link(&mut self, input: &Input) {
        match input {
            Input::LinkUp => self.info.link.admin_up = true,
            Input::LinkDown => self.info.link.admin_up = false,
            Input::CarrierAcquired => self.info.link.carrier = true,
            Input::CarrierLost => self.info.link.carrier = false,
            Input::LinkState(status) => self.info.link = *status,
            Input::AddressAdded(address) => {
                if !self.info.addresses.contains(address) {
                    self.info.addresses.push(*address);
                }
            }
            Input::AddressRemoved(address) => self.info.addresses.retain(|a| a != address),
            _ => return,
        }
        self.publish_snapshot();
    }

    async fn handle(&mut self, input: Input, rx: &mut mpsc::Receiver<Input>) {
        let reason = self.loss_reason(&input);
        self.apply_link(&input);

        if let Some(reason) = reason {
            if self.is_engaged() {
                self.cleanup(Some(reason)).await;
            }
            return;
        }

        match input {
            Input::LinkUp
            | Input::CarrierAcquired
            | Input::LinkState(_)
            | Input::Supplicant(_)
            | Input::Resume => {
                if self.info.state == LifecycleState::Active && self.client_exited {
                    self.restart_client(rx).await;
                } else {
                    self.maybe_acquire(rx).await;
                }
            }
            Input::Lease(LeaseEvent::Updated(lease)) => self.renewed(lease).await,
            Input::Lease(LeaseEvent::ClientExited { code, .. }) => {
                self.dhcp_running = false;
                if self.info.state == LifecycleState::Active {
                    warn!(
                        "DHCP client on {} exited (code {:?}); restarting on the next link event",
                        self.info.name, code
                    );
                    self.client_exited = true;
                }
            }
            Input::RouteRemoved { table_id, default } => self.route_removed(table_id, default).await,
            Input::Configure { force_dhcp, reply } => {
                self.faulted = false;
                self.force_dhcp = force_dhcp;
                if self.info.state == LifecycleState::Discovered && *self.degraded.borrow() {
                    // Still managed; acquisition starts once visibility returns
                    let _ = reply.send(Err(NetagentError::MonitorDegraded(format!(
                        "{} held until interface visibility returns",
                        self.info.name
                    ))));
                    return;
                }
                let _ = reply.send(Ok(()));
                if self.info.state == LifecycleState::Active && self.client_exited {
                    self.restart_client(rx).await;
                } else {
                    self.maybe_acquire(rx).await;
                }
            }
            Input::HostRoute { host, add, reply } => {
                let result = if self.info.state != LifecycleState::Active {
                    Err(NetagentError::InvalidParameter(format!("{} is not active", self.info.name)))
                } else if add {
                    self.engine.add_host_route(&self.info.name, host).await
                } else {
                    self.engine.remove_host_route(&self.info.name, host).await
                };
                let _ = reply.send(result);
            }
            Input::Renew { reply } => {
                let result = self.renew_lease().await;
                let _ = reply.send(result);
            }
            _ => {}
        }
    }

    async fn renew_lease(&mut self) -> NetagentResult<()> {
        if self.info.state != LifecycleState::Active {
            return Err(NetagentError::InvalidParameter(format!("{} is not active", self.info.name)));
        }
        if self.info.lease.is_none() {
            return Err(NetagentError::InvalidParameter(format!(
                "{} uses a static address",
                self.info.name
            )));
        }
        info!("Renewing DHCP lease on {}", self.info.name);
        self.leases.renew(&self.info.name).await?;
        self.dhcp_running = true;
        self.client_exited = false;
        Ok(())
    }

    fn static_binding(&self) -> Option<Binding> {
        if self.force_dhcp {
            return None;
        }
        let policy = self.policy.as_ref()?;
        match policy.static_override() {
            Ok(Some(over)) => Some(Binding {
                address: Ipv4Cidr::new(over.address, over.prefix_len),
                gateway: over.gateway,
            }),
            Ok(None) => None,
            Err(e) => {
                warn!("Ignoring static override of {}: {}", policy.name, e);
                None
            }
        }
    }

    async fn maybe_acquire(&mut self, rx: &mut mpsc::Receiver<Input>) {
        if self.info.state != LifecycleState::Discovered || !self.info.link.is_usable() || self.faulted {
            return;
        }
        if *self.degraded.borrow() {
            warn!("Not acquiring {} while interface visibility is degraded", self.info.name);
            return;
        }

        if let Some(binding) = self.static_binding() {
            info!("{}: using static address {} via {}", self.info.name, binding.address, binding.gateway);
            self.activate(binding, None).await;
            return;
        }

        self.set_state(LifecycleState::Acquiring);
        self.dhcp_running = true;
        match self.await_lease(rx).await {
            Acquisition::Lease(lease) => {
                let binding = Binding::from(&lease);
                self.activate(binding, Some(lease)).await;
            }
            Acquisition::Failed(e) => {
                warn!("Lease acquisition on {} failed: {}", self.info.name, e);
                self.bus.publish(ConnectivityEvent::error(&self.info.name, e.to_string()));
                if let Err(e) = self.leases.stop(&self.info.name).await {
                    warn!("Failed to stop DHCP client on {}: {}", self.info.name, e);
                }
                self.dhcp_running = false;
                self.set_state(LifecycleState::Discovered);
            }
            // The interrupting input is in `pending`
            Acquisition::Interrupted => {}
        }
    }

    /// Wait for a lease while still serving the interface's queue
    ///
    /// A cleanup trigger cancels the wait and is left in `pending`.
    async fn await_lease(&mut self, rx: &mut mpsc::Receiver<Input>) -> Acquisition {
        let leases = self.leases.clone();
        let name = self.info.name.clone();
        let start = async move { leases.start(&name).await };
        tokio::pin!(start);

        loop {
            tokio::select! {
                result = &mut start => {
                    return match result {
                        Ok(lease) => Acquisition::Lease(lease),
                        Err(e) => Acquisition::Failed(e),
                    };
                }
                input = rx.recv() => {
                    let input = input.unwrap_or(Input::Retire { reason: None, reply: None });
                    if matches!(input, Input::Retire { .. }) || self.loss_reason(&input).is_some() {
                        debug!("Acquisition on {} interrupted by {:?}", self.info.name, input);
                        self.pending = Some(input);
                        return Acquisition::Interrupted;
                    }
                    self.absorb(input);
                }
            }
        }
    }

    /// Handle an input that arrives mid-acquisition without interrupting it
    fn absorb(&mut self, input: Input) {
        self.apply_link(&input);
        match input {
            Input::Configure { force_dhcp, reply } => {
                self.force_dhcp = force_dhcp;
                let _ = reply.send(Ok(()));
            }
            Input::HostRoute { reply, .. } | Input::Renew { reply } => {
                let _ = reply.send(Err(NetagentError::InvalidParameter(format!(
                    "{} is still acquiring",
                    self.info.name
                ))));
            }
            other => debug!("{}: deferred {:?} during acquisition", self.info.name, other),
        }
    }

    async fn apply_routes(&self, binding: Binding) -> NetagentResult<u32> {
        let name = &self.info.name;
        let table_id = self
            .engine
            .apply_dedicated_route(name, self.info.index, binding.address, binding.gateway)
            .await?;
        self.engine.ensure_rule(name, binding.address.address).await?;
        Ok(table_id)
    }

    async fn activate(&mut self, binding: Binding, lease: Option<DhcpLease>) {
        match self.apply_routes(binding).await {
            Ok(table_id) => {
                self.info.table_id = table_id;
                self.info.gateway = Some(binding.gateway);
                self.info.lease = lease;
                self.binding = Some(binding);
                self.client_exited = false;
                self.set_state(LifecycleState::Active);
                self.bus.publish(ConnectivityEvent::established(
                    &self.info.name,
                    binding.address.address,
                    binding.gateway,
                ));
                self.spawn_main_table_job(binding.gateway).await;
            }
            Err(e) => {
                error!("Failed to route {}: {}", self.info.name, e);
                if matches!(e, NetagentError::InvariantViolation { .. }) {
                    self.faulted = true;
                }
                self.bus.publish(ConnectivityEvent::error(&self.info.name, e.to_string()));
                self.teardown().await;
                self.set_state(LifecycleState::Discovered);
            }
        }
    }

    async fn renewed(&mut self, lease: DhcpLease) {
        if self.info.state != LifecycleState::Active {
            debug!("Ignoring lease update for {} in state {}", self.info.name, self.info.state);
            return;
        }
        let binding = Binding::from(&lease);
        let changed = self.binding != Some(binding);
        self.info.lease = Some(lease);

        if changed {
            info!("{}: lease changed to {} via {}, re-applying", self.info.name, binding.address, binding.gateway);
            // A retrying job for the old gateway must not hold the interface lock
            self.stop_main_table_job().await;
            match self.apply_routes(binding).await {
                Ok(_) => {
                    self.binding = Some(binding);
                    self.info.gateway = Some(binding.gateway);
                    self.spawn_main_table_job(binding.gateway).await;
                }
                Err(e) => {
                    error!("Failed to re-apply routing for {}: {}", self.info.name, e);
                    self.bus.publish(ConnectivityEvent::error(&self.info.name, e.to_string()));
                    if let Some(previous) = self.binding {
                        self.spawn_main_table_job(previous.gateway).await;
                    }
                }
            }
        }
        self.publish_snapshot();
    }

    /// Bring back the client of an active interface after it exited
    async fn restart_client(&mut self, rx: &mut mpsc::Receiver<Input>) {
        if !self.info.link.is_usable() {
            return;
        }
        info!("Restarting DHCP client on {}", self.info.name);
        // Clear the exited client's slot so start spawns a fresh one
        if let Err(e) = self.leases.stop(&self.info.name).await {
            warn!("Failed to clear DHCP client state on {}: {}", self.info.name, e);
        }
        self.dhcp_running = true;
        match self.await_lease(rx).await {
            Acquisition::Lease(lease) => {
                self.client_exited = false;
                self.renewed(lease).await;
            }
            Acquisition::Failed(e) => {
                warn!("DHCP client restart on {} failed: {}", self.info.name, e);
                self.dhcp_running = false;
            }
            Acquisition::Interrupted => {}
        }
    }

    /// Kernel removed one of the routes this interface depends on
    async fn route_removed(&mut self, table_id: u32, default: bool) {
        let Some(binding) = self.binding.filter(|_| self.info.state == LifecycleState::Active) else {
            return;
        };
        if table_id == self.info.table_id {
            warn!("Route removed from table {} of {}, re-applying", table_id, self.info.name);
            self.stop_main_table_job().await;
            if let Err(e) = self.apply_routes(binding).await {
                error!("Failed to re-apply routing for {}: {}", self.info.name, e);
            }
            self.spawn_main_table_job(binding.gateway).await;
        } else if table_id == MAIN_TABLE && default {
            let job_running = self.main_job.as_ref().is_some_and(|job| !job.is_finished());
            if !job_running {
                self.spawn_main_table_job(binding.gateway).await;
            }
        }
    }

    async fn stop_main_table_job(&mut self) {
        if let Some(job) = self.main_job.take() {
            job.abort();
            let _ = job.await;
        }
    }

    /// Apply the main-table default off the interface's queue
    ///
    /// After the declarative path gives up, the job sleeps and tries again
    /// for as long as the interface stays active.
    async fn spawn_main_table_job(&mut self, gateway: Ipv4Addr) {
        self.stop_main_table_job().await;
        let engine = self.engine.clone();
        let bus = self.bus.clone();
        let name = self.info.name.clone();
        let retry = self.main_table_retry;

        self.main_job = Some(tokio::spawn(async move {
            loop {
                match engine.apply_main_table_default(&name, gateway).await {
                    Ok(entry) => {
                        debug!("{}: main-table default at metric {}", name, entry.metric);
                        return;
                    }
                    Err(e) => {
                        warn!(
                            "{}: main-table default not applied ({}), staying on dedicated table; retrying in {:?}",
                            name, e, retry
                        );
                        bus.publish(ConnectivityEvent::error(&name, format!("main-table default: {}", e)));
                        tokio::time::sleep(retry).await;
                    }
                }
            }
        }));
    }

    /// Stop the client and remove routing state, bounded in time
    async fn teardown(&mut self) {
        self.stop_main_table_job().await;
        let name = self.info.name.clone();
        let bound = self.settings.teardown_timeout();
        let stop_client = self.dhcp_running || self.info.lease.is_some();

        let leases = self.leases.clone();
        let engine = self.engine.clone();
        let (stopped, removed) = tokio::join!(
            tokio::time::timeout(bound, async {
                if stop_client {
                    leases.stop(&name).await
                } else {
                    Ok(())
                }
            }),
            tokio::time::timeout(bound, engine.remove_all(&name)),
        );

        match stopped {
            Ok(Err(e)) => warn!("Failed to stop DHCP client on {}: {}", name, e),
            Err(_) => warn!("Stopping DHCP client on {} timed out", name),
            Ok(Ok(())) => {}
        }
        match removed {
            Ok(Err(e)) => error!("Routing cleanup of {} incomplete: {}", name, e),
            Err(_) => error!("Routing cleanup of {} timed out", name),
            Ok(Ok(())) => {}
        }
        self.dhcp_running = false;
    }

    async fn cleanup(&mut self, reason: Option<LossReason>) {
        let was_engaged = self.is_engaged();
        self.set_state(LifecycleState::Cleanup);
        self.teardown().await;

        self.info.lease = None;
        self.info.gateway = None;
        self.binding = None;
        self.client_exited = false;
        self.set_state(LifecycleState::Discovered);

        if let Some(reason) = reason {
            if was_engaged {
                info!("{}: connectivity lost ({})", self.info.name, reason);
                self.bus.publish(ConnectivityEvent::lost(&self.info.name, reason));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutingSettings;
    use crate::dhcp_lease::LeaseDate;
    use crate::routing::mocks::MockKernel;
    use crate::routing::{RouteSpec, RuleSpec};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::broadcast;

    fn ip(a: u8, b: u8, c: u8, d: u8) -> Ipv4Addr {
        Ipv4Addr::new(a, b, c, d)
    }

    fn lease(interface: &str, address: Ipv4Addr, gateway: Ipv4Addr) -> DhcpLease {
        DhcpLease {
            interface: interface.to_string(),
            address,
            prefix_len: 24,
            gateway,
            dns_servers: vec![gateway],
            lease_time: Some(3600),
            server: Some(gateway),
            renew: LeaseDate::Never,
            rebind: LeaseDate::Never,
            expire: LeaseDate::Never,
        }
    }

    /// Lease client that hands out canned leases; unknown interfaces wait forever
    #[derive(Default)]
    struct FakeLeases {
        leases: StdMutex<HashMap<String, DhcpLease>>,
        started: StdMutex<Vec<String>>,
        stopped: StdMutex<Vec<String>>,
        renewed: StdMutex<Vec<String>>,
        stop_delay: StdMutex<Option<Duration>>,
    }

    impl FakeLeases {
        fn with(self, lease: DhcpLease) -> Self {
            self.leases.lock().unwrap().insert(lease.interface.clone(), lease);
            self
        }

        /// Client that takes `delay` to stop
        fn stalling_stop(self, delay: Duration) -> Self {
            *self.stop_delay.lock().unwrap() = Some(delay);
            self
        }

        fn started(&self) -> Vec<String> {
            self.started.lock().unwrap().clone()
        }

        fn stopped(&self) -> Vec<String> {
            self.stopped.lock().unwrap().clone()
        }

        fn renewed(&self) -> Vec<String> {
            self.renewed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LeaseClient for FakeLeases {
        async fn start(&self, interface: &str) -> NetagentResult<DhcpLease> {
            self.started.lock().unwrap().push(interface.to_string());
            let lease = self.leases.lock().unwrap().get(interface).cloned();
            match lease {
                Some(lease) => Ok(lease),
                None => std::future::pending().await,
            }
        }

        async fn stop(&self, interface: &str) -> NetagentResult<()> {
            self.stopped.lock().unwrap().push(interface.to_string());
            let delay = *self.stop_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(())
        }

        async fn renew(&self, interface: &str) -> NetagentResult<()> {
            self.renewed.lock().unwrap().push(interface.to_string());
            Ok(())
        }
    }

    struct Harness {
        kernel: MockKernel,
        leases: Arc<FakeLeases>,
        queue: Arc<EventQueue>,
        lease_tx: mpsc::UnboundedSender<LeaseEvent>,
        handle: ManagerHandle,
        events: broadcast::Receiver<ConnectivityEvent>,
        task: JoinHandle<()>,
    }

    fn policy(name: &str, managed: bool) -> InterfacePolicy {
        InterfacePolicy { name: name.to_string(), managed, static_address: None, static_gateway: None }
    }

    fn test_config() -> AgentConfig {
        let mut config = AgentConfig::default();
        config.routing = RoutingSettings {
            declarative_timeout_ms: 100,
            declarative_max_elapsed_ms: 400,
            main_table_retry_secs: 1,
            ..RoutingSettings::default()
        };
        config.manager.teardown_timeout_ms = 2000;
        config.dhcp.lease_dir = std::env::temp_dir().join("netagent-manager-tests");
        config.interfaces = vec![policy("eth0", false), policy("wlan0", true), policy("wlan1", true)];
        config
    }

    /// eth0 state the manager must leave alone
    fn seed_foreign(kernel: &MockKernel) {
        kernel.seed_route(RouteSpec::default_via(ip(192, 168, 1, 1), 2, MAIN_TABLE).with_metric(100));
        kernel.seed_route(RouteSpec::default_via(ip(192, 168, 1, 1), 2, 1002));
        kernel.seed_rule(RuleSpec::from_address(ip(192, 168, 1, 50), 1002, 500));
    }

    fn start(config: AgentConfig, leases: FakeLeases) -> Harness {
        let kernel = MockKernel::new();
        seed_foreign(&kernel);
        let engine = Arc::new(RoutingEngine::new(
            config.routing.clone(),
            Arc::new(kernel.clone()),
            Arc::new(kernel.declarative()),
        ));
        let leases = Arc::new(leases);
        let queue = Arc::new(EventQueue::new(256));
        let (lease_tx, lease_rx) = mpsc::unbounded_channel();
        let bus = EventBus::new(64);
        let events = bus.subscribe();
        let (manager, handle) =
            NetworkControlManager::new(config, engine, leases.clone(), lease_rx, queue.clone(), bus);
        let task = tokio::spawn(manager.run(Vec::new()));
        Harness { kernel, leases, queue, lease_tx, handle, events, task }
    }

    fn bring_up(queue: &EventQueue, index: u32, name: &str) {
        queue.push(MonitorEvent::LinkDiscovered {
            index,
            name: name.to_string(),
            mac_address: None,
            link: LinkStatus::default(),
        });
        queue.push(MonitorEvent::LinkUp { index, name: name.to_string() });
        queue.push(MonitorEvent::CarrierAcquired { index, name: name.to_string() });
    }

    async fn next_event(events: &mut broadcast::Receiver<ConnectivityEvent>) -> ConnectivityEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no connectivity event")
            .unwrap()
    }

    /// Skip `Error` events (main-table retries) until the next lifecycle event
    async fn next_lifecycle(events: &mut broadcast::Receiver<ConnectivityEvent>) -> ConnectivityEvent {
        loop {
            let event = next_event(events).await;
            if !matches!(event, ConnectivityEvent::Error { .. }) {
                return event;
            }
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn wait_for_state(handle: &ManagerHandle, name: &str, state: LifecycleState) -> ManagerStatus {
        for _ in 0..500 {
            let status = handle.status().await.unwrap();
            if status.interfaces.iter().any(|i| i.name == name && i.state == state) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never reached {}", name, state);
    }

    fn foreign_state(kernel: &MockKernel) -> (Vec<RouteSpec>, Vec<RuleSpec>) {
        let routes = kernel.state.lock().unwrap().routes.iter().filter(|r| r.if_index == 2).cloned().collect();
        let rules = kernel.rules().into_iter().filter(|r| r.table_id == 1002).collect();
        (routes, rules)
    }

    #[tokio::test]
    async fn test_link_up_acquires_and_routes() {
        let leases = FakeLeases::default().with(lease("wlan0", ip(10, 0, 0, 5), ip(10, 0, 0, 1)));
        let mut h = start(test_config(), leases);
        bring_up(&h.queue, 3, "wlan0");

        match next_lifecycle(&mut h.events).await {
            ConnectivityEvent::Established { interface, address, gateway, .. } => {
                assert_eq!(interface, "wlan0");
                assert_eq!(address, ip(10, 0, 0, 5));
                assert_eq!(gateway, ip(10, 0, 0, 1));
            }
            other => panic!("unexpected {:?}", other),
        }

        let defaults: Vec<_> = h.kernel.routes_in(1003).into_iter().filter(|r| r.is_default()).collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].gateway, Some(ip(10, 0, 0, 1)));
        assert!(h.kernel.rules().contains(&RuleSpec::from_address(ip(10, 0, 0, 5), 1003, 10000)));

        let kernel = h.kernel.clone();
        wait_until(|| kernel.main_defaults().iter().any(|r| r.if_index == 3)).await;
        let ours = h.kernel.main_defaults().into_iter().find(|r| r.if_index == 3).unwrap();
        assert!(ours.metric >= 101);

        let status = h.handle.status().await.unwrap();
        assert_eq!(status.interfaces.len(), 1);
        assert_eq!(status.interfaces[0].state, LifecycleState::Active);
        assert_eq!(status.interfaces[0].table_id, 1003);
        assert_eq!(h.leases.started(), vec!["wlan0".to_string()]);

        h.handle.shutdown().await.unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_supplicant_disconnect_cleans_up() {
        let leases = FakeLeases::default().with(lease("wlan0", ip(10, 0, 0, 5), ip(10, 0, 0, 1)));
        let mut h = start(test_config(), leases);
        let foreign = foreign_state(&h.kernel);
        bring_up(&h.queue, 3, "wlan0");
        assert!(matches!(next_lifecycle(&mut h.events).await, ConnectivityEvent::Established { .. }));
        let kernel = h.kernel.clone();
        wait_until(|| kernel.main_defaults().iter().any(|r| r.if_index == 3)).await;

        h.handle.supplicant_state("wlan0", SupplicantState::Disconnected).await.unwrap();
        match next_lifecycle(&mut h.events).await {
            ConnectivityEvent::Lost { interface, reason, .. } => {
                assert_eq!(interface, "wlan0");
                assert_eq!(reason, LossReason::SupplicantDisconnected);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(h.leases.stopped(), vec!["wlan0".to_string()]);
        assert!(h.kernel.routes_in(1003).is_empty());
        assert!(h.kernel.rules().iter().all(|r| r.table_id != 1003));
        assert!(h.kernel.main_defaults().iter().all(|r| r.if_index != 3));
        assert_eq!(foreign_state(&h.kernel), foreign);

        let status = h.handle.status().await.unwrap();
        assert_eq!(status.interfaces[0].state, LifecycleState::Discovered);
        h.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_interfaces_do_not_block_each_other() {
        // wlan0 never gets a lease; wlan1 must still come up
        let leases = FakeLeases::default().with(lease("wlan1", ip(10, 1, 0, 5), ip(10, 1, 0, 1)));
        let mut h = start(test_config(), leases);
        bring_up(&h.queue, 3, "wlan0");
        bring_up(&h.queue, 4, "wlan1");

        match next_lifecycle(&mut h.events).await {
            ConnectivityEvent::Established { interface, .. } => assert_eq!(interface, "wlan1"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.kernel.routes_in(1004).iter().filter(|r| r.is_default()).count(), 1);
        assert!(h.kernel.routes_in(1003).is_empty());

        let mut states = Vec::new();
        for _ in 0..200 {
            let status = h.handle.status().await.unwrap();
            states = status.interfaces.iter().map(|i| (i.name.clone(), i.state)).collect();
            if states.first().map(|s| s.1) == Some(LifecycleState::Acquiring) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            states,
            vec![("wlan0".to_string(), LifecycleState::Acquiring), ("wlan1".to_string(), LifecycleState::Active)]
        );

        // Link loss cancels the pending acquisition
        h.queue.push(MonitorEvent::LinkDown { index: 3, name: "wlan0".into() });
        match next_lifecycle(&mut h.events).await {
            ConnectivityEvent::Lost { interface, reason, .. } => {
                assert_eq!(interface, "wlan0");
                assert_eq!(reason, LossReason::LinkDown);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(h.leases.stopped().contains(&"wlan0".to_string()));
        h.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_acquisitions_get_separate_tables() {
        let leases = FakeLeases::default()
            .with(lease("wlan0", ip(10, 0, 0, 5), ip(10, 0, 0, 1)))
            .with(lease("wlan1", ip(10, 1, 0, 5), ip(10, 1, 0, 1)));
        let mut h = start(test_config(), leases);
        bring_up(&h.queue, 3, "wlan0");
        bring_up(&h.queue, 4, "wlan1");

        let mut established = Vec::new();
        while established.len() < 2 {
            if let ConnectivityEvent::Established { interface, .. } = next_lifecycle(&mut h.events).await {
                established.push(interface);
            }
        }
        established.sort();
        assert_eq!(established, vec!["wlan0", "wlan1"]);

        let kernel = h.kernel.clone();
        wait_until(|| kernel.main_defaults().len() == 3).await;
        let mut metrics: Vec<u32> = h.kernel.main_defaults().iter().map(|r| r.metric).collect();
        metrics.sort();
        metrics.dedup();
        assert_eq!(metrics.len(), 3);
        h.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_renewal_with_new_gateway_reapplies() {
        let leases = FakeLeases::default().with(lease("wlan0", ip(10, 0, 0, 5), ip(10, 0, 0, 1)));
        let mut h = start(test_config(), leases);
        bring_up(&h.queue, 3, "wlan0");
        assert!(matches!(next_lifecycle(&mut h.events).await, ConnectivityEvent::Established { .. }));

        h.lease_tx
            .send(LeaseEvent::Updated(lease("wlan0", ip(10, 0, 0, 5), ip(10, 0, 0, 2))))
            .unwrap();

        let kernel = h.kernel.clone();
        wait_until(|| {
            kernel.main_defaults().iter().any(|r| r.if_index == 3 && r.gateway == Some(ip(10, 0, 0, 2)))
        })
        .await;
        let defaults: Vec<_> = h.kernel.routes_in(1003).into_iter().filter(|r| r.is_default()).collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].gateway, Some(ip(10, 0, 0, 2)));
        assert_eq!(h.kernel.main_defaults().iter().filter(|r| r.if_index == 3).count(), 1);

        let status = h.handle.status().await.unwrap();
        assert_eq!(status.interfaces[0].gateway, Some(ip(10, 0, 0, 2)));
        assert_eq!(status.interfaces[0].state, LifecycleState::Active);
        h.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_lease_expiry_and_link_removal() {
        let leases = FakeLeases::default().with(lease("wlan0", ip(10, 0, 0, 5), ip(10, 0, 0, 1)));
        let mut h = start(test_config(), leases);
        bring_up(&h.queue, 3, "wlan0");
        assert!(matches!(next_lifecycle(&mut h.events).await, ConnectivityEvent::Established { .. }));

        h.lease_tx.send(LeaseEvent::Expired { interface: "wlan0".into() }).unwrap();
        match next_lifecycle(&mut h.events).await {
            ConnectivityEvent::Lost { reason, .. } => assert_eq!(reason, LossReason::LeaseExpired),
            other => panic!("unexpected {:?}", other),
        }

        // Link still usable: a replayed carrier event acquires again
        h.queue.push(MonitorEvent::CarrierAcquired { index: 3, name: "wlan0".into() });
        assert!(matches!(next_lifecycle(&mut h.events).await, ConnectivityEvent::Established { .. }));

        h.queue.push(MonitorEvent::LinkRemoved { index: 3, name: "wlan0".into() });
        match next_lifecycle(&mut h.events).await {
            ConnectivityEvent::Lost { reason, .. } => assert_eq!(reason, LossReason::InterfaceRemoved),
            other => panic!("unexpected {:?}", other),
        }
        assert!(h.kernel.routes_in(1003).is_empty());
        assert!(h.handle.status().await.unwrap().interfaces.is_empty());
        h.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_exited_client_restarts_on_next_link_event() {
        let leases = FakeLeases::default().with(lease("wlan0", ip(10, 0, 0, 5), ip(10, 0, 0, 1)));
        let mut h = start(test_config(), leases);
        bring_up(&h.queue, 3, "wlan0");
        assert!(matches!(next_lifecycle(&mut h.events).await, ConnectivityEvent::Established { .. }));

        h.lease_tx
            .send(LeaseEvent::ClientExited { interface: "wlan0".into(), code: Some(1) })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.queue.push(MonitorEvent::CarrierAcquired { index: 3, name: "wlan0".into() });

        let leases = h.leases.clone();
        wait_until(|| leases.started().len() == 2).await;
        assert_eq!(h.leases.stopped(), vec!["wlan0".to_string()]);

        // Same binding: still active, routes untouched
        let status = h.handle.status().await.unwrap();
        assert_eq!(status.interfaces[0].state, LifecycleState::Active);
        assert_eq!(h.kernel.routes_in(1003).iter().filter(|r| r.is_default()).count(), 1);
        h.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_degraded_monitor_holds_acquisition() {
        let leases = FakeLeases::default().with(lease("wlan0", ip(10, 0, 0, 5), ip(10, 0, 0, 1)));
        let mut h = start(test_config(), leases);

        h.queue.push(MonitorEvent::Degraded { failures: 5 });
        assert!(matches!(next_event(&mut h.events).await, ConnectivityEvent::MonitorDegraded { .. }));
        bring_up(&h.queue, 3, "wlan0");

        let status = wait_for_state(&h.handle, "wlan0", LifecycleState::Discovered).await;
        assert!(status.degraded);
        match h.handle.configure_interface("wlan0", false).await {
            Err(NetagentError::MonitorDegraded(message)) => assert!(message.contains("wlan0")),
            other => panic!("unexpected {:?}", other),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.leases.started().is_empty());

        // No link event follows the recovery; held interfaces resume on their own
        h.queue.push(MonitorEvent::Recovered);
        assert!(matches!(next_event(&mut h.events).await, ConnectivityEvent::MonitorRecovered { .. }));
        assert!(matches!(next_lifecycle(&mut h.events).await, ConnectivityEvent::Established { .. }));
        h.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stuck_teardown_still_reports_loss() {
        let mut config = test_config();
        config.manager.teardown_timeout_ms = 200;
        let leases = FakeLeases::default()
            .with(lease("wlan0", ip(10, 0, 0, 5), ip(10, 0, 0, 1)))
            .stalling_stop(Duration::from_secs(30));
        let mut h = start(config, leases);
        let foreign = foreign_state(&h.kernel);
        bring_up(&h.queue, 3, "wlan0");
        assert!(matches!(next_lifecycle(&mut h.events).await, ConnectivityEvent::Established { .. }));
        let kernel = h.kernel.clone();
        wait_until(|| kernel.main_defaults().iter().any(|r| r.if_index == 3)).await;

        h.kernel.stall_on("rule_del", Duration::from_secs(30));
        let started = std::time::Instant::now();
        h.queue.push(MonitorEvent::CarrierLost { index: 3, name: "wlan0".into() });
        match next_lifecycle(&mut h.events).await {
            ConnectivityEvent::Lost { reason, .. } => assert_eq!(reason, LossReason::CarrierLost),
            other => panic!("unexpected {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(2));

        let status = h.handle.status().await.unwrap();
        assert_eq!(status.interfaces[0].state, LifecycleState::Discovered);
        assert_eq!(status.interfaces[0].gateway, None);
        // Routes went before the stalled rule delete; the rule is still owned
        assert!(h.kernel.routes_in(1003).is_empty());
        assert!(h.kernel.rules().iter().any(|r| r.table_id == 1003));

        h.kernel.clear_faults();
        h.handle.shutdown().await.unwrap();
        h.task.await.unwrap();
        assert_eq!(h.kernel.rules(), foreign.1);
        assert_eq!(h.kernel.state.lock().unwrap().routes.len(), foreign.0.len());
    }

    #[tokio::test]
    async fn test_stalled_main_table_does_not_hold_back_routing() {
        let mut config = test_config();
        config.routing.declarative_max_elapsed_ms = 3000;
        let leases = FakeLeases::default()
            .with(lease("wlan0", ip(10, 0, 0, 5), ip(10, 0, 0, 1)))
            .with(lease("wlan1", ip(10, 1, 0, 5), ip(10, 1, 0, 1)));
        let mut h = start(config, leases);
        // Startup reconciliation lists the main table; let it finish first
        h.handle.status().await.unwrap();
        h.kernel.declarative().stall_on("route_list", Duration::from_secs(10));

        bring_up(&h.queue, 3, "wlan0");
        assert!(matches!(next_lifecycle(&mut h.events).await, ConnectivityEvent::Established { .. }));

        // A renewal replaces the dedicated default without waiting out the stuck job
        h.lease_tx
            .send(LeaseEvent::Updated(lease("wlan0", ip(10, 0, 0, 5), ip(10, 0, 0, 2))))
            .unwrap();
        let kernel = h.kernel.clone();
        tokio::time::timeout(Duration::from_secs(1), async move {
            while !kernel.routes_in(1003).iter().any(|r| r.is_default() && r.gateway == Some(ip(10, 0, 0, 2))) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("dedicated default not updated");

        bring_up(&h.queue, 4, "wlan1");
        match next_lifecycle(&mut h.events).await {
            ConnectivityEvent::Established { interface, .. } => assert_eq!(interface, "wlan1"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.kernel.routes_in(1004).iter().filter(|r| r.is_default()).count(), 1);

        loop {
            if let ConnectivityEvent::Error { interface, message, .. } = next_event(&mut h.events).await {
                if interface == "wlan0" {
                    assert!(message.starts_with("main-table default"));
                    break;
                }
            }
        }
        assert!(h.kernel.main_defaults().iter().all(|r| r.if_index != 3 && r.if_index != 4));
        let status = h.handle.status().await.unwrap();
        assert!(status.interfaces.iter().all(|i| i.state == LifecycleState::Active));

        h.kernel.clear_faults();
        let kernel = h.kernel.clone();
        wait_until(|| {
            let defaults = kernel.main_defaults();
            defaults.iter().any(|r| r.if_index == 3 && r.gateway == Some(ip(10, 0, 0, 2)))
                && defaults.iter().any(|r| r.if_index == 4)
        })
        .await;
        h.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_renew_lease_through_handle() {
        let mut config = test_config();
        config.interfaces[2] = InterfacePolicy {
            name: "wlan1".to_string(),
            managed: true,
            static_address: Some("10.9.0.5/24".to_string()),
            static_gateway: Some(ip(10, 9, 0, 1)),
        };
        let leases = FakeLeases::default().with(lease("wlan0", ip(10, 0, 0, 5), ip(10, 0, 0, 1)));
        let mut h = start(config, leases);
        bring_up(&h.queue, 3, "wlan0");
        bring_up(&h.queue, 4, "wlan1");
        for _ in 0..2 {
            assert!(matches!(next_lifecycle(&mut h.events).await, ConnectivityEvent::Established { .. }));
        }

        h.handle.renew_lease("wlan0").await.unwrap();
        assert_eq!(h.leases.renewed(), vec!["wlan0".to_string()]);
        assert!(matches!(
            h.handle.renew_lease("wlan1").await,
            Err(NetagentError::InvalidParameter(_))
        ));
        assert!(matches!(
            h.handle.renew_lease("wlan7").await,
            Err(NetagentError::InterfaceNotFound(_))
        ));
        assert_eq!(h.leases.renewed().len(), 1);

        // The client answers with the renewed lease
        h.lease_tx
            .send(LeaseEvent::Updated(lease("wlan0", ip(10, 0, 0, 5), ip(10, 0, 0, 1))))
            .unwrap();
        let status = wait_for_state(&h.handle, "wlan0", LifecycleState::Active).await;
        assert_eq!(status.interfaces[0].gateway, Some(ip(10, 0, 0, 1)));
        assert!(h.leases.stopped().is_empty());
        h.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_removal_behind_full_worker_queue_reports_loss() {
        let leases = FakeLeases::default().with(lease("wlan0", ip(10, 0, 0, 5), ip(10, 0, 0, 1)));
        let mut h = start(test_config(), leases);
        h.kernel.stall_on("route_replace", Duration::from_millis(800));
        bring_up(&h.queue, 3, "wlan0");
        wait_for_state(&h.handle, "wlan0", LifecycleState::Acquiring).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The worker is busy routing; fill its queue, then remove the link
        for _ in 0..WORKER_QUEUE {
            h.queue.push(MonitorEvent::LinkUp { index: 3, name: "wlan0".into() });
        }
        h.queue.push(MonitorEvent::LinkRemoved { index: 3, name: "wlan0".into() });

        assert!(matches!(next_lifecycle(&mut h.events).await, ConnectivityEvent::Established { .. }));
        match next_lifecycle(&mut h.events).await {
            ConnectivityEvent::Lost { interface, reason, .. } => {
                assert_eq!(interface, "wlan0");
                assert_eq!(reason, LossReason::InterfaceRemoved);
            }
            other => panic!("unexpected {:?}", other),
        }
        h.kernel.clear_faults();
        let kernel = h.kernel.clone();
        wait_until(|| kernel.routes_in(1003).is_empty()).await;
        h.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_static_override_skips_dhcp() {
        let mut config = test_config();
        config.interfaces[2] = InterfacePolicy {
            name: "wlan1".to_string(),
            managed: true,
            static_address: Some("10.9.0.5/24".to_string()),
            static_gateway: Some(ip(10, 9, 0, 1)),
        };
        let mut h = start(config, FakeLeases::default());
        bring_up(&h.queue, 4, "wlan1");

        match next_lifecycle(&mut h.events).await {
            ConnectivityEvent::Established { address, gateway, .. } => {
                assert_eq!(address, ip(10, 9, 0, 5));
                assert_eq!(gateway, ip(10, 9, 0, 1));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(h.leases.started().is_empty());
        h.handle.add_host_route("wlan1", ip(8, 8, 8, 8)).await.unwrap();
        assert!(h.kernel.routes_in(1004).iter().any(|r| r.destination == ip(8, 8, 8, 8)));
        h.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unmanaged_interface_is_ignored_until_configured() {
        let leases = FakeLeases::default().with(lease("eth0", ip(192, 168, 1, 50), ip(192, 168, 1, 1)));
        let h = start(test_config(), leases);
        bring_up(&h.queue, 2, "eth0");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.handle.status().await.unwrap().interfaces.is_empty());
        assert!(h.handle.configure_interface("wlan7", false).await.is_err());

        h.handle.configure_interface("eth0", false).await.unwrap();
        let leases = h.leases.clone();
        wait_until(|| leases.started() == vec!["eth0".to_string()]).await;
        h.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_removes_everything_owned() {
        let leases = FakeLeases::default().with(lease("wlan0", ip(10, 0, 0, 5), ip(10, 0, 0, 1)));
        let mut h = start(test_config(), leases);
        let foreign = foreign_state(&h.kernel);
        bring_up(&h.queue, 3, "wlan0");
        assert!(matches!(next_lifecycle(&mut h.events).await, ConnectivityEvent::Established { .. }));
        let kernel = h.kernel.clone();
        wait_until(|| kernel.main_defaults().iter().any(|r| r.if_index == 3)).await;

        h.handle.shutdown().await.unwrap();
        h.task.await.unwrap();
        assert_eq!(h.kernel.state.lock().unwrap().routes.len(), foreign.0.len());
        assert_eq!(h.kernel.rules(), foreign.1);
        assert!(h.handle.status().await.is_err());
    }
}
