//! Kernel link/address/route monitoring over netlink
//!
//! A raw `NETLINK_ROUTE` socket subscribed to the link, IPv4 address and
//! IPv4 route groups is read through `AsyncFd`. Messages are normalized into
//! [`MonitorEvent`]s and pushed onto a bounded [`EventQueue`].
//!
//! On any read error the socket is recreated after a fixed backoff and a
//! catch-up dump of current links and addresses is queued, so consumers must
//! tolerate replayed events. After too many consecutive failures a single
//! `Degraded` event is queued; the first later session that delivers a batch
//! (or stays up for `stable_after_ms`) queues `Recovered`.

use crate::config::MonitorSettings;
use crate::error::{NetagentError, NetagentResult};
use crate::interface::{Ipv4Cidr, LinkStatus};
use async_trait::async_trait;
use futures::TryStreamExt;
use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::link::{LinkAttribute, LinkFlags, LinkMessage, State};
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use tokio::io::unix::AsyncFd;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const RTNLGRP_LINK: u32 = 1;
const RTNLGRP_IPV4_IFADDR: u32 = 5;
const RTNLGRP_IPV4_ROUTE: u32 = 7;

/// Normalized kernel notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// First sighting of a link (also after a catch-up for new links)
    LinkDiscovered {
        index: u32,
        name: String,
        mac_address: Option<String>,
        link: LinkStatus,
    },
    LinkUp { index: u32, name: String },
    LinkDown { index: u32, name: String },
    CarrierAcquired { index: u32, name: String },
    CarrierLost { index: u32, name: String },
    AddressAdded { index: u32, address: Ipv4Cidr },
    AddressRemoved { index: u32, address: Ipv4Cidr },
    RouteChanged {
        table_id: u32,
        destination: Ipv4Cidr,
        if_index: Option<u32>,
        removed: bool,
    },
    LinkRemoved { index: u32, name: String },
    /// Events were dropped on queue overflow
    Gap { dropped: u64 },
    /// Interface visibility lost
    Degraded { failures: u32 },
    Recovered,
}

#[derive(Debug)]
struct QueueInner {
    events: VecDeque<MonitorEvent>,
    dropped: u64,
    closed: bool,
}

/// Bounded event queue that drops the oldest event on overflow
///
/// The consumer sees a `Gap { dropped }` marker before the first event
/// queued after an overflow.
#[derive(Debug)]
pub struct EventQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                events: VecDeque::with_capacity(capacity),
                dropped: 0,
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn push(&self, event: MonitorEvent) {
        {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            if inner.events.len() >= self.capacity {
                inner.events.pop_front();
                inner.dropped += 1;
                warn!(
                    "Monitor event queue full ({}), dropped oldest event ({} pending gap)",
                    self.capacity, inner.dropped
                );
            }
            inner.events.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Next event without waiting
    pub fn try_recv(&self) -> Option<MonitorEvent> {
        let mut inner = self.lock();
        if inner.dropped > 0 {
            let dropped = std::mem::take(&mut inner.dropped);
            return Some(MonitorEvent::Gap { dropped });
        }
        inner.events.pop_front()
    }

    /// Wait for the next event; `None` once closed and drained
    pub async fn recv(&self) -> Option<MonitorEvent> {
        loop {
            let notified = self.notify.notified();
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.lock().closed {
                return None;
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
struct TrackedLink {
    name: String,
    status: LinkStatus,
}

/// Last-known link state per ifindex; turns link messages into transitions
#[derive(Debug, Default)]
pub struct LinkTracker {
    links: HashMap<u32, TrackedLink>,
}

impl LinkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a link message and return the transitions it implies
    pub fn observe_link(
        &mut self,
        index: u32,
        name: &str,
        mac_address: Option<String>,
        status: LinkStatus,
    ) -> Vec<MonitorEvent> {
        let mut events = Vec::new();
        match self.links.get_mut(&index) {
            None => {
                info!("New interface detected: {} (index {})", name, index);
                events.push(MonitorEvent::LinkDiscovered {
                    index,
                    name: name.to_string(),
                    mac_address,
                    link: status,
                });
                if status.admin_up {
                    events.push(MonitorEvent::LinkUp { index, name: name.to_string() });
                }
                if status.carrier {
                    events.push(MonitorEvent::CarrierAcquired { index, name: name.to_string() });
                }
                self.links.insert(index, TrackedLink { name: name.to_string(), status });
            }
            Some(known) => {
                if known.name != name {
                    debug!("Interface {} renamed to {}", known.name, name);
                    known.name = name.to_string();
                }
                if known.status.admin_up != status.admin_up {
                    events.push(if status.admin_up {
                        MonitorEvent::LinkUp { index, name: name.to_string() }
                    } else {
                        MonitorEvent::LinkDown { index, name: name.to_string() }
                    });
                }
                if known.status.carrier != status.carrier {
                    events.push(if status.carrier {
                        MonitorEvent::CarrierAcquired { index, name: name.to_string() }
                    } else {
                        MonitorEvent::CarrierLost { index, name: name.to_string() }
                    });
                }
                known.status = status;
            }
        }
        events
    }

    pub fn remove_link(&mut self, index: u32) -> Option<MonitorEvent> {
        self.links.remove(&index).map(|link| {
            info!("Interface removed: {} (index {})", link.name, index);
            MonitorEvent::LinkRemoved { index, name: link.name }
        })
    }

    /// Replay full state for a fresh link dump
    ///
    /// Known links re-emit their current state even when unchanged; links
    /// missing from the dump are reported removed.
    pub fn resync(&mut self, dump: Vec<(u32, String, Option<String>, LinkStatus)>) -> Vec<MonitorEvent> {
        let mut events = Vec::new();
        let present: Vec<u32> = dump.iter().map(|(index, ..)| *index).collect();

        for (index, name, mac_address, status) in dump {
            if self.links.contains_key(&index) {
                self.observe_link(index, &name, mac_address, status);
                events.push(if status.admin_up {
                    MonitorEvent::LinkUp { index, name: name.clone() }
                } else {
                    MonitorEvent::LinkDown { index, name: name.clone() }
                });
                events.push(if status.carrier {
                    MonitorEvent::CarrierAcquired { index, name }
                } else {
                    MonitorEvent::CarrierLost { index, name }
                });
            } else {
                events.extend(self.observe_link(index, &name, mac_address, status));
            }
        }

        let gone: Vec<u32> = self.links.keys().filter(|i| !present.contains(i)).copied().collect();
        events.extend(gone.into_iter().filter_map(|index| self.remove_link(index)));
        events
    }

    pub fn name_of(&self, index: u32) -> Option<&str> {
        self.links.get(&index).map(|l| l.name.as_str())
    }
}

/// Netlink monitor task
pub struct NetlinkMonitor {
    settings: MonitorSettings,
    queue: Arc<EventQueue>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NetlinkMonitor {
    pub fn new(settings: MonitorSettings) -> Self {
        let queue = Arc::new(EventQueue::new(settings.queue_capacity));
        Self {
            settings,
            queue,
            task: Mutex::new(None),
        }
    }

    /// Queue the manager consumes
    pub fn events(&self) -> Arc<EventQueue> {
        self.queue.clone()
    }

    /// Start the monitor task
    pub fn start(&self) -> NetagentResult<()> {
        let mut task = match self.task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if task.is_some() {
            return Err(NetagentError::InvalidParameter("Netlink monitor already running".to_string()));
        }

        info!("Starting netlink monitor");
        let settings = self.settings.clone();
        let queue = self.queue.clone();
        *task = Some(tokio::spawn(monitor_loop(NetlinkSource::new(), settings, queue)));
        Ok(())
    }

    /// Stop the monitor task and close the queue
    pub fn stop(&self) {
        let handle = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
            info!("Stopped netlink monitor");
        }
        self.queue.close();
    }
}

impl Drop for NetlinkMonitor {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.task.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

/// Where kernel notifications come from
///
/// One `open` starts a session: it subscribes, dumps current state through
/// the tracker and returns the catch-up events. `next_batch` then yields
/// what the session receives until it fails. Both must be cancel safe.
#[async_trait]
pub trait MonitorSource: Send {
    async fn open(&mut self, tracker: &mut LinkTracker) -> NetagentResult<Vec<MonitorEvent>>;

    async fn next_batch(&mut self, tracker: &mut LinkTracker) -> NetagentResult<Vec<MonitorEvent>>;
}

/// Consecutive-failure bookkeeping of the monitor loop
#[derive(Debug, Default)]
struct Health {
    failures: u32,
    degraded: bool,
}

impl Health {
    /// The current session proved itself
    fn healthy(&mut self, queue: &EventQueue) {
        self.failures = 0;
        if self.degraded {
            self.degraded = false;
            info!("Netlink monitor recovered");
            queue.push(MonitorEvent::Recovered);
        }
    }

    fn failed(&mut self, limit: u32, queue: &EventQueue) {
        self.failures += 1;
        if self.failures >= limit && !self.degraded {
            self.degraded = true;
            error!("Netlink monitor degraded after {} consecutive failures", self.failures);
            queue.push(MonitorEvent::Degraded { failures: self.failures });
        }
    }
}

/// Run sessions forever, restarting after a fixed backoff
///
/// A reopen alone does not reset the failure count: the session must deliver
/// a batch or stay up for `stable_after` first.
async fn monitor_loop<S: MonitorSource>(mut source: S, settings: MonitorSettings, queue: Arc<EventQueue>) {
    let mut tracker = LinkTracker::new();
    let mut health = Health::default();

    loop {
        match source.open(&mut tracker).await {
            Ok(events) => {
                debug!("Catch-up dump produced {} events", events.len());
                for event in events {
                    queue.push(event);
                }

                let stable = tokio::time::sleep(settings.stable_after());
                tokio::pin!(stable);
                let mut proven = false;

                let err = loop {
                    tokio::select! {
                        batch = source.next_batch(&mut tracker) => match batch {
                            Ok(events) => {
                                if !proven {
                                    proven = true;
                                    health.healthy(&queue);
                                }
                                for event in events {
                                    queue.push(event);
                                }
                            }
                            Err(e) => break e,
                        },
                        _ = &mut stable, if !proven => {
                            proven = true;
                            health.healthy(&queue);
                        }
                    }
                };
                warn!("Netlink monitor socket failed: {}", err);
            }
            Err(e) => warn!("Failed to open netlink monitor: {}", e),
        }

        health.failed(settings.max_consecutive_failures, &queue);
        tokio::time::sleep(settings.restart_backoff()).await;
    }
}

/// Raw `NETLINK_ROUTE` multicast socket plus an rtnetlink catch-up dump
pub struct NetlinkSource {
    socket: Option<AsyncFd<Socket>>,
    buf: Vec<u8>,
}

impl NetlinkSource {
    pub fn new() -> Self {
        Self { socket: None, buf: Vec::with_capacity(64 * 1024) }
    }
}

impl Default for NetlinkSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MonitorSource for NetlinkSource {
    async fn open(&mut self, tracker: &mut LinkTracker) -> NetagentResult<Vec<MonitorEvent>> {
        self.socket = None;
        // Subscribe before the dump so nothing between the two is lost
        let socket = open_socket()?;
        let events = catch_up(tracker).await?;
        self.socket = Some(socket);
        info!("Netlink monitor ready, listening for events");
        Ok(events)
    }

    async fn next_batch(&mut self, tracker: &mut LinkTracker) -> NetagentResult<Vec<MonitorEvent>> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| NetagentError::Netlink("netlink monitor socket not open".to_string()))?;

        loop {
            let mut guard = socket.readable().await?;
            self.buf.clear();
            match guard.get_inner().recv(&mut self.buf, 0) {
                Ok(0) => return Err(NetagentError::Netlink("netlink socket closed".to_string())),
                Ok(_) => return Ok(process_netlink_messages(&self.buf, tracker)),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    guard.clear_ready();
                }
                // ENOBUFS included: the kernel dropped messages, resync from a dump
                Err(e) => return Err(NetagentError::Io(e)),
            }
        }
    }
}

fn open_socket() -> NetagentResult<AsyncFd<Socket>> {
    let mut socket = Socket::new(NETLINK_ROUTE)
        .map_err(|e| NetagentError::Netlink(format!("Failed to create netlink socket: {}", e)))?;
    socket
        .bind(&SocketAddr::new(0, 0))
        .map_err(|e| NetagentError::Netlink(format!("Failed to bind netlink socket: {}", e)))?;

    for group in [RTNLGRP_LINK, RTNLGRP_IPV4_IFADDR, RTNLGRP_IPV4_ROUTE] {
        socket
            .add_membership(group)
            .map_err(|e| NetagentError::Netlink(format!("Failed to join group {}: {}", group, e)))?;
    }
    socket
        .set_non_blocking(true)
        .map_err(|e| NetagentError::Netlink(format!("Failed to set non-blocking: {}", e)))?;

    AsyncFd::new(socket).map_err(NetagentError::Io)
}

/// Dump current links then addresses through a short-lived rtnetlink handle
async fn catch_up(tracker: &mut LinkTracker) -> NetagentResult<Vec<MonitorEvent>> {
    let (connection, handle, _) = rtnetlink::new_connection()
        .map_err(|e| NetagentError::Netlink(format!("Failed to create rtnetlink connection: {}", e)))?;
    let connection = tokio::spawn(connection);

    let mut dump = Vec::new();
    let mut links = handle.link().get().execute();
    while let Some(link) = links.try_next().await? {
        if let Some(name) = extract_interface_name(&link) {
            dump.push((link.header.index, name, extract_mac(&link), extract_link_status(&link)));
        }
    }
    let mut events = tracker.resync(dump);

    let mut addresses = handle.address().get().execute();
    while let Some(addr) = addresses.try_next().await? {
        if let Some(address) = extract_ipv4(&addr) {
            events.push(MonitorEvent::AddressAdded { index: addr.header.index, address });
        }
    }

    drop(handle);
    connection.abort();
    Ok(events)
}

fn extract_interface_name(link: &LinkMessage) -> Option<String> {
    link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::IfName(name) => Some(name.clone()),
        _ => None,
    })
}

fn extract_mac(link: &LinkMessage) -> Option<String> {
    link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::Address(bytes) if bytes.len() == 6 => Some(
            bytes
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(":"),
        ),
        _ => None,
    })
}

/// IFF_UP for admin state, IFF_LOWER_UP (or operstate up) for carrier
fn extract_link_status(link: &LinkMessage) -> LinkStatus {
    let flags = link.header.flags;
    let oper_up = link
        .attributes
        .iter()
        .any(|attr| matches!(attr, LinkAttribute::OperState(State::Up)));
    LinkStatus {
        admin_up: flags.contains(LinkFlags::Up),
        carrier: flags.contains(LinkFlags::LowerUp) || oper_up,
    }
}

fn extract_ipv4(addr: &AddressMessage) -> Option<Ipv4Cidr> {
    let find = |local: bool| {
        addr.attributes.iter().find_map(|attr| match attr {
            AddressAttribute::Local(IpAddr::V4(ip)) if local => Some(*ip),
            AddressAttribute::Address(IpAddr::V4(ip)) if !local => Some(*ip),
            _ => None,
        })
    };
    find(true)
        .or_else(|| find(false))
        .map(|ip| Ipv4Cidr::new(ip, addr.header.prefix_len))
}

fn route_change(route: &RouteMessage, removed: bool) -> Option<MonitorEvent> {
    let mut destination = None;
    let mut if_index = None;
    let mut table_id = u32::from(route.header.table);
    for attr in &route.attributes {
        match attr {
            RouteAttribute::Destination(RouteAddress::Inet(ip)) => destination = Some(*ip),
            RouteAttribute::Destination(_) => return None,
            RouteAttribute::Oif(idx) => if_index = Some(*idx),
            RouteAttribute::Table(id) => table_id = *id,
            _ => {}
        }
    }
    let destination = Ipv4Cidr::new(
        destination.unwrap_or(std::net::Ipv4Addr::UNSPECIFIED),
        route.header.destination_prefix_length,
    );
    Some(MonitorEvent::RouteChanged { table_id, destination, if_index, removed })
}

/// Translate a buffer of netlink messages
pub fn process_netlink_messages(data: &[u8], tracker: &mut LinkTracker) -> Vec<MonitorEvent> {
    let mut events = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        let msg: NetlinkMessage<RouteNetlinkMessage> = match NetlinkMessage::deserialize(&data[offset..]) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Failed to parse netlink message: {}", e);
                break;
            }
        };

        let msg_len = msg.header.length as usize;
        if msg_len == 0 {
            break;
        }

        match msg.payload {
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(link)) => {
                if let Some(name) = extract_interface_name(&link) {
                    events.extend(tracker.observe_link(
                        link.header.index,
                        &name,
                        extract_mac(&link),
                        extract_link_status(&link),
                    ));
                }
            }
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelLink(link)) => {
                events.extend(tracker.remove_link(link.header.index));
            }
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewAddress(addr)) => {
                if let Some(address) = extract_ipv4(&addr) {
                    debug!("Address added on {}: {}", addr.header.index, address);
                    events.push(MonitorEvent::AddressAdded { index: addr.header.index, address });
                }
            }
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelAddress(addr)) => {
                if let Some(address) = extract_ipv4(&addr) {
                    debug!("Address removed from {}: {}", addr.header.index, address);
                    events.push(MonitorEvent::AddressRemoved { index: addr.header.index, address });
                }
            }
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewRoute(route)) => {
                events.extend(route_change(&route, false));
            }
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelRoute(route)) => {
                events.extend(route_change(&route, true));
            }
            _ => {}
        }

        offset += msg_len;
    }

    events
}
