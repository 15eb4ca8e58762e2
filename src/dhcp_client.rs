//! DHCP lease management via a per-interface dhclient process
//!
//! Each interface gets one client slot: the supervised subprocess, a
//! lease-file watcher, and a `watch` channel carrying the current binding.
//! Concurrent `start` calls for the same interface share one slot and one
//! wait. Renewals are detected by re-parsing the lease file whenever it
//! changes and are reported as [`LeaseEvent::Updated`] with the full lease.
//! A forced renewal swaps the slot's process for a fresh one on the same
//! lease file, so the server is asked to extend the recorded binding.

use crate::config::DhcpSettings;
use crate::dhcp_lease::{self, DhcpLease};
use crate::error::{NetagentError, NetagentResult};
use crate::validation;
use async_trait::async_trait;
use chrono::Utc;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lease changes reported after the first lease
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseEvent {
    /// The lease file now holds a different lease; replaces the previous one
    Updated(DhcpLease),
    /// The lease expired without a renewal
    Expired { interface: String },
    /// The client process exited on its own
    ClientExited { interface: String, code: Option<i32> },
}

impl LeaseEvent {
    pub fn interface(&self) -> &str {
        match self {
            LeaseEvent::Updated(lease) => &lease.interface,
            LeaseEvent::Expired { interface } | LeaseEvent::ClientExited { interface, .. } => interface,
        }
    }
}

/// Lease acquisition as seen by the manager
#[async_trait]
pub trait LeaseClient: Send + Sync {
    /// Start (or join) acquisition and wait for the first lease
    async fn start(&self, interface: &str) -> NetagentResult<DhcpLease>;
    /// Terminate the client and clear its artifacts
    async fn stop(&self, interface: &str) -> NetagentResult<()>;
    /// Re-request the current lease; the result arrives as [`LeaseEvent::Updated`]
    async fn renew(&self, interface: &str) -> NetagentResult<()>;
    /// Terminate every client
    async fn shutdown(&self) {}
}

/// Lease file of an interface inside `lease_dir`
pub fn lease_file_in(lease_dir: &Path, interface: &str) -> PathBuf {
    lease_dir.join(format!("dhclient.{}.leases", interface))
}

#[derive(Debug, Clone, PartialEq)]
enum SlotState {
    Waiting,
    Bound(DhcpLease),
    Failed(String),
}

/// The supervised process of a slot; replaced on renewal
struct RunningClient {
    pid: Option<u32>,
    stopping: Arc<AtomicBool>,
    supervisor: JoinHandle<()>,
}

impl RunningClient {
    /// Stand-in for a process that is already gone
    fn exited() -> Self {
        Self {
            pid: None,
            stopping: Arc::new(AtomicBool::new(true)),
            supervisor: tokio::spawn(async {}),
        }
    }
}

struct ClientSlot {
    client: RunningClient,
    lease_file: PathBuf,
    pid_file: PathBuf,
    state_tx: Arc<watch::Sender<SlotState>>,
    state: watch::Receiver<SlotState>,
    watcher: JoinHandle<()>,
}

/// DHCP client controller
pub struct DhcpLeaseManager {
    settings: DhcpSettings,
    slots: Mutex<HashMap<String, ClientSlot>>,
    events: mpsc::UnboundedSender<LeaseEvent>,
}

impl DhcpLeaseManager {
    pub fn new(settings: DhcpSettings, events: mpsc::UnboundedSender<LeaseEvent>) -> Self {
        Self {
            settings,
            slots: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn lease_file(&self, interface: &str) -> PathBuf {
        lease_file_in(&self.settings.lease_dir, interface)
    }

    pub fn pid_file(&self, interface: &str) -> PathBuf {
        self.settings.lease_dir.join(format!("dhclient.{}.pid", interface))
    }

    fn client_command(&self, interface: &str, extra: &[&str]) -> Command {
        let mut cmd = Command::new(&self.settings.client_bin);
        cmd.args(&self.settings.client_args)
            .args(extra)
            .arg("-lf")
            .arg(self.lease_file(interface))
            .arg("-pf")
            .arg(self.pid_file(interface))
            .arg(interface)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }

    /// Start the client on an interface and wait for its first lease
    ///
    /// If a client is already running for the interface this joins its
    /// wait instead of spawning another one.
    pub async fn start(&self, interface: &str) -> NetagentResult<DhcpLease> {
        validation::validate_interface_name(interface)?;

        let state = {
            let mut slots = self.slots.lock().await;
            match slots.get(interface) {
                Some(slot) => {
                    debug!("DHCP client already running on {}, joining", interface);
                    slot.state.clone()
                }
                None => {
                    let slot = self.spawn_slot(interface).await?;
                    let state = slot.state.clone();
                    slots.insert(interface.to_string(), slot);
                    state
                }
            }
        };

        let timeout = self.settings.lease_timeout();
        match tokio::time::timeout(timeout, wait_for_lease(interface, state)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("No DHCP lease on {} after {:?}", interface, timeout);
                Err(NetagentError::LeaseTimeout {
                    interface: interface.to_string(),
                    secs: timeout.as_secs(),
                })
            }
        }
    }

    async fn spawn_slot(&self, interface: &str) -> NetagentResult<ClientSlot> {
        tokio::fs::create_dir_all(&self.settings.lease_dir).await?;
        let lease_file = self.lease_file(interface);
        let pid_file = self.pid_file(interface);
        // A lease left from an earlier run must not satisfy this acquisition
        remove_if_exists(&lease_file).await;

        info!("Starting DHCP client on interface {}", interface);
        let (tx, rx) = watch::channel(SlotState::Waiting);
        let tx = Arc::new(tx);
        let client = self.spawn_client(interface, tx.clone())?;

        let watcher = tokio::spawn(watch_lease_file(
            interface.to_string(),
            lease_file.clone(),
            self.settings.poll_interval(),
            tx.clone(),
            self.events.clone(),
        ));

        Ok(ClientSlot {
            client,
            lease_file,
            pid_file,
            state_tx: tx,
            state: rx,
            watcher,
        })
    }

    fn spawn_client(&self, interface: &str, state: Arc<watch::Sender<SlotState>>) -> NetagentResult<RunningClient> {
        let child = self
            .client_command(interface, &["-d", "-v"])
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| NetagentError::CommandFailed {
                cmd: format!("{} {}", self.settings.client_bin.display(), interface),
                code: None,
                stderr: e.to_string(),
            })?;
        let pid = child.id();
        let stopping = Arc::new(AtomicBool::new(false));
        let supervisor = tokio::spawn(supervise(
            interface.to_string(),
            child,
            state,
            stopping.clone(),
            self.events.clone(),
        ));
        Ok(RunningClient { pid, stopping, supervisor })
    }

    /// SIGTERM, then SIGKILL once the grace period runs out
    async fn terminate(&self, interface: &str, client: RunningClient) {
        client.stopping.store(true, Ordering::SeqCst);
        let mut supervisor = client.supervisor;
        // An exited client's pid may already belong to another process
        let Some(pid) = client.pid.filter(|_| !supervisor.is_finished()) else {
            supervisor.abort();
            return;
        };

        signal(pid, libc::SIGTERM);
        let grace = self.settings.stop_grace();
        if tokio::time::timeout(grace, &mut supervisor).await.is_err() {
            warn!("DHCP client on {} ignored SIGTERM for {:?}, killing", interface, grace);
            signal(pid, libc::SIGKILL);
            supervisor.abort();
        }
    }

    /// Stop the client on an interface and remove its lease artifacts
    pub async fn stop(&self, interface: &str) -> NetagentResult<()> {
        let slot = self.slots.lock().await.remove(interface);
        let Some(slot) = slot else {
            debug!("No DHCP client running on {}", interface);
            remove_if_exists(&self.lease_file(interface)).await;
            remove_if_exists(&self.pid_file(interface)).await;
            return Ok(());
        };

        info!("Stopping DHCP client on interface {}", interface);
        slot.watcher.abort();
        self.terminate(interface, slot.client).await;

        remove_if_exists(&slot.lease_file).await;
        remove_if_exists(&slot.pid_file).await;
        Ok(())
    }

    /// Replace the slot's client with a fresh one on the same lease file
    ///
    /// The new client re-requests the recorded binding. The lease watcher
    /// keeps running, so the extended (or changed) lease is reported as
    /// [`LeaseEvent::Updated`]. Also brings back a client that exited.
    pub async fn renew(&self, interface: &str) -> NetagentResult<()> {
        validation::validate_interface_name(interface)?;
        let mut slots = self.slots.lock().await;
        let slot = slots.get_mut(interface).ok_or_else(|| {
            NetagentError::InvalidParameter(format!("no DHCP client running on {}", interface))
        })?;

        info!("Renewing DHCP lease on interface {}", interface);
        // Only one client may write the lease file at a time
        let previous = std::mem::replace(&mut slot.client, RunningClient::exited());
        self.terminate(interface, previous).await;
        slot.client = self.spawn_client(interface, slot.state_tx.clone())?;
        Ok(())
    }

    /// Release the lease with the server, then stop the client
    pub async fn release(&self, interface: &str) -> NetagentResult<()> {
        validation::validate_interface_name(interface)?;
        info!("Releasing DHCP lease on interface {}", interface);

        let mut cmd = self.client_command(interface, &["-r"]);
        cmd.kill_on_drop(true);
        match tokio::time::timeout(self.settings.stop_grace(), cmd.output()).await {
            Ok(Ok(output)) if !output.status.success() => {
                warn!("DHCP release on {} exited with {:?}", interface, output.status.code());
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Failed to run DHCP release on {}: {}", interface, e),
            Err(_) => warn!("DHCP release on {} timed out", interface),
        }

        self.stop(interface).await
    }

    /// Last lease seen for an interface
    pub async fn current_lease(&self, interface: &str) -> Option<DhcpLease> {
        let slots = self.slots.lock().await;
        match &*slots.get(interface)?.state.borrow() {
            SlotState::Bound(lease) => Some(lease.clone()),
            _ => None,
        }
    }

    pub async fn is_running(&self, interface: &str) -> bool {
        self.slots.lock().await.contains_key(interface)
    }

    /// Stop every client
    pub async fn shutdown(&self) {
        let interfaces: Vec<String> = self.slots.lock().await.keys().cloned().collect();
        for interface in interfaces {
            if let Err(e) = self.stop(&interface).await {
                error!("Failed to stop DHCP client on {}: {}", interface, e);
            }
        }
    }
}

#[async_trait]
impl LeaseClient for DhcpLeaseManager {
    async fn start(&self, interface: &str) -> NetagentResult<DhcpLease> {
        DhcpLeaseManager::start(self, interface).await
    }

    async fn stop(&self, interface: &str) -> NetagentResult<()> {
        DhcpLeaseManager::stop(self, interface).await
    }

    async fn renew(&self, interface: &str) -> NetagentResult<()> {
        DhcpLeaseManager::renew(self, interface).await
    }

    async fn shutdown(&self) {
        DhcpLeaseManager::shutdown(self).await
    }
}

async fn wait_for_lease(interface: &str, mut state: watch::Receiver<SlotState>) -> NetagentResult<DhcpLease> {
    loop {
        match &*state.borrow_and_update() {
            SlotState::Bound(lease) => return Ok(lease.clone()),
            SlotState::Failed(reason) => {
                return Err(NetagentError::CommandFailed {
                    cmd: format!("dhcp client on {}", interface),
                    code: None,
                    stderr: reason.clone(),
                })
            }
            SlotState::Waiting => {}
        }
        state
            .changed()
            .await
            .map_err(|_| NetagentError::ChannelClosed(format!("lease state of {}", interface)))?;
    }
}

fn signal(pid: u32, sig: libc::c_int) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: plain kill(2) on a pid we spawned
    let rc = unsafe { libc::kill(pid, sig) };
    if rc != 0 {
        debug!("kill({}, {}) failed: {}", pid, sig, std::io::Error::last_os_error());
    }
}

async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}

/// Own the child until it exits
async fn supervise(
    interface: String,
    mut child: Child,
    state: Arc<watch::Sender<SlotState>>,
    stopping: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<LeaseEvent>,
) {
    let code = match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            error!("Failed to wait for DHCP client on {}: {}", interface, e);
            None
        }
    };

    if stopping.load(Ordering::SeqCst) {
        debug!("DHCP client on {} stopped (code {:?})", interface, code);
        return;
    }

    warn!("DHCP client on {} exited with code {:?}", interface, code);
    state.send_if_modified(|s| {
        if *s == SlotState::Waiting {
            *s = SlotState::Failed(format!("client exited with code {:?}", code));
            true
        } else {
            false
        }
    });
    let _ = events.send(LeaseEvent::ClientExited { interface, code });
}

type FileStamp = (SystemTime, u64);

async fn file_stamp(path: &Path) -> Option<FileStamp> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    Some((meta.modified().ok()?, meta.len()))
}

fn spawn_fs_watcher(lease_file: &Path) -> Option<(RecommendedWatcher, mpsc::Receiver<notify::Event>)> {
    let dir = lease_file.parent()?;
    let (sender, receiver) = mpsc::channel(32);
    let mut watcher = match notify::recommended_watcher(move |res| match res {
        Ok(event) => {
            let _ = sender.blocking_send(event);
        }
        Err(e) => warn!("Lease file watch error: {}", e),
    }) {
        Ok(watcher) => watcher,
        Err(e) => {
            warn!("Failed to create lease file watcher, polling only: {}", e);
            return None;
        }
    };
    if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
        warn!("Failed to watch {}, polling only: {}", dir.display(), e);
        return None;
    }
    Some((watcher, receiver))
}

/// Re-parse the lease file whenever it changes
///
/// Filesystem notifications trigger an early check; a periodic poll of the
/// file's mtime and size catches anything the notifications miss.
async fn watch_lease_file(
    interface: String,
    lease_file: PathBuf,
    poll_interval: std::time::Duration,
    state: Arc<watch::Sender<SlotState>>,
    events: mpsc::UnboundedSender<LeaseEvent>,
) {
    let (_watcher, mut fs_events) = match spawn_fs_watcher(&lease_file) {
        Some((watcher, rx)) => (Some(watcher), Some(rx)),
        None => (None, None),
    };
    let mut ticker = tokio::time::interval(poll_interval);
    let mut last_stamp: Option<FileStamp> = None;
    let mut last_lease: Option<DhcpLease> = None;
    let mut expiry_reported = false;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            event = async {
                match fs_events.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                match event {
                    Some(event) if event.paths.iter().any(|p| p == &lease_file) => {}
                    Some(_) => continue,
                    None => fs_events = None,
                }
            }
        }

        let stamp = file_stamp(&lease_file).await;
        if stamp.is_some() && stamp != last_stamp {
            last_stamp = stamp;
            match dhcp_lease::read_lease_file(&lease_file).await {
                Ok(Some(lease)) if last_lease.as_ref() != Some(&lease) => {
                    expiry_reported = false;
                    let first = last_lease.is_none();
                    last_lease = Some(lease.clone());
                    state.send_replace(SlotState::Bound(lease.clone()));
                    if first {
                        info!("DHCP lease on {}: {} via {}", interface, lease.cidr(), lease.gateway);
                    } else {
                        info!("DHCP lease on {} renewed: {} via {}", interface, lease.cidr(), lease.gateway);
                        let _ = events.send(LeaseEvent::Updated(lease));
                    }
                }
                Ok(_) => {}
                // Half-written or unexpected content: retry on the next write
                Err(e) => debug!("Lease file for {} not usable yet: {}", interface, e),
            }
        }

        if let Some(lease) = &last_lease {
            if !expiry_reported && lease.is_expired(Utc::now()) {
                expiry_reported = true;
                warn!("DHCP lease on {} expired without renewal", interface);
                let _ = events.send(LeaseEvent::Expired { interface: interface.clone() });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &Path) -> (DhcpLeaseManager, mpsc::UnboundedReceiver<LeaseEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let settings = DhcpSettings {
            lease_dir: dir.to_path_buf(),
            ..DhcpSettings::default()
        };
        (DhcpLeaseManager::new(settings, tx), rx)
    }

    #[test]
    fn test_artifact_paths() {
        let (m, _rx) = manager(Path::new("/var/lib/netagent"));
        assert_eq!(m.lease_file("wlan0"), PathBuf::from("/var/lib/netagent/dhclient.wlan0.leases"));
        assert_eq!(m.pid_file("wlan0"), PathBuf::from("/var/lib/netagent/dhclient.wlan0.pid"));
    }

    #[test]
    fn test_client_command_args() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let settings = DhcpSettings {
            client_bin: PathBuf::from("/sbin/dhclient"),
            client_args: vec!["-4".to_string()],
            lease_dir: PathBuf::from("/run/na"),
            ..DhcpSettings::default()
        };
        let m = DhcpLeaseManager::new(settings, tx);
        let cmd = m.client_command("wlan0", &["-d"]);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec!["-4", "-d", "-lf", "/run/na/dhclient.wlan0.leases", "-pf", "/run/na/dhclient.wlan0.pid", "wlan0"]
        );
    }

    #[tokio::test]
    async fn test_stop_unknown_interface_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let (m, _rx) = manager(dir.path());
        m.stop("wlan0").await.unwrap();
        assert!(m.current_lease("wlan0").await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_interface_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (m, _rx) = manager(dir.path());
        assert!(m.start("bad/name").await.is_err());
        assert!(m.renew("bad/name").await.is_err());
    }

    #[tokio::test]
    async fn test_renew_without_client_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (m, _rx) = manager(dir.path());
        assert!(matches!(m.renew("wlan0").await, Err(NetagentError::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn test_wait_for_lease_reports_failure() {
        let (tx, rx) = watch::channel(SlotState::Waiting);
        tx.send_replace(SlotState::Failed("exit 1".to_string()));
        let err = wait_for_lease("wlan0", rx).await.unwrap_err();
        assert!(matches!(err, NetagentError::CommandFailed { .. }));
    }
}
