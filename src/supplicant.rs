//! wpa_supplicant association watcher
//!
//! Polls `wpa_cli -i <iface> status` for each managed wireless interface and
//! reports `wpa_state` changes to the manager. Transitional states (scanning,
//! handshakes) are not reported; the manager only cares whether the
//! association is complete or gone.

use crate::config::SupplicantSettings;
use crate::error::{NetagentError, NetagentResult};
use crate::events::SupplicantState;
use crate::manager::ManagerHandle;
use crate::validation;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// `wpa_state` from `wpa_cli status` output, if it is one the manager acts on
pub fn parse_wpa_state(output: &str) -> Option<SupplicantState> {
    output
        .lines()
        .filter_map(|line| line.split_once('='))
        .find(|(key, _)| key.trim() == "wpa_state")
        .and_then(|(_, value)| value.parse().ok())
}

#[derive(Debug, Clone)]
pub struct SupplicantWatcher {
    settings: SupplicantSettings,
}

impl SupplicantWatcher {
    pub fn new(settings: SupplicantSettings) -> Self {
        Self { settings }
    }

    /// Current association state of one interface
    ///
    /// `Ok(None)` while the supplicant is in a transitional state.
    pub async fn status(&self, interface: &str) -> NetagentResult<Option<SupplicantState>> {
        validation::validate_interface_name(interface)?;
        let output = self.wpa_cli(interface, &["status"]).await?;
        Ok(parse_wpa_state(&output))
    }

    /// Poll `interface` until the manager goes away
    pub fn spawn(&self, interface: String, handle: ManagerHandle) -> JoinHandle<()> {
        let watcher = self.clone();
        tokio::spawn(async move { watcher.watch(interface, handle).await })
    }

    async fn watch(self, interface: String, handle: ManagerHandle) {
        info!("Watching wpa_supplicant on {}", interface);
        let mut ticker = tokio::time::interval(self.settings.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last = None;
        let mut failing = false;

        loop {
            ticker.tick().await;
            match self.status(&interface).await {
                Ok(Some(state)) => {
                    failing = false;
                    if last == Some(state) {
                        continue;
                    }
                    debug!("{}: supplicant {:?}", interface, state);
                    if handle.supplicant_state(&interface, state).await.is_err() {
                        break;
                    }
                    last = Some(state);
                }
                Ok(None) => failing = false,
                Err(e) => {
                    // No supplicant on the interface is normal; say so once
                    if !failing {
                        warn!("wpa_supplicant status for {} unavailable: {}", interface, e);
                    }
                    failing = true;
                }
            }
        }
        debug!("Supplicant watcher for {} stopped", interface);
    }

    async fn wpa_cli(&self, interface: &str, args: &[&str]) -> NetagentResult<String> {
        let mut cmd = Command::new(&self.settings.cli_bin);
        cmd.arg("-i").arg(interface);
        cmd.args(args);
        cmd.kill_on_drop(true);

        let cmd_str = format!("wpa_cli -i {} {}", interface, args.join(" "));
        let output = cmd.output().await.map_err(|e| NetagentError::CommandFailed {
            cmd: cmd_str.clone(),
            code: None,
            stderr: e.to_string(),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            return Err(NetagentError::CommandFailed {
                cmd: cmd_str,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        // wpa_cli answers FAIL with exit code 0
        if stdout.trim() == "FAIL" {
            return Err(NetagentError::CommandFailed {
                cmd: cmd_str,
                code: None,
                stderr: "wpa_cli returned FAIL".to_string(),
            });
        }

        Ok(stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerCommand;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    const STATUS: &str = "bssid=02:00:00:00:01:00\nfreq=2412\nssid=lab-ap\nid=0\nmode=station\n\
pairwise_cipher=CCMP\ngroup_cipher=CCMP\nkey_mgmt=WPA2-PSK\nwpa_state=COMPLETED\n\
ip_address=10.0.0.5\naddress=02:00:00:00:00:00\n";

    /// Fake wpa_cli printing whatever `state` holds, for wlan0 only
    fn fake_cli(dir: &Path) -> PathBuf {
        let path = dir.join("fake-wpa_cli");
        let script = format!(
            "#!/bin/sh\n[ \"$1\" = \"-i\" ] && [ \"$2\" = \"wlan0\" ] && [ \"$3\" = \"status\" ] || {{\n  \
echo \"Failed to connect to non-global ctrl_ifname: $2\" >&2\n  exit 255\n}}\ncat \"{}\"\n",
            dir.join("state").display()
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn set_state(dir: &Path, output: &str) {
        let tmp = dir.join("state.tmp");
        std::fs::write(&tmp, output).unwrap();
        std::fs::rename(&tmp, dir.join("state")).unwrap();
    }

    fn watcher(dir: &Path) -> SupplicantWatcher {
        SupplicantWatcher::new(SupplicantSettings {
            enabled: true,
            cli_bin: fake_cli(dir),
            poll_interval_ms: 20,
        })
    }

    async fn next_report(commands: &mut mpsc::Receiver<ManagerCommand>) -> (String, SupplicantState) {
        match tokio::time::timeout(Duration::from_secs(5), commands.recv()).await {
            Ok(Some(ManagerCommand::Supplicant { interface, state })) => (interface, state),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_wpa_state() {
        assert_eq!(parse_wpa_state(STATUS), Some(SupplicantState::Connected));
        assert_eq!(parse_wpa_state("wpa_state=DISCONNECTED\n"), Some(SupplicantState::Disconnected));
        assert_eq!(parse_wpa_state("wpa_state=INTERFACE_DISABLED"), Some(SupplicantState::InterfaceDisabled));
        assert_eq!(parse_wpa_state("ssid=lab-ap\nwpa_state=4WAY_HANDSHAKE\n"), None);
        assert_eq!(parse_wpa_state("Selected interface 'wlan0'\n"), None);
    }

    #[tokio::test]
    async fn test_status_runs_wpa_cli() {
        let dir = TempDir::new().unwrap();
        let watcher = watcher(dir.path());
        set_state(dir.path(), STATUS);
        assert_eq!(watcher.status("wlan0").await.unwrap(), Some(SupplicantState::Connected));

        set_state(dir.path(), "FAIL\n");
        assert!(matches!(watcher.status("wlan0").await, Err(NetagentError::CommandFailed { .. })));
        match watcher.status("wlan1").await {
            Err(NetagentError::CommandFailed { code, stderr, .. }) => {
                assert_eq!(code, Some(255));
                assert!(stderr.contains("wlan1"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(watcher.status("bad;name").await, Err(NetagentError::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn test_watch_reports_changes_only() {
        let dir = TempDir::new().unwrap();
        set_state(dir.path(), STATUS);
        let (handle, mut commands) = ManagerHandle::detached();
        let task = watcher(dir.path()).spawn("wlan0".to_string(), handle);

        assert_eq!(next_report(&mut commands).await, ("wlan0".to_string(), SupplicantState::Connected));

        // Scanning is not reported, and neither is a repeat
        set_state(dir.path(), "wpa_state=SCANNING\n");
        tokio::time::sleep(Duration::from_millis(100)).await;
        set_state(dir.path(), STATUS);
        tokio::time::sleep(Duration::from_millis(100)).await;
        set_state(dir.path(), "wpa_state=DISCONNECTED\n");
        assert_eq!(next_report(&mut commands).await, ("wlan0".to_string(), SupplicantState::Disconnected));

        // The next change finds the manager gone
        drop(commands);
        set_state(dir.path(), STATUS);
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}
