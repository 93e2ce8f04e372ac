//! Process supervision: spawning the `trader` binary per account, the
//! rolling-window restart cap, and the health loop that detects dead PIDs
//! and stuck DEGRADED proxies.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use qt_event::{EventData, EventEngine, EventType};
use qt_types::{AccountConfig, AlarmData, SupervisionConfig};

use crate::proxy::{TraderProxy, TraderState};

/// Rolling-window restart cap: at most `max_restarts` within `window`.
/// Exceeding it parks the account until an operator intervenes.
pub struct RestartPolicy {
    max_restarts: u32,
    window: Duration,
    attempts: Mutex<VecDeque<Instant>>,
}

impl RestartPolicy {
    pub fn new(max_restarts: u32, window: Duration) -> Self {
        Self {
            max_restarts,
            window,
            attempts: Mutex::new(VecDeque::new()),
        }
    }

    pub fn from_config(config: &SupervisionConfig) -> Self {
        Self::new(
            config.max_restarts,
            Duration::from_secs(config.restart_window_secs),
        )
    }

    /// Record one restart attempt; false means the cap is exhausted.
    pub fn allow(&self) -> bool {
        let now = Instant::now();
        let mut attempts = self.attempts.lock();
        while let Some(front) = attempts.front() {
            if now.duration_since(*front) > self.window {
                attempts.pop_front();
            } else {
                break;
            }
        }
        if attempts.len() >= self.max_restarts as usize {
            return false;
        }
        attempts.push_back(now);
        true
    }
}

/// One supervised subprocess.
pub struct TraderProcess {
    pub child: Child,
    pub pid: Option<u32>,
}

/// Spawn the `trader` binary for one account. The binary path comes from
/// `QT_TRADER_BIN` or defaults to a `trader` sibling of the running
/// executable.
pub fn spawn_trader(
    account: &AccountConfig,
    config_path: &Path,
) -> std::io::Result<TraderProcess> {
    let binary = trader_binary();
    std::fs::create_dir_all(&account.socket_dir)?;

    let child = Command::new(&binary)
        .arg("--config")
        .arg(config_path)
        .arg("--account")
        .arg(&account.account_id)
        .kill_on_drop(true)
        .spawn()?;
    let pid = child.id();
    info!(
        account_id = %account.account_id,
        binary = %binary.display(),
        ?pid,
        "trader spawned"
    );

    if let Some(pid) = pid {
        let _ = std::fs::write(account.pid_file(), pid.to_string());
    }
    Ok(TraderProcess { child, pid })
}

fn trader_binary() -> PathBuf {
    if let Ok(path) = std::env::var("QT_TRADER_BIN") {
        return PathBuf::from(path);
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("trader")))
        .unwrap_or_else(|| PathBuf::from("trader"))
}

/// Stop a trader subprocess: SIGTERM, bounded wait, then SIGKILL.
pub async fn stop_trader(process: &mut TraderProcess, timeout: Duration) {
    if let Some(pid) = process.pid {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    match tokio::time::timeout(timeout, process.child.wait()).await {
        Ok(_) => info!(pid = ?process.pid, "trader exited"),
        Err(_) => {
            warn!(pid = ?process.pid, "trader ignored SIGTERM, killing");
            let _ = process.child.kill().await;
        }
    }
}

/// Decide whether a proxy needs a restart this tick.
#[derive(Debug, PartialEq, Eq)]
pub enum HealthAction {
    None,
    Restart,
}

/// Health rule: a dead PID or a DEGRADED phase past the threshold calls for
/// a restart. RUNNING with a lost connection merely flips to DEGRADED here;
/// the client's backoff loop does the redial.
pub fn check_health(
    proxy: &Arc<TraderProxy>,
    process_alive: bool,
    degraded_threshold: Duration,
) -> HealthAction {
    match proxy.state() {
        TraderState::Running => {
            if !process_alive {
                proxy.set_state(TraderState::Degraded);
                HealthAction::Restart
            } else if !proxy.is_connected() {
                proxy.set_state(TraderState::Degraded);
                HealthAction::None
            } else {
                HealthAction::None
            }
        }
        TraderState::Degraded => {
            if proxy.is_connected() {
                proxy.set_state(TraderState::Running);
                HealthAction::None
            } else if !process_alive {
                HealthAction::Restart
            } else if proxy.degraded_for().unwrap_or_default() > degraded_threshold {
                HealthAction::Restart
            } else {
                HealthAction::None
            }
        }
        TraderState::Starting => {
            if !process_alive {
                HealthAction::Restart
            } else {
                HealthAction::None
            }
        }
        TraderState::Stopped | TraderState::Stopping => HealthAction::None,
    }
}

/// Raise a supervision alarm on the manager engine.
pub fn raise_alarm(engine: &EventEngine, account_id: &str, title: &str, detail: &str) {
    let alarm = AlarmData::new(account_id, "supervisor", title, detail);
    engine.emit(EventType::AlarmUpdate, EventData::Alarm(alarm));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_policy_rolling_window() {
        let policy = RestartPolicy::new(3, Duration::from_millis(200));
        assert!(policy.allow());
        assert!(policy.allow());
        assert!(policy.allow());
        assert!(!policy.allow());

        // Window slides: old attempts expire.
        std::thread::sleep(Duration::from_millis(250));
        assert!(policy.allow());
    }

    #[tokio::test]
    async fn health_rules() {
        let dir = tempfile::tempdir().unwrap();
        let engine = EventEngine::start();
        let config = AccountConfig {
            account_id: "ACC".to_string(),
            credentials: Default::default(),
            paths: qt_types::PathsConfig {
                database: dir.path().join("qt.db"),
                logs: dir.path().join("logs"),
                export: dir.path().join("export"),
                csv_inbox: dir.path().join("inbox"),
                params: dir.path().join("params"),
            },
            risk_control: Default::default(),
            strategies: Vec::new(),
            scheduler: Default::default(),
            socket_dir: dir.path().join("sock"),
            enabled: true,
        };
        let proxy = TraderProxy::new(config, engine);
        let threshold = Duration::from_millis(50);

        // RUNNING with live process but no connection degrades, no restart.
        proxy.set_state(TraderState::Running);
        assert_eq!(check_health(&proxy, true, threshold), HealthAction::None);
        assert_eq!(proxy.state(), TraderState::Degraded);

        // DEGRADED within threshold: wait.
        assert_eq!(check_health(&proxy, true, threshold), HealthAction::None);

        // DEGRADED past threshold: restart.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(check_health(&proxy, true, threshold), HealthAction::Restart);

        // Dead process while RUNNING: immediate restart.
        proxy.set_state(TraderState::Running);
        assert_eq!(check_health(&proxy, false, threshold), HealthAction::Restart);

        // STOPPED is left alone.
        proxy.set_state(TraderState::Stopped);
        assert_eq!(check_health(&proxy, false, threshold), HealthAction::None);
    }
}
