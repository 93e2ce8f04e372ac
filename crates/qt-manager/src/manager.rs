//! The Manager itself: loads the config once, builds a TraderProxy per
//! account (enabled and disabled), supervises the enabled Traders, stores
//! fanned-in alarms, and shuts everything down on signal.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use qt_event::{EventData, EventEngine, EventType};
use qt_store::Store;
use qt_types::{AlarmData, AppConfig, RiskControlConfig};

use crate::proxy::{TraderProxy, TraderState};
use crate::supervisor::{
    check_health, raise_alarm, spawn_trader, stop_trader, HealthAction, RestartPolicy,
    TraderProcess,
};

/// Health loop cadence.
const HEALTH_INTERVAL: Duration = Duration::from_secs(5);

struct ManagerInner {
    config: AppConfig,
    config_path: PathBuf,
    engine: EventEngine,
    proxies: HashMap<String, Arc<TraderProxy>>,
    policies: HashMap<String, RestartPolicy>,
    processes: Mutex<HashMap<String, TraderProcess>>,
    store: Option<Arc<Store>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The Manager process facade.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Manager {
    pub fn new(config: AppConfig, config_path: &Path) -> anyhow::Result<Self> {
        let engine = EventEngine::start();

        let mut proxies = HashMap::new();
        let mut policies = HashMap::new();
        for account in &config.accounts {
            proxies.insert(
                account.account_id.clone(),
                TraderProxy::new(account.clone(), engine.clone()),
            );
            policies.insert(
                account.account_id.clone(),
                RestartPolicy::from_config(&config.supervision),
            );
        }

        let store = match &config.manager.database {
            Some(path) => Some(Arc::new(Store::open(
                path,
                "manager",
                &RiskControlConfig::default(),
            )?)),
            None => None,
        };

        let manager = Self {
            inner: Arc::new(ManagerInner {
                config,
                config_path: config_path.to_path_buf(),
                engine,
                proxies,
                policies,
                processes: Mutex::new(HashMap::new()),
                store,
                tasks: Mutex::new(Vec::new()),
            }),
        };
        manager.wire_alarm_store();
        Ok(manager)
    }

    /// The manager-global event engine; the API layer subscribes here for
    /// WebSocket fan-out.
    pub fn engine(&self) -> &EventEngine {
        &self.inner.engine
    }

    pub fn proxy(&self, account_id: &str) -> Option<Arc<TraderProxy>> {
        self.inner.proxies.get(account_id).cloned()
    }

    pub fn statuses(&self) -> Vec<Value> {
        let mut rows: Vec<Value> = self.inner.proxies.values().map(|p| p.status()).collect();
        rows.sort_by_key(|row| row["account_id"].as_str().unwrap_or_default().to_string());
        rows
    }

    /// Persist every alarm that reaches the manager engine, whether from a
    /// Trader push (account-tagged raw) or the supervisor itself.
    fn wire_alarm_store(&self) {
        let Some(store) = self.inner.store.clone() else {
            return;
        };
        self.inner
            .engine
            .register_fn(EventType::AlarmUpdate, "alarm-store", move |event| {
                let store = store.clone();
                async move {
                    let alarm: Option<AlarmData> = match event.data.as_ref() {
                        EventData::Alarm(alarm) => Some(alarm.clone()),
                        EventData::Raw(value) => value
                            .get("data")
                            .cloned()
                            .and_then(|v| serde_json::from_value(v).ok()),
                        _ => None,
                    };
                    let Some(alarm) = alarm else { return Ok(()) };
                    tokio::task::spawn_blocking(move || store.insert_alarm(&alarm))
                        .await
                        .map_err(|e| e.to_string())?
                        .map_err(|e| e.to_string())
                }
            });
    }

    /// Start every enabled Trader and the health loop.
    pub async fn start(&self) -> anyhow::Result<()> {
        let enabled: Vec<String> = self
            .inner
            .config
            .accounts
            .iter()
            .filter(|a| a.enabled)
            .map(|a| a.account_id.clone())
            .collect();
        info!(count = enabled.len(), "starting enabled traders");
        for account_id in enabled {
            if let Err(e) = self.start_trader(&account_id) {
                error!(account_id = %account_id, error = %e, "trader start failed");
                raise_alarm(&self.inner.engine, &account_id, "Trader启动失败", &e.to_string());
            }
        }
        self.spawn_health_loop();
        Ok(())
    }

    /// Spawn one Trader subprocess and dial its socket.
    pub fn start_trader(&self, account_id: &str) -> anyhow::Result<()> {
        let proxy = self
            .proxy(account_id)
            .ok_or_else(|| anyhow::anyhow!("unknown account: {account_id}"))?;
        if matches!(proxy.state(), TraderState::Starting | TraderState::Running) {
            anyhow::bail!("trader {account_id} already running");
        }
        let process = spawn_trader(proxy.config(), &self.inner.config_path)?;
        proxy.mark_started(process.pid);
        self.inner
            .processes
            .lock()
            .insert(account_id.to_string(), process);
        proxy.connect_unix();
        Ok(())
    }

    /// Stop one Trader: SIGTERM, bounded wait, SIGKILL.
    pub async fn stop_trader(&self, account_id: &str) {
        let Some(proxy) = self.proxy(account_id) else {
            return;
        };
        proxy.set_state(TraderState::Stopping);
        proxy.disconnect().await;

        let process = self.inner.processes.lock().remove(account_id);
        if let Some(mut process) = process {
            let timeout = Duration::from_secs(self.inner.config.supervision.stop_timeout_secs);
            stop_trader(&mut process, timeout).await;
        }
        proxy.set_pid(None);
        proxy.set_state(TraderState::Stopped);
        let _ = std::fs::remove_file(proxy.config().pid_file());
    }

    fn spawn_health_loop(&self) {
        let manager = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEALTH_INTERVAL);
            loop {
                ticker.tick().await;
                manager.health_tick().await;
            }
        });
        self.inner.tasks.lock().push(task);
    }

    async fn health_tick(&self) {
        let threshold =
            Duration::from_secs(self.inner.config.supervision.degraded_threshold_secs);
        let account_ids: Vec<String> = self.inner.proxies.keys().cloned().collect();

        for account_id in account_ids {
            let Some(proxy) = self.proxy(&account_id) else {
                continue;
            };
            let process_alive = {
                let mut processes = self.inner.processes.lock();
                match processes.get_mut(&account_id) {
                    Some(process) => match process.child.try_wait() {
                        Ok(None) => true,
                        Ok(Some(status)) => {
                            warn!(account_id = %account_id, %status, "trader exited");
                            false
                        }
                        Err(_) => false,
                    },
                    None => false,
                }
            };

            if check_health(&proxy, process_alive, threshold) == HealthAction::Restart {
                self.restart_trader(&account_id).await;
            }
        }
    }

    async fn restart_trader(&self, account_id: &str) {
        let Some(proxy) = self.proxy(account_id) else {
            return;
        };
        let allowed = self
            .inner
            .policies
            .get(account_id)
            .map(|policy| policy.allow())
            .unwrap_or(false);
        if !allowed {
            error!(account_id, "restart cap exhausted, parking trader");
            self.stop_trader(account_id).await;
            raise_alarm(
                &self.inner.engine,
                account_id,
                "Trader重启次数超限",
                &format!(
                    "more than {} restarts in {}s",
                    self.inner.config.supervision.max_restarts,
                    self.inner.config.supervision.restart_window_secs
                ),
            );
            return;
        }

        let restarts = proxy.bump_restart_count();
        info!(account_id, restarts, "restarting trader");
        self.stop_trader(account_id).await;
        if let Err(e) = self.start_trader(account_id) {
            error!(account_id, error = %e, "restart failed");
            raise_alarm(&self.inner.engine, account_id, "Trader重启失败", &e.to_string());
        }
    }

    /// Graceful shutdown: stop Traders concurrently, then the engine.
    pub async fn shutdown(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }

        let account_ids: Vec<String> = self.inner.proxies.keys().cloned().collect();
        let mut waits = Vec::new();
        for account_id in account_ids {
            let manager = self.clone();
            waits.push(tokio::spawn(async move {
                manager.stop_trader(&account_id).await;
            }));
        }
        for wait in waits {
            let _ = wait.await;
        }

        self.inner.engine.stop().await;
        info!("manager shut down");
    }
}
