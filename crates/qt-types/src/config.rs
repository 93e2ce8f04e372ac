use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::TypeError;

/// Brokerage credentials for one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Credentials {
    #[serde(default)]
    pub broker_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub td_address: String,
    #[serde(default)]
    pub md_address: String,
}

/// Filesystem layout for one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    pub database: PathBuf,
    pub logs: PathBuf,
    pub export: PathBuf,
    /// Inbox scanned for rotation CSV drops.
    pub csv_inbox: PathBuf,
    /// Directory holding per-strategy parameter files.
    pub params: PathBuf,
}

/// Risk-control limits, enforced at `order_req` entry and per executor slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskControlConfig {
    pub max_daily_orders: i64,
    pub max_daily_cancels: i64,
    /// Largest volume accepted for a single order.
    pub max_order_volume: i64,
    /// Largest slice the executor will issue per child order.
    pub max_split_volume: i64,
    /// Seconds a child order may stay unfilled before cancel.
    pub order_timeout: f64,
}

impl Default for RiskControlConfig {
    fn default() -> Self {
        Self {
            max_daily_orders: 500,
            max_daily_cancels: 500,
            max_order_volume: 100,
            max_split_volume: 10,
            order_timeout: 10.0,
        }
    }
}

/// One configured strategy instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub strategy_id: String,
    /// Registered strategy kind, resolved by the StrategyManager.
    pub class_name: String,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub enabled: bool,
    /// Free-form initial parameters.
    #[serde(default)]
    pub params: Value,
}

/// One scheduler entry in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_id: String,
    pub job_name: String,
    #[serde(default = "default_job_group")]
    pub job_group: String,
    #[serde(default)]
    pub job_description: String,
    pub cron_expression: String,
    pub job_method: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_job_group() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

/// Scheduler section of the config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
}

/// Static per-account settings. Created at Manager start from the config
/// file and immutable during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountConfig {
    pub account_id: String,
    #[serde(default)]
    pub credentials: Credentials,
    pub paths: PathsConfig,
    #[serde(default)]
    pub risk_control: RiskControlConfig,
    #[serde(default)]
    pub strategies: Vec<StrategyConfig>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Directory where the trader binds its Unix socket.
    pub socket_dir: PathBuf,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl AccountConfig {
    /// Socket path the Trader binds and the Manager dials.
    pub fn socket_path(&self) -> PathBuf {
        self.socket_dir
            .join(format!("qtrader_{}.sock", self.account_id))
    }

    /// Pid file written by the Manager when spawning the Trader.
    pub fn pid_file(&self) -> PathBuf {
        self.socket_dir
            .join(format!("qtrader_{}.pid", self.account_id))
    }
}

/// HTTP/WebSocket API bind address. The API surface itself lives outside
/// this workspace; the address is carried so the Manager can hand it over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

/// Manager supervision tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisionConfig {
    /// Restarts allowed inside the rolling window before the account parks.
    pub max_restarts: u32,
    /// Rolling window, seconds.
    pub restart_window_secs: u64,
    /// Seconds DEGRADED may persist before a forced restart.
    pub degraded_threshold_secs: u64,
    /// Seconds to wait for graceful stop before SIGKILL.
    pub stop_timeout_secs: u64,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            restart_window_secs: 600,
            degraded_threshold_secs: 120,
            stop_timeout_secs: 10,
        }
    }
}

/// Manager-process paths. The manager database holds alarms fanned in from
/// every account; it is disjoint from the per-account trader databases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ManagerConfig {
    #[serde(default)]
    pub database: Option<PathBuf>,
}

/// Top-level config file: `accounts[]` plus shared sections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub supervision: SupervisionConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
}

impl AppConfig {
    /// Load and validate the YAML config file. Loaded once at Manager start;
    /// never reloaded at runtime.
    pub fn load(path: &Path) -> Result<Self, TypeError> {
        let text = std::fs::read_to_string(path).map_err(|e| TypeError::ConfigIo {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let config: AppConfig =
            serde_yaml::from_str(&text).map_err(|e| TypeError::ConfigParse {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn account(&self, account_id: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.account_id == account_id)
    }

    fn validate(&self) -> Result<(), TypeError> {
        let mut seen = std::collections::HashSet::new();
        for account in &self.accounts {
            if account.account_id.is_empty() {
                return Err(TypeError::ConfigInvalid {
                    message: "account_id must not be empty".to_string(),
                });
            }
            if !seen.insert(&account.account_id) {
                return Err(TypeError::ConfigInvalid {
                    message: format!("duplicate account_id: {}", account.account_id),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
accounts:
  - account_id: ACC1
    paths:
      database: /tmp/qt/acc1/qt.db
      logs: /tmp/qt/acc1/logs
      export: /tmp/qt/acc1/export
      csv_inbox: /tmp/qt/acc1/inbox
      params: /tmp/qt/acc1/params
    socket_dir: /tmp/qt/sock
    risk_control:
      max_daily_orders: 200
      max_daily_cancels: 100
      max_order_volume: 50
      max_split_volume: 5
      order_timeout: 8.0
    scheduler:
      jobs:
        - job_id: j1
          job_name: pre-market connect
          cron_expression: "0 45 8 * * 1-5"
          job_method: pre_market_connect
  - account_id: ACC2
    enabled: false
    paths:
      database: /tmp/qt/acc2/qt.db
      logs: /tmp/qt/acc2/logs
      export: /tmp/qt/acc2/export
      csv_inbox: /tmp/qt/acc2/inbox
      params: /tmp/qt/acc2/params
    socket_dir: /tmp/qt/sock
api:
  host: 0.0.0.0
  port: 9100
"#;

    #[test]
    fn loads_sample_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = AppConfig::load(file.path()).unwrap();

        assert_eq!(config.accounts.len(), 2);
        let acc1 = config.account("ACC1").unwrap();
        assert!(acc1.enabled);
        assert_eq!(acc1.risk_control.max_split_volume, 5);
        assert_eq!(acc1.scheduler.jobs.len(), 1);
        assert_eq!(
            acc1.socket_path().to_str().unwrap(),
            "/tmp/qt/sock/qtrader_ACC1.sock"
        );
        assert!(!config.account("ACC2").unwrap().enabled);
        assert_eq!(config.api.port, 9100);
        assert_eq!(config.supervision.max_restarts, 5);
    }

    #[test]
    fn rejects_duplicate_accounts() {
        let text = SAMPLE.replace("ACC2", "ACC1");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        assert!(AppConfig::load(file.path()).is_err());
    }
}
