//! Concrete scheduler job bodies: pre/post-market gateway control, position
//! export, rotation scan/run/verify, alarm cleanup, and the opening and
//! closing health checks.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Local, Utc};
use serde_json::json;
use tracing::{info, warn};

use qt_gateway::Gateway;
use qt_store::Store;
use qt_types::{InstructionStatus, ParamType, SystemParam};

use crate::alarm::AlarmSink;
use crate::export::export_positions;
use crate::rotation::RotationEngine;
use crate::scheduler::JobRunner;
use crate::strategy::StrategyManager;

/// Alarm retention window for `cleanup_old_alarms`.
const ALARM_RETENTION_DAYS: i64 = 3;

/// Holds everything the job bodies touch.
pub struct JobManager {
    account_id: String,
    gateway: Arc<dyn Gateway>,
    rotation: Arc<RotationEngine>,
    store: Arc<Store>,
    strategies: Arc<StrategyManager>,
    alarm: AlarmSink,
    export_dir: PathBuf,
}

impl JobManager {
    pub fn new(
        account_id: &str,
        gateway: Arc<dyn Gateway>,
        rotation: Arc<RotationEngine>,
        store: Arc<Store>,
        strategies: Arc<StrategyManager>,
        alarm: AlarmSink,
        export_dir: PathBuf,
    ) -> Self {
        Self {
            account_id: account_id.to_string(),
            gateway,
            rotation,
            store,
            strategies,
            alarm,
            export_dir,
        }
    }

    async fn pre_market_connect(&self) -> Result<(), String> {
        if self.gateway.is_connected() {
            info!("gateway already connected, skipping pre-market connect");
            return Ok(());
        }
        match self.gateway.connect().await {
            Ok(()) => {
                info!("pre-market gateway connect done");
                Ok(())
            }
            Err(e) => {
                self.alarm
                    .raise("pre_market_connect", "盘前连接失败", &e.to_string())
                    .await;
                Err(e.to_string())
            }
        }
    }

    async fn post_market_disconnect(&self) -> Result<(), String> {
        if !self.gateway.is_connected() {
            return Ok(());
        }
        self.gateway.disconnect().await.map_err(|e| e.to_string())
    }

    async fn post_market_export(&self) -> Result<(), String> {
        let positions = self.gateway.get_positions();
        let account_id = self.account_id.clone();
        let export_dir = self.export_dir.clone();
        tokio::task::spawn_blocking(move || {
            export_positions(&account_id, &export_dir, &positions).map(|_| ())
        })
        .await
        .map_err(|e| e.to_string())?
        .map_err(|e| e.to_string())
    }

    async fn scan_orders(&self) -> Result<(), String> {
        let rotation = self.rotation.clone();
        tokio::task::spawn_blocking(move || rotation.scan_inbox())
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn execute_position_rotation(&self) -> Result<(), String> {
        self.rotation.execute(false).await;
        Ok(())
    }

    async fn cleanup_old_alarms(&self) -> Result<(), String> {
        let store = self.store.clone();
        let cutoff = Utc::now() - ChronoDuration::days(ALARM_RETENTION_DAYS);
        let deleted = tokio::task::spawn_blocking(move || store.delete_alarms_before(cutoff))
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())?;
        if deleted > 0 {
            info!(deleted, "old alarms cleaned up");
        }
        Ok(())
    }

    /// Pre-open verification: gateway connectivity, today's rotation import,
    /// and presence of every strategy's params file. Misses raise alarms but
    /// the job itself still succeeds.
    async fn opening_check(&self) -> Result<(), String> {
        if !self.gateway.is_connected() {
            self.alarm
                .raise("opening_check", "开盘检查:网关未连接", "")
                .await;
        }

        let today = Local::now().format("%Y%m%d").to_string();
        let store = self.store.clone();
        let date = today.clone();
        let imported =
            tokio::task::spawn_blocking(move || store.instructions_by_date(&date))
                .await
                .map_err(|e| e.to_string())?
                .map_err(|e| e.to_string())?;
        if imported.is_empty() {
            self.alarm
                .raise(
                    "opening_check",
                    "开盘检查:当日换仓指令未导入",
                    &format!("trading_date={today}"),
                )
                .await;
        }

        let missing: Vec<String> = self
            .strategies
            .strategy_ids()
            .into_iter()
            .filter(|id| !self.strategies.params_file(id).exists())
            .collect();
        if !missing.is_empty() {
            self.alarm
                .raise(
                    "opening_check",
                    "开盘检查:策略参数文件缺失",
                    &missing.join(","),
                )
                .await;
        }
        Ok(())
    }

    /// Post-close bookkeeping: export positions and persist the strategy
    /// position snapshot as a system parameter.
    async fn closing_process(&self) -> Result<(), String> {
        self.post_market_export().await?;

        let snapshot: Vec<serde_json::Value> = self
            .strategies
            .list()
            .into_iter()
            .map(|s| {
                json!({
                    "strategy_id": s.strategy_id,
                    "pos_long": s.pos_long,
                    "pos_short": s.pos_short,
                    "pos_price": s.pos_price,
                })
            })
            .collect();
        let param = SystemParam::new(
            "strategy.position_snapshot",
            &serde_json::to_string(&snapshot).unwrap_or_default(),
            ParamType::String,
            "strategy",
            "strategy positions at close",
        );
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.set_system_param(&param))
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())
    }

    /// Alarm if any of today's instructions is still not COMPLETED.
    async fn check_rotation_result(&self) -> Result<(), String> {
        let today = Local::now().format("%Y%m%d").to_string();
        let store = self.store.clone();
        let date = today.clone();
        let instructions =
            tokio::task::spawn_blocking(move || store.instructions_by_date(&date))
                .await
                .map_err(|e| e.to_string())?
                .map_err(|e| e.to_string())?;

        let unfinished: Vec<String> = instructions
            .iter()
            .filter(|i| i.enabled && i.status != InstructionStatus::Completed)
            .map(|i| {
                format!(
                    "{} {:?} remaining {}",
                    i.symbol, i.status, i.remaining_volume
                )
            })
            .collect();
        if unfinished.is_empty() {
            info!(trading_date = %today, "all rotation instructions completed");
        } else {
            self.alarm
                .raise(
                    "check_rotation_result",
                    "换仓结果检查:存在未完成指令",
                    &unfinished.join("; "),
                )
                .await;
        }
        Ok(())
    }
}

impl JobRunner for Arc<JobManager> {
    fn run(&self, method: &str) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send>> {
        let manager = self.clone();
        let method = method.to_string();
        Box::pin(async move {
            match method.as_str() {
                "pre_market_connect" => manager.pre_market_connect().await,
                "post_market_disconnect" => manager.post_market_disconnect().await,
                "post_market_export" => manager.post_market_export().await,
                "scan_orders" => manager.scan_orders().await,
                "execute_position_rotation" => manager.execute_position_rotation().await,
                "cleanup_old_alarms" => manager.cleanup_old_alarms().await,
                "opening_check" => manager.opening_check().await,
                "closing_process" => manager.closing_process().await,
                "check_rotation_result" => manager.check_rotation_result().await,
                other => {
                    warn!(method = other, "unknown job method");
                    Err(format!("unknown job method: {other}"))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::OrderCmdExecutor;
    use crate::risk::RiskControl;
    use qt_event::EventEngine;
    use qt_gateway::SimGateway;
    use qt_types::{ImportMode, RiskControlConfig};

    async fn manager_with(gateway: SimGateway) -> (Arc<JobManager>, Arc<Store>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            Store::open_in_memory("ACC", &RiskControlConfig::default()).unwrap(),
        );
        let risk = Arc::new(RiskControl::new(RiskControlConfig::default()));
        let executor = OrderCmdExecutor::new(Arc::new(gateway.clone()), risk);
        let rotation = Arc::new(RotationEngine::new(
            "ACC",
            store.clone(),
            executor.clone(),
            RiskControlConfig::default(),
            dir.path().join("inbox"),
        ));
        let strategies = Arc::new(StrategyManager::new(
            &[],
            executor,
            RiskControlConfig::default(),
            dir.path().join("params"),
        ));
        let engine = EventEngine::start();
        let alarm = AlarmSink::new("ACC", store.clone(), engine);
        let manager = Arc::new(JobManager::new(
            "ACC",
            Arc::new(gateway),
            rotation,
            store.clone(),
            strategies,
            alarm,
            dir.path().join("export"),
        ));
        (manager, store, dir)
    }

    #[tokio::test]
    async fn pre_market_connect_when_disconnected() {
        let gateway = SimGateway::new("ACC");
        let (manager, _store, _dir) = manager_with(gateway.clone()).await;

        manager.run("pre_market_connect").await.unwrap();
        assert!(gateway.is_connected());
        // Idempotent when already connected.
        manager.run("pre_market_connect").await.unwrap();

        manager.run("post_market_disconnect").await.unwrap();
        assert!(!gateway.is_connected());
    }

    #[tokio::test]
    async fn failed_connect_raises_alarm() {
        let gateway = SimGateway::new("ACC");
        gateway.set_connect_fails(true);
        let (manager, store, _dir) = manager_with(gateway).await;

        assert!(manager.run("pre_market_connect").await.is_err());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(store.count_alarms().unwrap(), 1);
    }

    #[tokio::test]
    async fn opening_check_flags_missing_import() {
        let gateway = SimGateway::new("ACC");
        let (manager, store, _dir) = manager_with(gateway).await;

        manager.run("opening_check").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        // Gateway disconnected + no import today.
        assert_eq!(store.count_alarms().unwrap(), 2);
    }

    #[tokio::test]
    async fn check_rotation_result_alarms_on_unfinished() {
        let gateway = SimGateway::new("ACC");
        let (manager, store, _dir) = manager_with(gateway).await;

        let today = Local::now().format("%Y%m%d").to_string();
        let csv = "account_id,strategy_id,instrument,offset,direction,volume\n\
                   ACC,S1,DCE.i2505,Open,Buy,2\n";
        manager
            .rotation
            .import_csv(csv, &format!("{today}_ACC.csv"), ImportMode::Replace)
            .unwrap();

        manager.run("check_rotation_result").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(store.count_alarms().unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_method_is_error() {
        let gateway = SimGateway::new("ACC");
        let (manager, _store, _dir) = manager_with(gateway).await;
        assert!(manager.run("nope").await.is_err());
    }
}
