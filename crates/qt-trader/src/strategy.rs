//! Strategy lifecycle: instantiation from config, enable/pause/init state,
//! event routing, parameter reload from the params directory, and order flow
//! through the executor. Strategy bodies themselves are out of scope; the
//! built-in passive strategy keeps the lifecycle exercisable.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use qt_types::{
    Bar, Order, OrderCmdRequest, OrderCmdStatus, RiskControlConfig, Signal, StrategyConfig,
    StrategyState, Symbol, Tick, Trade,
};

use crate::executor::OrderCmdExecutor;

/// A strategy implementation. All hooks default to no-ops.
#[async_trait]
pub trait Strategy: Send + Sync {
    async fn on_init(&self) -> Result<(), String> {
        Ok(())
    }
    async fn on_tick(&self, _tick: &Tick) {}
    async fn on_bar(&self, _bar: &Bar) {}
    async fn on_order(&self, _order: &Order) {}
    async fn on_trade(&self, _trade: &Trade) {}
}

/// Built-in strategy that holds position and emits nothing. Used when a
/// configured class name is unknown and in tests.
pub struct PassiveStrategy;

#[async_trait]
impl Strategy for PassiveStrategy {}

fn create_strategy(class_name: &str) -> Arc<dyn Strategy> {
    match class_name {
        "passive" => Arc::new(PassiveStrategy),
        other => {
            warn!(class_name = other, "unknown strategy class, using passive");
            Arc::new(PassiveStrategy)
        }
    }
}

struct StrategyEntry {
    state: Mutex<StrategyState>,
    strategy: Arc<dyn Strategy>,
    symbols: Vec<Symbol>,
}

/// Owns every configured strategy of one Trader.
pub struct StrategyManager {
    entries: RwLock<HashMap<String, Arc<StrategyEntry>>>,
    executor: OrderCmdExecutor,
    risk: RiskControlConfig,
    params_dir: PathBuf,
}

impl StrategyManager {
    pub fn new(
        configs: &[StrategyConfig],
        executor: OrderCmdExecutor,
        risk: RiskControlConfig,
        params_dir: PathBuf,
    ) -> Self {
        let mut entries = HashMap::new();
        for config in configs {
            let mut state = StrategyState::new(&config.strategy_id);
            state.enabled = config.enabled;
            state.params = config.params.clone();
            let symbols: Vec<Symbol> = config
                .symbols
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect();
            state.symbols = symbols.clone();
            entries.insert(
                config.strategy_id.clone(),
                Arc::new(StrategyEntry {
                    state: Mutex::new(state),
                    strategy: create_strategy(&config.class_name),
                    symbols,
                }),
            );
        }
        info!(count = entries.len(), "strategies configured");
        Self {
            entries: RwLock::new(entries),
            executor,
            risk,
            params_dir,
        }
    }

    fn entry(&self, strategy_id: &str) -> Result<Arc<StrategyEntry>, String> {
        self.entries
            .read()
            .get(strategy_id)
            .cloned()
            .ok_or_else(|| format!("unknown strategy: {strategy_id}"))
    }

    pub fn list(&self) -> Vec<StrategyState> {
        let mut states: Vec<StrategyState> = self
            .entries
            .read()
            .values()
            .map(|e| e.state.lock().clone())
            .collect();
        states.sort_by(|a, b| a.strategy_id.cmp(&b.strategy_id));
        states
    }

    pub fn get(&self, strategy_id: &str) -> Result<StrategyState, String> {
        Ok(self.entry(strategy_id)?.state.lock().clone())
    }

    /// Initialize one strategy: run its `on_init` hook and mark it inited.
    pub async fn init(&self, strategy_id: &str) -> Result<StrategyState, String> {
        let entry = self.entry(strategy_id)?;
        entry.strategy.on_init().await?;
        let mut state = entry.state.lock();
        state.inited = true;
        info!(strategy_id, "strategy initialized");
        Ok(state.clone())
    }

    /// Re-initialize every configured strategy. Returns how many succeeded.
    pub async fn replay_all(&self) -> usize {
        let ids: Vec<String> = self.entries.read().keys().cloned().collect();
        let mut succeeded = 0;
        for id in ids {
            match self.init(&id).await {
                Ok(_) => succeeded += 1,
                Err(e) => warn!(strategy_id = %id, error = %e, "strategy init failed"),
            }
        }
        succeeded
    }

    pub fn set_enabled(&self, strategy_id: &str, enabled: bool) -> Result<StrategyState, String> {
        let entry = self.entry(strategy_id)?;
        let mut state = entry.state.lock();
        state.enabled = enabled;
        info!(strategy_id, enabled, "strategy toggled");
        Ok(state.clone())
    }

    pub fn set_trading_status(
        &self,
        strategy_id: &str,
        opening_paused: Option<bool>,
        closing_paused: Option<bool>,
    ) -> Result<StrategyState, String> {
        let entry = self.entry(strategy_id)?;
        let mut state = entry.state.lock();
        if let Some(paused) = opening_paused {
            state.opening_paused = paused;
        }
        if let Some(paused) = closing_paused {
            state.closing_paused = paused;
        }
        Ok(state.clone())
    }

    /// Merge a free-form parameter patch into the in-memory state.
    pub fn update_params(&self, strategy_id: &str, patch: Value) -> Result<StrategyState, String> {
        let entry = self.entry(strategy_id)?;
        let mut state = entry.state.lock();
        match (&mut state.params, patch) {
            (Value::Object(current), Value::Object(patch)) => {
                for (key, value) in patch {
                    current.insert(key, value);
                }
            }
            (params, patch) => *params = patch,
        }
        Ok(state.clone())
    }

    pub fn update_signal(&self, strategy_id: &str, signal: Signal) -> Result<StrategyState, String> {
        let entry = self.entry(strategy_id)?;
        let mut state = entry.state.lock();
        state.signal = signal;
        Ok(state.clone())
    }

    /// Reload parameters from `<params_dir>/<strategy_id>.json`.
    pub fn reload_params(&self, strategy_id: &str) -> Result<StrategyState, String> {
        let entry = self.entry(strategy_id)?;
        let path = self.params_dir.join(format!("{strategy_id}.json"));
        let text = std::fs::read_to_string(&path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        let params: Value =
            serde_json::from_str(&text).map_err(|e| format!("bad params file: {e}"))?;
        let mut state = entry.state.lock();
        state.params = params;
        info!(strategy_id, path = %path.display(), "strategy params reloaded");
        Ok(state.clone())
    }

    /// Path checked by the opening health check.
    pub fn params_file(&self, strategy_id: &str) -> PathBuf {
        self.params_dir.join(format!("{strategy_id}.json"))
    }

    pub fn strategy_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Cmds this strategy has submitted, identified by cmd source.
    pub fn order_cmds(&self, strategy_id: &str) -> Vec<OrderCmdStatus> {
        let source = format!("strategy:{strategy_id}");
        self.executor
            .all_statuses()
            .into_iter()
            .filter(|cmd| cmd.source == source)
            .collect()
    }

    /// Submit an order cmd on behalf of a strategy. Respects the per-leg
    /// pause flags.
    pub fn send_order_cmd(
        &self,
        strategy_id: &str,
        mut request: OrderCmdRequest,
    ) -> Result<Uuid, String> {
        let entry = self.entry(strategy_id)?;
        {
            let state = entry.state.lock();
            if !state.enabled {
                return Err(format!("strategy {strategy_id} is disabled"));
            }
            let opening = request.offset == qt_types::Offset::Open;
            if opening && state.opening_paused {
                return Err(format!("strategy {strategy_id} opening is paused"));
            }
            if !opening && state.closing_paused {
                return Err(format!("strategy {strategy_id} closing is paused"));
            }
        }
        if request.max_volume_per_order <= 0 {
            request.max_volume_per_order = self.risk.max_split_volume;
        }
        if request.order_timeout <= 0.0 {
            request.order_timeout = self.risk.order_timeout;
        }
        if request.total_timeout <= 0.0 {
            request.total_timeout = self.risk.order_timeout * 10.0;
        }
        request.source = format!("strategy:{strategy_id}");
        Ok(self.executor.submit(request, None))
    }

    // -- Event routing ------------------------------------------------------

    pub async fn dispatch_tick(&self, tick: &Tick) {
        for entry in self.runnable() {
            if entry.symbols.contains(&tick.symbol) {
                entry.strategy.on_tick(tick).await;
            }
        }
    }

    pub async fn dispatch_bar(&self, bar: &Bar) {
        for entry in self.runnable() {
            if entry.symbols.contains(&bar.symbol) {
                entry.strategy.on_bar(bar).await;
            }
        }
    }

    pub async fn dispatch_order(&self, order: &Order) {
        for entry in self.runnable() {
            entry.strategy.on_order(order).await;
        }
    }

    pub async fn dispatch_trade(&self, trade: &Trade) {
        for entry in self.runnable() {
            entry.strategy.on_trade(trade).await;
        }
    }

    fn runnable(&self) -> Vec<Arc<StrategyEntry>> {
        self.entries
            .read()
            .values()
            .filter(|e| {
                let state = e.state.lock();
                state.enabled && state.inited
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::RiskControl;
    use qt_gateway::{Gateway, SimGateway};
    use qt_types::{Direction, Offset};

    fn config(strategy_id: &str, enabled: bool) -> StrategyConfig {
        StrategyConfig {
            strategy_id: strategy_id.to_string(),
            class_name: "passive".to_string(),
            symbols: vec!["SHFE.rb2505".to_string()],
            enabled,
            params: serde_json::json!({"window": 20}),
        }
    }

    async fn manager(params_dir: PathBuf) -> StrategyManager {
        let gateway = SimGateway::new("ACC");
        gateway.connect().await.unwrap();
        let risk = Arc::new(RiskControl::new(RiskControlConfig::default()));
        let executor = OrderCmdExecutor::new(Arc::new(gateway), risk);
        StrategyManager::new(
            &[config("S1", true), config("S2", false)],
            executor,
            RiskControlConfig::default(),
            params_dir,
        )
    }

    #[tokio::test]
    async fn lifecycle_flags() {
        let manager = manager(PathBuf::from("/nonexistent")).await;
        assert_eq!(manager.list().len(), 2);

        let state = manager.init("S1").await.unwrap();
        assert!(state.inited);

        let state = manager
            .set_trading_status("S1", Some(true), None)
            .unwrap();
        assert!(state.opening_paused);
        assert!(!state.closing_paused);

        let state = manager.set_enabled("S2", true).unwrap();
        assert!(state.enabled);
        assert!(manager.get("missing").is_err());
    }

    #[tokio::test]
    async fn params_merge_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path().to_path_buf()).await;

        let state = manager
            .update_params("S1", serde_json::json!({"threshold": 1.5}))
            .unwrap();
        assert_eq!(state.params["window"], 20);
        assert_eq!(state.params["threshold"], 1.5);

        std::fs::write(
            dir.path().join("S1.json"),
            r#"{"window": 40, "fresh": true}"#,
        )
        .unwrap();
        let state = manager.reload_params("S1").unwrap();
        assert_eq!(state.params["window"], 40);
        assert!(manager.reload_params("S2").is_err());
    }

    #[tokio::test]
    async fn order_cmds_respect_pause_flags() {
        let manager = manager(PathBuf::from("/nonexistent")).await;
        let request = OrderCmdRequest {
            symbol: "SHFE.rb2505".parse().unwrap(),
            direction: Direction::Buy,
            offset: Offset::Open,
            volume: 2,
            price: Some(3500.0),
            max_volume_per_order: 0,
            order_interval: 0.05,
            total_timeout: 0.0,
            order_timeout: 0.0,
            source: String::new(),
        };

        // Disabled strategy refuses.
        assert!(manager.send_order_cmd("S2", request.clone()).is_err());

        manager.set_trading_status("S1", Some(true), None).unwrap();
        assert!(manager.send_order_cmd("S1", request.clone()).is_err());
        manager.set_trading_status("S1", Some(false), None).unwrap();

        let cmd_id = manager.send_order_cmd("S1", request).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let cmds = manager.order_cmds("S1");
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].cmd_id, cmd_id);
        assert_eq!(cmds[0].source, "strategy:S1");
        assert!(manager.order_cmds("S2").is_empty());
    }
}
