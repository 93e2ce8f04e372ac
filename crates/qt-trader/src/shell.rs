//! The Trader process shell: wires database, event engine, IPC server,
//! alarms, gateway, persistence, rotation, scheduler, and strategies
//! together, and implements every account-scoped RPC the Manager routes in.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Local;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::{info, warn};

use qt_event::{EventData, EventEngine, EventType};
use qt_gateway::{Gateway, GatewayCallback};
use qt_ipc::{HandlerRegistry, SocketServer};
use qt_store::Store;
use qt_types::{
    Account, AccountConfig, Bar, CancelRequest, Contract, ImportMode, Order, OrderCmdRequest,
    OrderRequest, ParamType, Position, Signal, Symbol, SystemParam, Tick, Trade,
};

use crate::alarm::AlarmSink;
use crate::executor::OrderCmdExecutor;
use crate::jobs::JobManager;
use crate::persist;
use crate::risk::RiskControl;
use crate::rotation::RotationEngine;
use crate::scheduler::TaskScheduler;
use crate::strategy::StrategyManager;

/// Everything the request handlers touch. Built once, shared as an `Arc`.
pub struct TraderCore {
    config: AccountConfig,
    engine: EventEngine,
    store: Arc<Store>,
    gateway: Arc<dyn Gateway>,
    risk: Arc<RiskControl>,
    executor: OrderCmdExecutor,
    rotation: Arc<RotationEngine>,
    scheduler: Arc<TaskScheduler>,
    strategies: Arc<StrategyManager>,
    alarm: AlarmSink,
    paused: AtomicBool,
    alert_wechat: RwLock<String>,
}

/// The per-account Trader process.
pub struct Trader {
    core: Arc<TraderCore>,
    server: Arc<SocketServer>,
}

/// Republishes gateway callbacks onto the event engine. Strategies and the
/// executor are never invoked inline from the gateway.
struct EventBridge {
    engine: EventEngine,
    store: Arc<Store>,
}

#[async_trait::async_trait]
impl GatewayCallback for EventBridge {
    async fn on_tick(&self, tick: Tick) {
        self.engine.emit(EventType::TickUpdate, EventData::Tick(tick));
    }
    async fn on_bar(&self, bar: Bar) {
        self.engine.emit(EventType::BarUpdate, EventData::Bar(bar));
    }
    async fn on_order(&self, order: Order) {
        self.engine.emit(EventType::OrderUpdate, EventData::Order(order));
    }
    async fn on_trade(&self, trade: Trade) {
        self.engine.emit(EventType::TradeUpdate, EventData::Trade(trade));
    }
    async fn on_position(&self, position: Position) {
        self.engine
            .emit(EventType::PositionUpdate, EventData::Position(position));
    }
    async fn on_account(&self, account: Account) {
        self.engine
            .emit(EventType::AccountUpdate, EventData::Account(account));
    }
    async fn on_contract(&self, contract: Contract) {
        let store = self.store.clone();
        let result =
            tokio::task::spawn_blocking(move || store.upsert_contract(&contract)).await;
        if let Ok(Err(e)) = result {
            warn!(error = %e, "contract upsert failed");
        }
    }
    async fn on_connection(&self, connected: bool) {
        self.engine.emit(
            EventType::AccountStatus,
            EventData::Raw(json!({"gateway_connected": connected})),
        );
    }
}

impl Trader {
    /// Build the full component graph in dependency order. Nothing is
    /// running yet; `start` binds the socket and starts the scheduler.
    pub fn build(config: AccountConfig, gateway: Arc<dyn Gateway>) -> anyhow::Result<Self> {
        let account_id = config.account_id.clone();

        // Database first: everything downstream persists through it.
        let store = Arc::new(Store::open(
            &config.paths.database,
            &account_id,
            &config.risk_control,
        )?);

        let engine = EventEngine::start();
        let alarm = AlarmSink::new(&account_id, store.clone(), engine.clone());

        let risk = Arc::new(RiskControl::new(config.risk_control.clone()));
        let executor = OrderCmdExecutor::new(gateway.clone(), risk.clone());
        let rotation = Arc::new(RotationEngine::new(
            &account_id,
            store.clone(),
            executor.clone(),
            config.risk_control.clone(),
            config.paths.csv_inbox.clone(),
        ));
        let strategies = Arc::new(StrategyManager::new(
            &config.strategies,
            executor.clone(),
            config.risk_control.clone(),
            config.paths.params.clone(),
        ));
        let jobs = Arc::new(JobManager::new(
            &account_id,
            gateway.clone(),
            rotation.clone(),
            store.clone(),
            strategies.clone(),
            alarm.clone(),
            config.paths.export.clone(),
        ));
        let scheduler = Arc::new(TaskScheduler::new(Arc::new(jobs)));
        scheduler.load_jobs(&config.scheduler.jobs);

        let core = Arc::new(TraderCore {
            config,
            engine,
            store,
            gateway,
            risk,
            executor,
            rotation,
            scheduler,
            strategies,
            alarm,
            paused: AtomicBool::new(false),
            alert_wechat: RwLock::new(String::new()),
        });

        // IPC server over the explicit handler registry.
        let mut registry = HandlerRegistry::new();
        register_handlers(core.clone(), &mut registry);
        let server = Arc::new(SocketServer::new(
            &core.config.account_id,
            Arc::new(registry),
        ));

        Ok(Self { core, server })
    }

    pub fn core(&self) -> &Arc<TraderCore> {
        &self.core
    }

    /// Wire event subscriptions, bind the Unix socket, and start jobs and
    /// strategies.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.wire_events();
        let socket_path = self.core.config.socket_path();
        self.server.serve_unix(&socket_path).await?;
        self.write_pid_file()?;
        self.finish_start().await;
        Ok(())
    }

    /// Test entry: same wiring, TCP transport.
    pub async fn start_tcp(&self, addr: &str) -> anyhow::Result<std::net::SocketAddr> {
        self.wire_events();
        let local = self.server.serve_tcp(addr).await?;
        self.finish_start().await;
        Ok(local)
    }

    async fn finish_start(&self) {
        self.core.scheduler.start();
        self.persist_jobs().await;
        // Initialize strategies enabled in config.
        let enabled: Vec<String> = self
            .core
            .strategies
            .list()
            .into_iter()
            .filter(|s| s.enabled)
            .map(|s| s.strategy_id)
            .collect();
        for strategy_id in enabled {
            if let Err(e) = self.core.strategies.init(&strategy_id).await {
                self.core
                    .alarm
                    .raise("strategy", "策略初始化失败", &format!("{strategy_id}: {e}"))
                    .await;
            }
        }
        info!(account_id = %self.core.config.account_id, "trader started");
    }

    fn write_pid_file(&self) -> std::io::Result<()> {
        let pid_file = self.core.config.pid_file();
        if let Some(parent) = pid_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&pid_file, std::process::id().to_string())
    }

    async fn persist_jobs(&self) {
        let jobs = self.core.scheduler.list_jobs();
        let store = self.core.store.clone();
        let _ = tokio::task::spawn_blocking(move || {
            for job in &jobs {
                if let Err(e) = store.upsert_job(job) {
                    warn!(job_id = %job.job_id, error = %e, "job persist failed");
                }
            }
        })
        .await;
    }

    /// Subscribe the executor, strategies, persistence writer, and the IPC
    /// push fan-out to the event engine.
    fn wire_events(&self) {
        let engine = &self.core.engine;
        persist::register(engine, self.core.store.clone());

        self.core
            .gateway
            .register_callback(Arc::new(EventBridge {
                engine: engine.clone(),
                store: self.core.store.clone(),
            }));

        // Order updates feed the executor first, then strategies, then the
        // push stream; registration order is delivery order.
        let executor = self.core.executor.clone();
        engine.register_fn(EventType::OrderUpdate, "executor", move |event| {
            let executor = executor.clone();
            async move {
                if let EventData::Order(order) = event.data.as_ref() {
                    executor.on_order_update(order);
                }
                Ok(())
            }
        });

        let strategies = self.core.strategies.clone();
        engine.register_fn(EventType::OrderUpdate, "strategies-order", move |event| {
            let strategies = strategies.clone();
            async move {
                if let EventData::Order(order) = event.data.as_ref() {
                    strategies.dispatch_order(order).await;
                }
                Ok(())
            }
        });
        let strategies = self.core.strategies.clone();
        engine.register_fn(EventType::TradeUpdate, "strategies-trade", move |event| {
            let strategies = strategies.clone();
            async move {
                if let EventData::Trade(trade) = event.data.as_ref() {
                    strategies.dispatch_trade(trade).await;
                }
                Ok(())
            }
        });
        let strategies = self.core.strategies.clone();
        engine.register_fn(EventType::TickUpdate, "strategies-tick", move |event| {
            let strategies = strategies.clone();
            async move {
                if let EventData::Tick(tick) = event.data.as_ref() {
                    strategies.dispatch_tick(tick).await;
                }
                Ok(())
            }
        });
        let strategies = self.core.strategies.clone();
        engine.register_fn(EventType::BarUpdate, "strategies-bar", move |event| {
            let strategies = strategies.clone();
            async move {
                if let EventData::Bar(bar) = event.data.as_ref() {
                    strategies.dispatch_bar(bar).await;
                }
                Ok(())
            }
        });

        // Push fan-out to the Manager.
        for (event_type, kind) in [
            (EventType::AccountUpdate, "account"),
            (EventType::OrderUpdate, "order"),
            (EventType::TradeUpdate, "trade"),
            (EventType::PositionUpdate, "position"),
            (EventType::TickUpdate, "tick"),
            (EventType::AlarmUpdate, "alarm"),
            (EventType::AccountStatus, "account"),
        ] {
            let server = self.server.clone();
            self.core.engine.register_fn(event_type, kind, move |event| {
                let server = server.clone();
                async move {
                    let payload = serde_json::to_value(event.data.as_ref())
                        .map_err(|e| e.to_string())?;
                    server.push(kind, payload);
                    Ok(())
                }
            });
        }
    }

    /// Graceful stop: scheduler, server, gateway, engine, in that order.
    pub async fn stop(&self) {
        self.core.scheduler.stop();
        self.server.stop().await;
        if self.core.gateway.is_connected() {
            let _ = self.core.gateway.disconnect().await;
        }
        self.core.engine.stop().await;
        let _ = std::fs::remove_file(self.core.config.pid_file());
        info!(account_id = %self.core.config.account_id, "trader stopped");
    }
}

/// Insert every request op into the registry. Explicit entries instead of
/// reflection keep the handler map static and greppable.
fn register_handlers(core: Arc<TraderCore>, registry: &mut HandlerRegistry) {
    macro_rules! op {
        ($name:literal, $method:ident) => {{
            let core = core.clone();
            registry.register($name, move |data| {
                let core = core.clone();
                async move { core.$method(data).await }
            });
        }};
    }

    op!("connect_gateway", req_connect_gateway);
    op!("disconnect_gateway", req_disconnect_gateway);
    op!("pause_trading", req_pause_trading);
    op!("resume_trading", req_resume_trading);
    op!("subscribe", req_subscribe);
    op!("unsubscribe", req_unsubscribe);
    op!("update_alert_wechat", req_update_alert_wechat);
    op!("get_alert_wechat", req_get_alert_wechat);

    op!("get_account", req_get_account);
    op!("get_order", req_get_order);
    op!("get_orders", req_get_orders);
    op!("get_active_orders", req_get_active_orders);
    op!("get_trade", req_get_trade);
    op!("get_trades", req_get_trades);
    op!("get_positions", req_get_positions);
    op!("get_quotes", req_get_quotes);
    op!("get_order_cmds_status", req_get_order_cmds_status);
    op!("get_jobs", req_get_jobs);

    op!("order_req", req_order);
    op!("cancel_req", req_cancel);

    op!("trigger_job", req_trigger_job);
    op!("toggle_job", req_toggle_job);
    op!("pause_job", req_pause_job);
    op!("resume_job", req_resume_job);

    op!("list_strategies", req_list_strategies);
    op!("get_strategy", req_get_strategy);
    op!("update_strategy_params", req_update_strategy_params);
    op!("update_strategy_signal", req_update_strategy_signal);
    op!("set_strategy_trading_status", req_set_strategy_trading_status);
    op!("enable_strategy", req_enable_strategy);
    op!("disable_strategy", req_disable_strategy);
    op!("reload_strategy_params", req_reload_strategy_params);
    op!("init_strategy", req_init_strategy);
    op!("replay_all_strategies", req_replay_all_strategies);
    op!("get_strategy_order_cmds", req_get_strategy_order_cmds);
    op!("send_strategy_order_cmd", req_send_strategy_order_cmd);

    op!("get_rotation_instructions", req_get_rotation_instructions);
    op!("get_rotation_instruction", req_get_rotation_instruction);
    op!("update_rotation_instruction", req_update_rotation_instruction);
    op!("import_rotation_instructions", req_import_rotation_instructions);
    op!("execute_rotation", req_execute_rotation);
    op!("batch_delete_instructions", req_batch_delete_instructions);

    op!("list_system_params", req_list_system_params);
    op!("get_system_param", req_get_system_param);
    op!("update_system_param", req_update_system_param);
    op!("get_system_params_by_group", req_get_system_params_by_group);
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

fn field_str(data: &Value, field: &str) -> Result<String, String> {
    data.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| format!("missing field: {field}"))
}

impl TraderCore {
    async fn blocking<T, F>(&self, f: F) -> Result<T, String>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Store>) -> Result<T, qt_store::StoreError> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(store))
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())
    }

    // -- Gateway / system ---------------------------------------------------

    async fn req_connect_gateway(&self, _data: Value) -> Result<Value, String> {
        self.gateway.connect().await.map_err(|e| e.to_string())?;
        Ok(json!(true))
    }

    async fn req_disconnect_gateway(&self, _data: Value) -> Result<Value, String> {
        self.gateway.disconnect().await.map_err(|e| e.to_string())?;
        Ok(json!(true))
    }

    async fn req_pause_trading(&self, _data: Value) -> Result<Value, String> {
        self.paused.store(true, Ordering::SeqCst);
        self.engine.emit(
            EventType::AccountStatus,
            EventData::Raw(json!({"trade_paused": true})),
        );
        Ok(json!({"trade_paused": true}))
    }

    async fn req_resume_trading(&self, _data: Value) -> Result<Value, String> {
        self.paused.store(false, Ordering::SeqCst);
        self.engine.emit(
            EventType::AccountStatus,
            EventData::Raw(json!({"trade_paused": false})),
        );
        Ok(json!({"trade_paused": false}))
    }

    fn parse_symbols(data: &Value) -> Result<Vec<Symbol>, String> {
        let raw: Vec<String> = match data.get("symbols") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => vec![field_str(data, "symbol")?],
        };
        raw.iter()
            .map(|s| s.parse().map_err(|e: qt_types::TypeError| e.to_string()))
            .collect()
    }

    async fn req_subscribe(&self, data: Value) -> Result<Value, String> {
        let symbols = Self::parse_symbols(&data)?;
        self.gateway
            .subscribe(&symbols)
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!(true))
    }

    async fn req_unsubscribe(&self, data: Value) -> Result<Value, String> {
        let symbols = Self::parse_symbols(&data)?;
        self.gateway
            .unsubscribe(&symbols)
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!(true))
    }

    async fn req_update_alert_wechat(&self, data: Value) -> Result<Value, String> {
        let value = field_str(&data, "value")?;
        *self.alert_wechat.write() = value.clone();
        let param = SystemParam::new(
            "alert.wechat",
            &value,
            ParamType::String,
            "alert",
            "wechat alert receivers",
        );
        self.blocking(move |store| store.set_system_param(&param))
            .await?;
        Ok(json!(true))
    }

    async fn req_get_alert_wechat(&self, _data: Value) -> Result<Value, String> {
        let cached = self.alert_wechat.read().clone();
        if !cached.is_empty() {
            return Ok(json!({"value": cached}));
        }
        let stored = self
            .blocking(|store| store.get_system_param("alert.wechat"))
            .await?;
        Ok(json!({"value": stored.map(|p| p.param_value).unwrap_or_default()}))
    }

    // -- Queries ------------------------------------------------------------

    async fn req_get_account(&self, _data: Value) -> Result<Value, String> {
        match self.gateway.get_account() {
            Some(mut account) => {
                account.gateway_connected = self.gateway.is_connected();
                account.trade_paused = self.paused.load(Ordering::SeqCst);
                to_value(&account)
            }
            None => Ok(Value::Null),
        }
    }

    async fn req_get_order(&self, data: Value) -> Result<Value, String> {
        let order_id = field_str(&data, "order_id")?;
        match self.gateway.get_orders().get(&order_id) {
            Some(order) => to_value(order),
            None => Err(format!("unknown order_id: {order_id}")),
        }
    }

    async fn req_get_orders(&self, _data: Value) -> Result<Value, String> {
        let mut orders: Vec<Order> = self.gateway.get_orders().into_values().collect();
        orders.sort_by_key(|o| o.insert_time);
        to_value(&orders)
    }

    async fn req_get_active_orders(&self, _data: Value) -> Result<Value, String> {
        let mut orders: Vec<Order> = self
            .gateway
            .get_orders()
            .into_values()
            .filter(Order::is_active)
            .collect();
        orders.sort_by_key(|o| o.insert_time);
        to_value(&orders)
    }

    async fn req_get_trade(&self, data: Value) -> Result<Value, String> {
        let trade_id = field_str(&data, "trade_id")?;
        match self.gateway.get_trades().get(&trade_id) {
            Some(trade) => to_value(trade),
            None => Err(format!("unknown trade_id: {trade_id}")),
        }
    }

    async fn req_get_trades(&self, _data: Value) -> Result<Value, String> {
        let mut trades: Vec<Trade> = self.gateway.get_trades().into_values().collect();
        trades.sort_by_key(|t| t.trade_time);
        to_value(&trades)
    }

    async fn req_get_positions(&self, _data: Value) -> Result<Value, String> {
        let mut positions: Vec<Position> =
            self.gateway.get_positions().into_values().collect();
        positions.sort_by_key(|p| p.symbol.to_string());
        to_value(&positions)
    }

    async fn req_get_quotes(&self, data: Value) -> Result<Value, String> {
        let quotes = self.gateway.get_quotes();
        let ticks: Vec<Tick> = match data.get("symbols") {
            Some(Value::Array(_)) => {
                let wanted = Self::parse_symbols(&data)?;
                quotes
                    .into_iter()
                    .filter(|(symbol, _)| wanted.contains(symbol))
                    .map(|(_, tick)| tick)
                    .collect()
            }
            _ => quotes.into_values().collect(),
        };
        to_value(&ticks)
    }

    async fn req_get_order_cmds_status(&self, _data: Value) -> Result<Value, String> {
        Ok(json!({
            "cmds": self.executor.all_statuses(),
            "risk": self.risk.status(),
        }))
    }

    async fn req_get_jobs(&self, _data: Value) -> Result<Value, String> {
        to_value(&self.scheduler.list_jobs())
    }

    // -- Trading ------------------------------------------------------------

    async fn req_order(&self, data: Value) -> Result<Value, String> {
        if self.paused.load(Ordering::SeqCst) {
            return Err("trading is paused".to_string());
        }
        let request: OrderRequest =
            serde_json::from_value(data).map_err(|e| format!("bad order_req: {e}"))?;
        self.risk.check_order(request.volume).into_result()?;

        let order = self
            .gateway
            .send_order(request)
            .await
            .map_err(|e| e.to_string())?;
        self.risk.on_order_inserted();
        Ok(json!({"order_id": order.order_id}))
    }

    async fn req_cancel(&self, data: Value) -> Result<Value, String> {
        let order_id = field_str(&data, "order_id")?;
        self.risk.check_cancel().into_result()?;
        self.gateway
            .cancel_order(CancelRequest { order_id })
            .await
            .map_err(|e| e.to_string())?;
        self.risk.on_order_cancelled();
        Ok(json!(true))
    }

    // -- Jobs ---------------------------------------------------------------

    async fn req_trigger_job(&self, data: Value) -> Result<Value, String> {
        let job_id = field_str(&data, "job_id")?;
        self.scheduler.trigger_job(&job_id).await?;
        Ok(json!(true))
    }

    async fn req_toggle_job(&self, data: Value) -> Result<Value, String> {
        let job_id = field_str(&data, "job_id")?;
        let enabled = data
            .get("enabled")
            .and_then(Value::as_bool)
            .ok_or("missing field: enabled")?;
        let job = self
            .scheduler
            .toggle_job(&job_id, enabled)
            .ok_or_else(|| format!("unknown job: {job_id}"))?;
        let row = job.clone();
        self.blocking(move |store| store.upsert_job(&row)).await?;
        to_value(&job)
    }

    async fn req_pause_job(&self, data: Value) -> Result<Value, String> {
        let mut data = data;
        data["enabled"] = json!(false);
        self.req_toggle_job(data).await
    }

    async fn req_resume_job(&self, data: Value) -> Result<Value, String> {
        let mut data = data;
        data["enabled"] = json!(true);
        self.req_toggle_job(data).await
    }

    // -- Strategies ---------------------------------------------------------

    async fn req_list_strategies(&self, _data: Value) -> Result<Value, String> {
        to_value(&self.strategies.list())
    }

    async fn req_get_strategy(&self, data: Value) -> Result<Value, String> {
        let strategy_id = field_str(&data, "strategy_id")?;
        to_value(&self.strategies.get(&strategy_id)?)
    }

    async fn req_update_strategy_params(&self, data: Value) -> Result<Value, String> {
        let strategy_id = field_str(&data, "strategy_id")?;
        let params = data.get("params").cloned().unwrap_or(Value::Null);
        to_value(&self.strategies.update_params(&strategy_id, params)?)
    }

    async fn req_update_strategy_signal(&self, data: Value) -> Result<Value, String> {
        let strategy_id = field_str(&data, "strategy_id")?;
        let signal: Signal = serde_json::from_value(
            data.get("signal").cloned().unwrap_or(Value::Null),
        )
        .map_err(|e| format!("bad signal: {e}"))?;
        to_value(&self.strategies.update_signal(&strategy_id, signal)?)
    }

    async fn req_set_strategy_trading_status(&self, data: Value) -> Result<Value, String> {
        let strategy_id = field_str(&data, "strategy_id")?;
        let opening = data.get("opening_paused").and_then(Value::as_bool);
        let closing = data.get("closing_paused").and_then(Value::as_bool);
        to_value(&self.strategies.set_trading_status(&strategy_id, opening, closing)?)
    }

    async fn req_enable_strategy(&self, data: Value) -> Result<Value, String> {
        let strategy_id = field_str(&data, "strategy_id")?;
        to_value(&self.strategies.set_enabled(&strategy_id, true)?)
    }

    async fn req_disable_strategy(&self, data: Value) -> Result<Value, String> {
        let strategy_id = field_str(&data, "strategy_id")?;
        to_value(&self.strategies.set_enabled(&strategy_id, false)?)
    }

    async fn req_reload_strategy_params(&self, data: Value) -> Result<Value, String> {
        let strategy_id = field_str(&data, "strategy_id")?;
        to_value(&self.strategies.reload_params(&strategy_id)?)
    }

    async fn req_init_strategy(&self, data: Value) -> Result<Value, String> {
        let strategy_id = field_str(&data, "strategy_id")?;
        to_value(&self.strategies.init(&strategy_id).await?)
    }

    async fn req_replay_all_strategies(&self, _data: Value) -> Result<Value, String> {
        let succeeded = self.strategies.replay_all().await;
        Ok(json!({"initialized": succeeded}))
    }

    async fn req_get_strategy_order_cmds(&self, data: Value) -> Result<Value, String> {
        let strategy_id = field_str(&data, "strategy_id")?;
        to_value(&self.strategies.order_cmds(&strategy_id))
    }

    async fn req_send_strategy_order_cmd(&self, data: Value) -> Result<Value, String> {
        if self.paused.load(Ordering::SeqCst) {
            return Err("trading is paused".to_string());
        }
        let strategy_id = field_str(&data, "strategy_id")?;
        let symbol: Symbol = field_str(&data, "symbol")?
            .parse()
            .map_err(|e: qt_types::TypeError| e.to_string())?;
        let direction = serde_json::from_value(
            data.get("direction").cloned().unwrap_or(Value::Null),
        )
        .map_err(|e| format!("bad direction: {e}"))?;
        let offset = serde_json::from_value(data.get("offset").cloned().unwrap_or(Value::Null))
            .map_err(|e| format!("bad offset: {e}"))?;
        let volume = data
            .get("volume")
            .and_then(Value::as_i64)
            .ok_or("missing field: volume")?;
        let price = data.get("price").and_then(Value::as_f64);

        let request = OrderCmdRequest {
            symbol,
            direction,
            offset,
            volume,
            price,
            max_volume_per_order: 0,
            order_interval: 0.5,
            total_timeout: 0.0,
            order_timeout: 0.0,
            source: String::new(),
        };
        let cmd_id = self.strategies.send_order_cmd(&strategy_id, request)?;
        Ok(json!({"cmd_id": cmd_id}))
    }

    // -- Rotation -----------------------------------------------------------

    async fn req_get_rotation_instructions(&self, data: Value) -> Result<Value, String> {
        let trading_date = data
            .get("trading_date")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Local::now().format("%Y%m%d").to_string());
        let instructions = self
            .blocking(move |store| store.instructions_by_date(&trading_date))
            .await?;
        to_value(&instructions)
    }

    async fn req_get_rotation_instruction(&self, data: Value) -> Result<Value, String> {
        let id = data
            .get("id")
            .and_then(Value::as_i64)
            .ok_or("missing field: id")?;
        let instruction = self
            .blocking(move |store| store.instruction_by_id(id))
            .await?
            .ok_or_else(|| format!("unknown instruction: {id}"))?;
        to_value(&instruction)
    }

    async fn req_update_rotation_instruction(&self, data: Value) -> Result<Value, String> {
        let id = data
            .get("id")
            .and_then(Value::as_i64)
            .ok_or("missing field: id")?;
        let mut instruction = self
            .blocking(move |store| store.instruction_by_id(id))
            .await?
            .ok_or_else(|| format!("unknown instruction: {id}"))?;

        if let Some(enabled) = data.get("enabled").and_then(Value::as_bool) {
            instruction.enabled = enabled;
        }
        if let Some(volume) = data.get("volume").and_then(Value::as_i64) {
            if volume <= 0 {
                return Err(format!("volume must be positive, got {volume}"));
            }
            instruction.volume = volume;
        }
        if let Some(price) = data.get("price").and_then(Value::as_f64) {
            instruction.price = price;
        }
        if let Some(order_time) = data.get("order_time").and_then(Value::as_str) {
            instruction.order_time = Some(order_time.to_string()).filter(|s| !s.is_empty());
        }
        instruction.reconcile();

        let row = instruction.clone();
        self.blocking(move |store| store.update_instruction(&row))
            .await?;
        to_value(&instruction)
    }

    async fn req_import_rotation_instructions(&self, data: Value) -> Result<Value, String> {
        let csv_text = field_str(&data, "csv_text")?;
        let filename = field_str(&data, "filename")?;
        let mode: ImportMode = data
            .get("mode")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| format!("bad mode: {e}"))?
            .unwrap_or(ImportMode::Replace);

        let rotation = self.rotation.clone();
        let report = tokio::task::spawn_blocking(move || {
            rotation.import_csv(&csv_text, &filename, mode)
        })
        .await
        .map_err(|e| e.to_string())??;
        to_value(&report)
    }

    async fn req_execute_rotation(&self, _data: Value) -> Result<Value, String> {
        if self.rotation.is_working() {
            return Err("rotation already running".to_string());
        }
        let rotation = self.rotation.clone();
        tokio::spawn(async move {
            rotation.execute(true).await;
        });
        Ok(json!(true))
    }

    async fn req_batch_delete_instructions(&self, data: Value) -> Result<Value, String> {
        let ids: Vec<i64> = data
            .get("ids")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_i64).collect())
            .ok_or("missing field: ids")?;
        let deleted = self
            .blocking(move |store| store.soft_delete_instructions(&ids))
            .await?;
        Ok(json!({"deleted": deleted}))
    }

    // -- System parameters --------------------------------------------------

    async fn req_list_system_params(&self, _data: Value) -> Result<Value, String> {
        to_value(&self.blocking(|store| store.list_system_params()).await?)
    }

    async fn req_get_system_param(&self, data: Value) -> Result<Value, String> {
        let key = field_str(&data, "param_key")?;
        let param = self
            .blocking(move |store| store.get_system_param(&key))
            .await?
            .ok_or("unknown system param")?;
        to_value(&param)
    }

    async fn req_update_system_param(&self, data: Value) -> Result<Value, String> {
        let key = field_str(&data, "param_key")?;
        let value = field_str(&data, "param_value")?;
        let lookup_key = key.clone();
        let mut param = self
            .blocking(move |store| store.get_system_param(&lookup_key))
            .await?
            .ok_or("unknown system param")?;
        param.param_value = value;
        param.updated_at = chrono::Utc::now();
        let row = param.clone();
        self.blocking(move |store| store.set_system_param(&row))
            .await?;
        to_value(&param)
    }

    async fn req_get_system_params_by_group(&self, data: Value) -> Result<Value, String> {
        let group = field_str(&data, "group")?;
        to_value(
            &self
                .blocking(move |store| store.system_params_by_group(&group))
                .await?,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qt_gateway::SimGateway;
    use qt_ipc::{ClientError, Endpoint, SocketClient, REQUEST_TIMEOUT};
    use qt_types::{PathsConfig, RiskControlConfig, SchedulerConfig, StrategyConfig};
    use std::time::Duration;

    fn test_config(dir: &Path, max_daily_orders: i64) -> AccountConfig {
        AccountConfig {
            account_id: "ACC".to_string(),
            credentials: Default::default(),
            paths: PathsConfig {
                database: dir.join("qt.db"),
                logs: dir.join("logs"),
                export: dir.join("export"),
                csv_inbox: dir.join("inbox"),
                params: dir.join("params"),
            },
            risk_control: RiskControlConfig {
                max_daily_orders,
                ..RiskControlConfig::default()
            },
            strategies: vec![StrategyConfig {
                strategy_id: "S1".to_string(),
                class_name: "passive".to_string(),
                symbols: vec!["SHFE.rb2505".to_string()],
                enabled: true,
                params: json!({}),
            }],
            scheduler: SchedulerConfig::default(),
            socket_dir: dir.join("sock"),
            enabled: true,
        }
    }

    async fn started_trader(
        max_daily_orders: i64,
    ) -> (Trader, std::net::SocketAddr, SimGateway, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let gateway = SimGateway::new("ACC");
        let trader =
            Trader::build(test_config(dir.path(), max_daily_orders), Arc::new(gateway.clone()))
                .unwrap();
        let addr = trader.start_tcp("127.0.0.1:0").await.unwrap();
        (trader, addr, gateway, dir)
    }

    async fn connected_client(addr: std::net::SocketAddr) -> SocketClient {
        let client = SocketClient::new("ACC", Endpoint::Tcp(addr.to_string()));
        client.start();
        for _ in 0..100 {
            if client.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(client.is_connected());
        client
    }

    async fn trader_and_client(
        max_daily_orders: i64,
    ) -> (Trader, SocketClient, SimGateway, tempfile::TempDir) {
        let (trader, addr, gateway, dir) = started_trader(max_daily_orders).await;
        let client = connected_client(addr).await;
        (trader, client, gateway, dir)
    }

    #[tokio::test]
    async fn connect_and_query_account() {
        let (trader, client, _gateway, _dir) = trader_and_client(100).await;

        let connected = client
            .request("connect_gateway", json!({}), REQUEST_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(connected, json!(true));

        let account = client
            .request("get_account", json!({}), REQUEST_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(account["account_id"], "ACC");
        assert_eq!(account["gateway_connected"], true);

        trader.stop().await;
        client.stop().await;
    }

    #[tokio::test]
    async fn risk_cap_rejects_third_order() {
        let (trader, client, gateway, _dir) = trader_and_client(2).await;
        client
            .request("connect_gateway", json!({}), REQUEST_TIMEOUT)
            .await
            .unwrap();

        let order = json!({
            "symbol": "SHFE.rb2505",
            "direction": "BUY",
            "offset": "OPEN",
            "volume": 1,
            "price": 3500.0,
        });
        let first = client
            .request("order_req", order.clone(), REQUEST_TIMEOUT)
            .await
            .unwrap();
        assert!(first["order_id"].as_str().is_some());
        let second = client
            .request("order_req", order.clone(), REQUEST_TIMEOUT)
            .await
            .unwrap();
        assert!(second["order_id"].as_str().is_some());

        let third = client.request("order_req", order, REQUEST_TIMEOUT).await;
        match third {
            Err(ClientError::Remote(message)) => assert!(message.contains("cap")),
            other => panic!("expected risk rejection, got {other:?}"),
        }
        // No third gateway order.
        assert_eq!(gateway.get_orders().len(), 2);

        trader.stop().await;
        client.stop().await;
    }

    #[tokio::test]
    async fn pause_blocks_orders_until_resume() {
        let (trader, client, _gateway, _dir) = trader_and_client(100).await;
        client
            .request("connect_gateway", json!({}), REQUEST_TIMEOUT)
            .await
            .unwrap();
        client
            .request("pause_trading", json!({}), REQUEST_TIMEOUT)
            .await
            .unwrap();

        let order = json!({
            "symbol": "SHFE.rb2505",
            "direction": "BUY",
            "offset": "OPEN",
            "volume": 1,
        });
        assert!(client
            .request("order_req", order.clone(), REQUEST_TIMEOUT)
            .await
            .is_err());

        client
            .request("resume_trading", json!({}), REQUEST_TIMEOUT)
            .await
            .unwrap();
        assert!(client.request("order_req", order, REQUEST_TIMEOUT).await.is_ok());

        trader.stop().await;
        client.stop().await;
    }

    #[tokio::test]
    async fn order_push_reaches_client() {
        let (trader, addr, _gateway, _dir) = started_trader(100).await;
        let (push_tx, mut push_rx) = tokio::sync::mpsc::unbounded_channel();

        let client2 = SocketClient::new("ACC", Endpoint::Tcp(addr.to_string()));
        client2.on_push(move |kind, data| {
            let push_tx = push_tx.clone();
            async move {
                let _ = push_tx.send((kind, data));
            }
        });
        client2.start();
        for _ in 0..100 {
            if client2.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        client2
            .request("connect_gateway", json!({}), REQUEST_TIMEOUT)
            .await
            .unwrap();
        client2
            .request(
                "order_req",
                json!({
                    "symbol": "SHFE.rb2505",
                    "direction": "BUY",
                    "offset": "OPEN",
                    "volume": 2,
                    "price": 3500.0,
                }),
                REQUEST_TIMEOUT,
            )
            .await
            .unwrap();

        let mut kinds = std::collections::HashSet::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while kinds.len() < 2 {
            tokio::select! {
                Some((kind, _)) = push_rx.recv() => { kinds.insert(kind); }
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }
        assert!(kinds.contains("order"), "kinds: {kinds:?}");
        assert!(kinds.contains("trade"), "kinds: {kinds:?}");

        trader.stop().await;
        client2.stop().await;
    }

    #[tokio::test]
    async fn rotation_rpc_round_trip() {
        let (trader, client, _gateway, _dir) = trader_and_client(100).await;

        let today = Local::now().format("%Y%m%d").to_string();
        let csv = "account_id,strategy_id,instrument,offset,direction,volume,order_time\n\
                   ACC,S1,DCE.i2505,Open,Buy,2,\n";
        let report = client
            .request(
                "import_rotation_instructions",
                json!({"csv_text": csv, "filename": format!("{today}_ACC.csv"), "mode": "replace"}),
                REQUEST_TIMEOUT,
            )
            .await
            .unwrap();
        assert_eq!(report["imported"], 1);

        let instructions = client
            .request("get_rotation_instructions", json!({}), REQUEST_TIMEOUT)
            .await
            .unwrap();
        let list = instructions.as_array().unwrap();
        assert_eq!(list.len(), 1);
        let id = list[0]["id"].as_i64().unwrap();
        assert_eq!(list[0]["status"], "PENDING");

        let updated = client
            .request(
                "update_rotation_instruction",
                json!({"id": id, "enabled": false}),
                REQUEST_TIMEOUT,
            )
            .await
            .unwrap();
        assert_eq!(updated["enabled"], false);

        let deleted = client
            .request(
                "batch_delete_instructions",
                json!({"ids": [id]}),
                REQUEST_TIMEOUT,
            )
            .await
            .unwrap();
        assert_eq!(deleted["deleted"], 1);

        trader.stop().await;
        client.stop().await;
    }

    #[tokio::test]
    async fn system_params_and_strategies() {
        let (trader, client, _gateway, _dir) = trader_and_client(100).await;

        let params = client
            .request(
                "get_system_params_by_group",
                json!({"group": "risk"}),
                REQUEST_TIMEOUT,
            )
            .await
            .unwrap();
        assert_eq!(params.as_array().unwrap().len(), 5);

        let updated = client
            .request(
                "update_system_param",
                json!({"param_key": "risk.max_split_volume", "param_value": "7"}),
                REQUEST_TIMEOUT,
            )
            .await
            .unwrap();
        assert_eq!(updated["param_value"], "7");

        let strategies = client
            .request("list_strategies", json!({}), REQUEST_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(strategies.as_array().unwrap().len(), 1);
        // Started trader initializes enabled strategies.
        assert_eq!(strategies[0]["inited"], true);

        let state = client
            .request(
                "set_strategy_trading_status",
                json!({"strategy_id": "S1", "opening_paused": true}),
                REQUEST_TIMEOUT,
            )
            .await
            .unwrap();
        assert_eq!(state["opening_paused"], true);

        trader.stop().await;
        client.stop().await;
    }
}
