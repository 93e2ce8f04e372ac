//! TraderProxy: the Manager-side handle for one Trader subprocess. Fronts
//! the IPC client, mirrors pushed state for API reads, and re-emits every
//! push on the Manager's event engine tagged with the account id.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use qt_event::{EventData, EventEngine, EventType};
use qt_ipc::{ClientError, Endpoint, SocketClient, REQUEST_TIMEOUT};
use qt_types::{Account, AccountConfig, AlarmData, Order, Position, Tick, Trade};

/// Lifecycle state of one supervised Trader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TraderState {
    Stopped,
    Starting,
    Running,
    Degraded,
    Stopping,
}

/// Per-account mirror populated by pushes; single-writer (the fan-in task),
/// many-reader (API handlers).
#[derive(Default)]
pub struct MirrorCache {
    pub account: RwLock<Option<Account>>,
    pub orders: DashMap<String, Order>,
    pub trades: DashMap<String, Trade>,
    pub positions: DashMap<String, Position>,
    pub quotes: DashMap<String, Tick>,
}

/// Manager-side handle for one Trader.
pub struct TraderProxy {
    account_id: String,
    config: AccountConfig,
    state: RwLock<TraderState>,
    pid: RwLock<Option<u32>>,
    start_time: RwLock<Option<DateTime<Utc>>>,
    last_push: Mutex<Option<Instant>>,
    degraded_since: Mutex<Option<Instant>>,
    restart_count: AtomicU32,
    client: RwLock<Option<SocketClient>>,
    pub mirror: Arc<MirrorCache>,
    engine: EventEngine,
}

impl TraderProxy {
    pub fn new(config: AccountConfig, engine: EventEngine) -> Arc<Self> {
        Arc::new(Self {
            account_id: config.account_id.clone(),
            config,
            state: RwLock::new(TraderState::Stopped),
            pid: RwLock::new(None),
            start_time: RwLock::new(None),
            last_push: Mutex::new(None),
            degraded_since: Mutex::new(None),
            restart_count: AtomicU32::new(0),
            client: RwLock::new(None),
            mirror: Arc::new(MirrorCache::default()),
            engine,
        })
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn config(&self) -> &AccountConfig {
        &self.config
    }

    pub fn state(&self) -> TraderState {
        *self.state.read()
    }

    pub fn set_state(&self, state: TraderState) {
        let previous = {
            let mut guard = self.state.write();
            std::mem::replace(&mut *guard, state)
        };
        if previous != state {
            info!(
                account_id = %self.account_id,
                ?previous,
                ?state,
                "trader state changed"
            );
            if state == TraderState::Degraded {
                *self.degraded_since.lock() = Some(Instant::now());
            } else {
                *self.degraded_since.lock() = None;
            }
        }
    }

    pub fn pid(&self) -> Option<u32> {
        *self.pid.read()
    }

    pub fn set_pid(&self, pid: Option<u32>) {
        *self.pid.write() = pid;
    }

    pub fn mark_started(&self, pid: Option<u32>) {
        self.set_pid(pid);
        *self.start_time.write() = Some(Utc::now());
        self.set_state(TraderState::Starting);
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count.load(Ordering::SeqCst)
    }

    pub fn bump_restart_count(&self) -> u32 {
        self.restart_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn degraded_for(&self) -> Option<std::time::Duration> {
        self.degraded_since.lock().map(|since| since.elapsed())
    }

    pub fn is_connected(&self) -> bool {
        self.client
            .read()
            .as_ref()
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }

    /// Dial the Trader's socket and keep the session alive. The reconnect
    /// loop inside the client handles DEGRADED-phase redials; state flips
    /// come from the push stream and the supervisor.
    pub fn connect(self: &Arc<Self>, endpoint: Endpoint) {
        let client = SocketClient::new(&self.account_id, endpoint);

        let proxy = self.clone();
        client.on_push(move |kind, data| {
            let proxy = proxy.clone();
            async move {
                proxy.handle_push(&kind, data).await;
            }
        });

        let proxy = self.clone();
        client.on_connect(move || {
            let proxy = proxy.clone();
            async move {
                // First successful register flips STARTING/DEGRADED into
                // RUNNING; the register push itself is consumed by the
                // client during the handshake.
                proxy.set_state(TraderState::Running);
            }
        });

        client.start();
        *self.client.write() = Some(client);
    }

    /// Connect using the account's configured Unix socket path.
    pub fn connect_unix(self: &Arc<Self>) {
        let path = self.config.socket_path();
        self.connect(Endpoint::Unix(path));
    }

    pub async fn disconnect(&self) {
        let client = self.client.write().take();
        if let Some(client) = client {
            client.stop().await;
        }
    }

    /// Forward one request to the Trader. Every account-scoped API call
    /// lands here.
    pub async fn request(&self, op: &str, payload: Value) -> Result<Value, ClientError> {
        let client = self.client.read().clone();
        match client {
            Some(client) => client.request(op, payload, REQUEST_TIMEOUT).await,
            None => Err(ClientError::Disconnected),
        }
    }

    /// Mirror + re-emit one push from the Trader.
    async fn handle_push(self: &Arc<Self>, kind: &str, data: Value) {
        *self.last_push.lock() = Some(Instant::now());

        match kind {
            "account" => {
                if let Ok(account) = serde_json::from_value::<Account>(data.clone()) {
                    *self.mirror.account.write() = Some(account);
                } else {
                    // Status-only payload: patch the cached snapshot.
                    let mut cached = self.mirror.account.write();
                    if let Some(account) = cached.as_mut() {
                        if let Some(connected) =
                            data.get("gateway_connected").and_then(Value::as_bool)
                        {
                            account.gateway_connected = connected;
                        }
                        if let Some(paused) = data.get("trade_paused").and_then(Value::as_bool) {
                            account.trade_paused = paused;
                        }
                    }
                }
                self.re_emit(EventType::AccountUpdate, data);
            }
            "order" => {
                if let Ok(order) = serde_json::from_value::<Order>(data.clone()) {
                    self.mirror.orders.insert(order.order_id.clone(), order);
                }
                self.re_emit(EventType::OrderUpdate, data);
            }
            "trade" => {
                if let Ok(trade) = serde_json::from_value::<Trade>(data.clone()) {
                    self.mirror.trades.insert(trade.trade_id.clone(), trade);
                }
                self.re_emit(EventType::TradeUpdate, data);
            }
            "position" => {
                if let Ok(position) = serde_json::from_value::<Position>(data.clone()) {
                    self.mirror
                        .positions
                        .insert(position.symbol.to_string(), position);
                }
                self.re_emit(EventType::PositionUpdate, data);
            }
            "tick" => {
                if let Ok(tick) = serde_json::from_value::<Tick>(data.clone()) {
                    self.mirror.quotes.insert(tick.symbol.to_string(), tick);
                }
                self.re_emit(EventType::TickUpdate, data);
            }
            "alarm" => {
                if let Err(e) = serde_json::from_value::<AlarmData>(data.clone()) {
                    debug!(error = %e, "malformed alarm push");
                }
                self.re_emit(EventType::AlarmUpdate, data);
            }
            other => warn!(kind = other, "unknown push kind dropped"),
        }
    }

    fn re_emit(&self, event_type: EventType, data: Value) {
        self.engine.emit(
            event_type,
            EventData::Raw(json!({
                "account_id": self.account_id,
                "data": data,
            })),
        );
    }

    /// API-facing status row.
    pub fn status(&self) -> Value {
        json!({
            "account_id": self.account_id,
            "state": self.state(),
            "pid": self.pid(),
            "start_time": *self.start_time.read(),
            "restart_count": self.restart_count(),
            "connected": self.is_connected(),
            "socket_path": self.config.socket_path(),
            "enabled": self.config.enabled,
        })
    }
}
