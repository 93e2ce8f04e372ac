//! A fully in-process gateway that simulates order acceptance, fills,
//! rejects, and stalls. Behavior per order is scriptable, which is how the
//! executor and rotation tests drive partial-fill and cancel-race paths.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use qt_types::{
    Account, CancelRequest, Contract, Direction, Offset, Order, OrderRequest, OrderStatus,
    Position, PriceType, Symbol, Tick, Trade,
};

use crate::gateway::{Gateway, GatewayCallback, GatewayError, GatewayResult};

/// What the simulator does with the next order on a symbol.
#[derive(Debug, Clone)]
pub enum SimBehavior {
    /// Accept, then fill the whole volume after `delay`.
    FillAfter { delay: Duration },
    /// Accept, fill `fill` lots after `delay`, then sit ACTIVE forever.
    PartialThenStall { fill: i64, delay: Duration },
    /// Refuse the insert itself.
    RejectInsert { reason: String },
    /// Accept, then report an exchange reject after `delay`.
    RejectExchange { message: String, delay: Duration },
    /// Accept and never fill. Cancels still work.
    Stall,
}

impl Default for SimBehavior {
    fn default() -> Self {
        SimBehavior::FillAfter {
            delay: Duration::from_millis(10),
        }
    }
}

#[derive(Default)]
struct SimState {
    orders: HashMap<String, Order>,
    trades: HashMap<String, Trade>,
    positions: HashMap<Symbol, Position>,
    quotes: HashMap<Symbol, Tick>,
    contracts: HashMap<Symbol, Contract>,
    subscriptions: Vec<Symbol>,
    account: Option<Account>,
}

struct SimInner {
    account_id: String,
    connected: AtomicBool,
    connect_fails: AtomicBool,
    order_seq: AtomicU64,
    trade_seq: AtomicU64,
    /// Exchange-side latency applied to cancels, in milliseconds. A fill
    /// landing inside this window wins the race.
    cancel_delay_ms: AtomicU64,
    state: Mutex<SimState>,
    behaviors: Mutex<HashMap<Symbol, VecDeque<SimBehavior>>>,
    default_behavior: Mutex<SimBehavior>,
    callback: RwLock<Option<Arc<dyn GatewayCallback>>>,
}

impl SimInner {
    fn callback(&self) -> Option<Arc<dyn GatewayCallback>> {
        self.callback.read().clone()
    }

    fn next_behavior(&self, symbol: &Symbol) -> SimBehavior {
        let mut behaviors = self.behaviors.lock();
        if let Some(queue) = behaviors.get_mut(symbol) {
            if let Some(behavior) = queue.pop_front() {
                return behavior;
            }
        }
        self.default_behavior.lock().clone()
    }

    /// Apply a fill: update the order, record the trade, move the position,
    /// and return the snapshots to emit.
    fn apply_fill(&self, order_id: &str, volume: i64, price: f64) -> Option<(Order, Trade, Position)> {
        let mut state = self.state.lock();
        let order = state.orders.get_mut(order_id)?;
        let fill = volume.min(order.volume_left);
        if fill <= 0 {
            return None;
        }
        order.volume_left -= fill;
        if order.volume_left == 0 {
            order.status = OrderStatus::Finished;
        } else if order.status == OrderStatus::Pending {
            order.status = OrderStatus::Active;
        }
        let order_snapshot = order.clone();

        let trade_id = format!("T{}", self.trade_seq.fetch_add(1, Ordering::SeqCst) + 1);
        let trade = Trade {
            trade_id: trade_id.clone(),
            order_id: order_id.to_string(),
            symbol: order_snapshot.symbol.clone(),
            direction: order_snapshot.direction,
            offset: order_snapshot.offset,
            price,
            volume: fill,
            trade_time: Utc::now(),
        };
        state.trades.insert(trade_id, trade.clone());

        let symbol = order_snapshot.symbol.clone();
        let position = state
            .positions
            .entry(symbol.clone())
            .or_insert_with(|| Position::flat(symbol));
        match (trade.direction, trade.offset) {
            (Direction::Buy, Offset::Open) => {
                position.pos_long += fill;
                position.pos_long_td += fill;
                position.open_price_long = price;
            }
            (Direction::Sell, Offset::Open) => {
                position.pos_short += fill;
                position.pos_short_td += fill;
                position.open_price_short = price;
            }
            (Direction::Buy, _) => {
                position.pos_short = (position.pos_short - fill).max(0);
                position.pos_short_td = (position.pos_short_td - fill).max(0);
            }
            (Direction::Sell, _) => {
                position.pos_long = (position.pos_long - fill).max(0);
                position.pos_long_td = (position.pos_long_td - fill).max(0);
            }
        }
        position.updated_at = Utc::now();
        let position_snapshot = position.clone();

        Some((order_snapshot, trade, position_snapshot))
    }
}

/// The simulator gateway.
#[derive(Clone)]
pub struct SimGateway {
    inner: Arc<SimInner>,
}

impl SimGateway {
    pub fn new(account_id: &str) -> Self {
        Self {
            inner: Arc::new(SimInner {
                account_id: account_id.to_string(),
                connected: AtomicBool::new(false),
                connect_fails: AtomicBool::new(false),
                order_seq: AtomicU64::new(0),
                trade_seq: AtomicU64::new(0),
                cancel_delay_ms: AtomicU64::new(0),
                state: Mutex::new(SimState::default()),
                behaviors: Mutex::new(HashMap::new()),
                default_behavior: Mutex::new(SimBehavior::default()),
                callback: RwLock::new(None),
            }),
        }
    }

    /// Queue behaviors consumed by successive orders on `symbol`.
    pub fn script(&self, symbol: &Symbol, behaviors: Vec<SimBehavior>) {
        self.inner
            .behaviors
            .lock()
            .entry(symbol.clone())
            .or_default()
            .extend(behaviors);
    }

    /// Behavior applied when no script entry remains.
    pub fn set_default_behavior(&self, behavior: SimBehavior) {
        *self.inner.default_behavior.lock() = behavior;
    }

    /// Make subsequent `connect` calls fail. Used by health-check tests.
    pub fn set_connect_fails(&self, fails: bool) {
        self.inner.connect_fails.store(fails, Ordering::SeqCst);
    }

    /// Delay the effect of cancels to open a cancel/fill race window.
    pub fn set_cancel_delay(&self, delay: Duration) {
        self.inner
            .cancel_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Seed a quote and publish it through `on_tick`.
    pub async fn set_quote(&self, tick: Tick) {
        self.inner
            .state
            .lock()
            .quotes
            .insert(tick.symbol.clone(), tick.clone());
        if let Some(callback) = self.inner.callback() {
            callback.on_tick(tick).await;
        }
    }

    pub fn add_contract(&self, contract: Contract) {
        self.inner
            .state
            .lock()
            .contracts
            .insert(contract.symbol.clone(), contract);
    }

    /// Directly fill a live order, bypassing its script. Lets tests race a
    /// fill against a cancel.
    pub async fn force_fill(&self, order_id: &str, volume: i64, price: f64) {
        if let Some((order, trade, position)) = self.inner.apply_fill(order_id, volume, price) {
            if let Some(callback) = self.inner.callback() {
                callback.on_trade(trade).await;
                callback.on_order(order).await;
                callback.on_position(position).await;
            }
        }
    }

    fn spawn_order_task(&self, order: Order, behavior: SimBehavior) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            // First report the order resting on the book.
            {
                let mut state = inner.state.lock();
                if let Some(o) = state.orders.get_mut(&order.order_id) {
                    if o.status == OrderStatus::Pending {
                        o.status = OrderStatus::Active;
                    }
                }
            }
            let active_snapshot = inner.state.lock().orders.get(&order.order_id).cloned();
            if let (Some(callback), Some(snapshot)) = (inner.callback(), active_snapshot) {
                callback.on_order(snapshot).await;
            }

            match behavior {
                SimBehavior::FillAfter { delay } => {
                    tokio::time::sleep(delay).await;
                    let price = if order.price > 0.0 {
                        order.price
                    } else {
                        // Market order: fill at the last seeded quote.
                        inner
                            .state
                            .lock()
                            .quotes
                            .get(&order.symbol)
                            .map(|t| t.last_price)
                            .unwrap_or(0.0)
                    };
                    if let Some((o, t, p)) = inner.apply_fill(&order.order_id, order.volume, price)
                    {
                        if let Some(callback) = inner.callback() {
                            callback.on_trade(t).await;
                            callback.on_order(o).await;
                            callback.on_position(p).await;
                        }
                    }
                }
                SimBehavior::PartialThenStall { fill, delay } => {
                    tokio::time::sleep(delay).await;
                    if let Some((o, t, p)) = inner.apply_fill(&order.order_id, fill, order.price) {
                        if let Some(callback) = inner.callback() {
                            callback.on_trade(t).await;
                            callback.on_order(o).await;
                            callback.on_position(p).await;
                        }
                    }
                }
                SimBehavior::RejectExchange { message, delay } => {
                    tokio::time::sleep(delay).await;
                    let snapshot = {
                        let mut state = inner.state.lock();
                        state.orders.get_mut(&order.order_id).map(|o| {
                            o.status = OrderStatus::Rejected;
                            o.status_msg = message.clone();
                            o.clone()
                        })
                    };
                    if let (Some(callback), Some(snapshot)) = (inner.callback(), snapshot) {
                        callback.on_order(snapshot).await;
                    }
                }
                SimBehavior::Stall | SimBehavior::RejectInsert { .. } => {}
            }
        });
    }
}

#[async_trait]
impl Gateway for SimGateway {
    fn register_callback(&self, callback: Arc<dyn GatewayCallback>) {
        *self.inner.callback.write() = Some(callback);
    }

    async fn connect(&self) -> GatewayResult<()> {
        if self.inner.connect_fails.load(Ordering::SeqCst) {
            return Err(GatewayError::ConnectFailed {
                message: "simulated connect failure".to_string(),
            });
        }
        self.inner.connected.store(true, Ordering::SeqCst);
        let account = {
            let mut state = self.inner.state.lock();
            if state.account.is_none() {
                let mut account = Account::empty(&self.inner.account_id);
                account.balance = 1_000_000.0;
                account.available = 1_000_000.0;
                state.account = Some(account);
            }
            let mut account = state.account.clone().expect("account seeded");
            account.gateway_connected = true;
            state.account = Some(account.clone());
            account
        };
        info!(account_id = %self.inner.account_id, "sim gateway connected");
        if let Some(callback) = self.inner.callback() {
            callback.on_connection(true).await;
            callback.on_account(account).await;
            let contracts: Vec<Contract> =
                self.inner.state.lock().contracts.values().cloned().collect();
            for contract in contracts {
                callback.on_contract(contract).await;
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> GatewayResult<()> {
        self.inner.connected.store(false, Ordering::SeqCst);
        if let Some(callback) = self.inner.callback() {
            callback.on_connection(false).await;
        }
        info!(account_id = %self.inner.account_id, "sim gateway disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn trading_day(&self) -> Option<String> {
        if self.is_connected() {
            Some(Local::now().format("%Y%m%d").to_string())
        } else {
            None
        }
    }

    async fn subscribe(&self, symbols: &[Symbol]) -> GatewayResult<()> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        let mut state = self.inner.state.lock();
        for symbol in symbols {
            if !state.subscriptions.contains(symbol) {
                state.subscriptions.push(symbol.clone());
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, symbols: &[Symbol]) -> GatewayResult<()> {
        let mut state = self.inner.state.lock();
        state.subscriptions.retain(|s| !symbols.contains(s));
        Ok(())
    }

    async fn send_order(&self, request: OrderRequest) -> GatewayResult<Order> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        let behavior = self.inner.next_behavior(&request.symbol);
        if let SimBehavior::RejectInsert { reason } = &behavior {
            return Err(GatewayError::OrderRejected {
                reason: reason.clone(),
            });
        }

        let order_id = format!("SIM{}", self.inner.order_seq.fetch_add(1, Ordering::SeqCst) + 1);
        let order = Order {
            order_id: order_id.clone(),
            exchange_order_id: Some(format!("EX-{order_id}")),
            symbol: request.symbol.clone(),
            direction: request.direction,
            offset: request.offset,
            volume: request.volume,
            volume_left: request.volume,
            price: request.price,
            price_type: if request.price > 0.0 {
                PriceType::Limit
            } else {
                PriceType::Market
            },
            status: OrderStatus::Pending,
            insert_time: Utc::now(),
            status_msg: String::new(),
        };
        self.inner
            .state
            .lock()
            .orders
            .insert(order_id.clone(), order.clone());
        debug!(%order_id, symbol = %request.symbol, volume = request.volume, "sim order accepted");

        self.spawn_order_task(order.clone(), behavior);
        Ok(order)
    }

    async fn cancel_order(&self, request: CancelRequest) -> GatewayResult<()> {
        if !self.inner.state.lock().orders.contains_key(&request.order_id) {
            return Err(GatewayError::OrderNotFound {
                order_id: request.order_id.clone(),
            });
        }

        let delay = self.inner.cancel_delay_ms.load(Ordering::SeqCst);
        let inner = self.inner.clone();
        let apply_cancel = move || async move {
            let snapshot = {
                let mut state = inner.state.lock();
                state.orders.get_mut(&request.order_id).and_then(|order| {
                    // Cancel after completion is a no-op, not an error.
                    if order.status.is_terminal() {
                        None
                    } else {
                        order.status = OrderStatus::Cancelled;
                        Some(order.clone())
                    }
                })
            };
            if let (Some(callback), Some(snapshot)) = (inner.callback(), snapshot) {
                callback.on_order(snapshot).await;
            }
        };

        if delay == 0 {
            apply_cancel().await;
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                apply_cancel().await;
            });
        }
        Ok(())
    }

    fn get_account(&self) -> Option<Account> {
        self.inner.state.lock().account.clone()
    }

    fn get_orders(&self) -> HashMap<String, Order> {
        self.inner.state.lock().orders.clone()
    }

    fn get_trades(&self) -> HashMap<String, Trade> {
        self.inner.state.lock().trades.clone()
    }

    fn get_positions(&self) -> HashMap<Symbol, Position> {
        self.inner.state.lock().positions.clone()
    }

    fn get_quotes(&self) -> HashMap<Symbol, Tick> {
        self.inner.state.lock().quotes.clone()
    }

    fn get_contracts(&self) -> HashMap<Symbol, Contract> {
        self.inner.state.lock().contracts.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct Recorder {
        tx: mpsc::UnboundedSender<(String, String)>,
    }

    #[async_trait]
    impl GatewayCallback for Recorder {
        async fn on_order(&self, order: Order) {
            let _ = self.tx.send(("order".into(), format!("{:?}:{}", order.status, order.volume_left)));
        }
        async fn on_trade(&self, trade: Trade) {
            let _ = self.tx.send(("trade".into(), trade.volume.to_string()));
        }
    }

    fn rb() -> Symbol {
        "SHFE.rb2505".parse().unwrap()
    }

    fn order_req(volume: i64) -> OrderRequest {
        OrderRequest {
            symbol: rb(),
            direction: Direction::Buy,
            offset: Offset::Open,
            volume,
            price: 3500.0,
        }
    }

    #[tokio::test]
    async fn full_fill_emits_trade_then_finished_order() {
        let gateway = SimGateway::new("ACC");
        let (tx, mut rx) = mpsc::unbounded_channel();
        gateway.register_callback(Arc::new(Recorder { tx }));
        gateway.connect().await.unwrap();

        let order = gateway.send_order(order_req(3)).await.unwrap();
        assert_eq!(order.order_id, "SIM1");

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        // ACTIVE update, then the fill pair.
        assert!(events.contains(&("trade".into(), "3".into())));
        assert!(events.contains(&("order".into(), "Finished:0".into())));

        let positions = gateway.get_positions();
        assert_eq!(positions.get(&rb()).unwrap().pos_long, 3);
    }

    #[tokio::test]
    async fn reject_insert_returns_error_without_order() {
        let gateway = SimGateway::new("ACC");
        gateway.connect().await.unwrap();
        gateway.script(
            &rb(),
            vec![SimBehavior::RejectInsert {
                reason: "price limit".into(),
            }],
        );

        let err = gateway.send_order(order_req(1)).await.unwrap_err();
        assert!(matches!(err, GatewayError::OrderRejected { .. }));
        assert!(gateway.get_orders().is_empty());
    }

    #[tokio::test]
    async fn cancel_of_stalled_order_emits_cancelled() {
        let gateway = SimGateway::new("ACC");
        let (tx, mut rx) = mpsc::unbounded_channel();
        gateway.register_callback(Arc::new(Recorder { tx }));
        gateway.connect().await.unwrap();
        gateway.script(&rb(), vec![SimBehavior::Stall]);

        let order = gateway.send_order(order_req(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        gateway
            .cancel_order(CancelRequest {
                order_id: order.order_id.clone(),
            })
            .await
            .unwrap();
        // Cancelling again is a clean no-op.
        gateway
            .cancel_order(CancelRequest {
                order_id: order.order_id,
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut saw_cancelled = false;
        while let Ok((kind, detail)) = rx.try_recv() {
            if kind == "order" && detail == "Cancelled:2" {
                saw_cancelled = true;
            }
        }
        assert!(saw_cancelled);
    }

    #[tokio::test]
    async fn disconnected_send_order_fails() {
        let gateway = SimGateway::new("ACC");
        let err = gateway.send_order(order_req(1)).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotConnected));
    }
}
