//! The abstract gateway contract.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use qt_types::{
    Account, Bar, CancelRequest, Contract, Order, OrderRequest, Position, Symbol, Tick, Trade,
};

/// Errors surfaced by gateway operations.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("not connected to gateway")]
    NotConnected,

    #[error("connect failed: {message}")]
    ConnectFailed { message: String },

    #[error("order rejected by gateway: {reason}")]
    OrderRejected { reason: String },

    #[error("order not found: {order_id}")]
    OrderNotFound { order_id: String },

    #[error("symbol not subscribed: {symbol}")]
    NotSubscribed { symbol: String },

    #[error("gateway internal error: {message}")]
    Internal { message: String },
}

/// Result alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Callback receiver for asynchronous gateway events.
///
/// The Trader's adapter republishes each callback on its event engine;
/// strategies are never invoked inline from a gateway thread.
#[async_trait]
pub trait GatewayCallback: Send + Sync {
    async fn on_tick(&self, _tick: Tick) {}
    async fn on_bar(&self, _bar: Bar) {}
    async fn on_order(&self, _order: Order) {}
    async fn on_trade(&self, _trade: Trade) {}
    async fn on_position(&self, _position: Position) {}
    async fn on_account(&self, _account: Account) {}
    async fn on_contract(&self, _contract: Contract) {}
    /// Connection status flips (true = connected).
    async fn on_connection(&self, _connected: bool) {}
}

/// Core gateway interface.
///
/// Implementations talk to a real brokerage SDK or simulate execution
/// locally (see [`crate::sim::SimGateway`]). All methods take `&self`; a
/// gateway is shared behind an `Arc` between the executor, the request
/// handlers, and the scheduler jobs.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Register the callback receiver. Must be called before `connect`.
    fn register_callback(&self, callback: Arc<dyn GatewayCallback>);

    /// Connect and authenticate.
    async fn connect(&self) -> GatewayResult<()>;

    /// Disconnect gracefully.
    async fn disconnect(&self) -> GatewayResult<()>;

    fn is_connected(&self) -> bool;

    /// Current trading day, YYYYMMDD, once connected.
    fn trading_day(&self) -> Option<String>;

    /// Subscribe market data for the given symbols.
    async fn subscribe(&self, symbols: &[Symbol]) -> GatewayResult<()>;

    /// Drop market data subscriptions for the given symbols.
    async fn unsubscribe(&self, symbols: &[Symbol]) -> GatewayResult<()>;

    /// Submit a new order. Returns the accepted order snapshot with its
    /// gateway-assigned `order_id`.
    async fn send_order(&self, request: OrderRequest) -> GatewayResult<Order>;

    /// Cancel a live order. Cancelling an already-terminal order is not an
    /// error.
    async fn cancel_order(&self, request: CancelRequest) -> GatewayResult<()>;

    // -- Synchronous snapshots ----------------------------------------------

    fn get_account(&self) -> Option<Account>;
    fn get_orders(&self) -> HashMap<String, Order>;
    fn get_trades(&self) -> HashMap<String, Trade>;
    fn get_positions(&self) -> HashMap<Symbol, Position>;
    fn get_quotes(&self) -> HashMap<Symbol, Tick>;
    fn get_contracts(&self) -> HashMap<Symbol, Contract>;
}
