use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Trading signal last emitted by a strategy. Strategies own logical
/// position only; order flow goes through the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Long,
    Short,
    Flat,
    None,
}

impl Default for Signal {
    fn default() -> Self {
        Signal::None
    }
}

/// Externally visible state of one strategy instance, as returned by the
/// `list_strategies` / `get_strategy` RPCs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyState {
    pub strategy_id: String,
    pub enabled: bool,
    pub opening_paused: bool,
    pub closing_paused: bool,
    pub inited: bool,
    pub pos_long: i64,
    pub pos_short: i64,
    pub pos_price: f64,
    #[serde(default)]
    pub signal: Signal,
    /// Free-form parameter map; shape is strategy-defined.
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub symbols: Vec<crate::market::Symbol>,
}

impl StrategyState {
    pub fn new(strategy_id: &str) -> Self {
        Self {
            strategy_id: strategy_id.to_string(),
            enabled: false,
            opening_paused: false,
            closing_paused: false,
            inited: false,
            pos_long: 0,
            pos_short: 0,
            pos_price: 0.0,
            signal: Signal::None,
            params: Value::Null,
            symbols: Vec::new(),
        }
    }
}
