use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::market::Symbol;

/// Per-account balance snapshot, updated by gateway callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub account_id: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub balance: f64,
    pub available: f64,
    pub margin: f64,
    pub float_profit: f64,
    pub position_profit: f64,
    pub close_profit: f64,
    pub risk_ratio: f64,
    #[serde(default)]
    pub gateway_connected: bool,
    #[serde(default)]
    pub trade_paused: bool,
    #[serde(default)]
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

fn default_currency() -> String {
    "CNY".to_string()
}

impl Account {
    pub fn empty(account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            currency: default_currency(),
            balance: 0.0,
            available: 0.0,
            margin: 0.0,
            float_profit: 0.0,
            position_profit: 0.0,
            close_profit: 0.0,
            risk_ratio: 0.0,
            gateway_connected: false,
            trade_paused: false,
            status: String::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Per-symbol position aggregate. Long and short legs are tracked
/// independently; today/yesterday splits feed the position export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub pos_long: i64,
    pub pos_short: i64,
    #[serde(default)]
    pub pos_long_td: i64,
    #[serde(default)]
    pub pos_long_yd: i64,
    #[serde(default)]
    pub pos_short_td: i64,
    #[serde(default)]
    pub pos_short_yd: i64,
    pub open_price_long: f64,
    pub open_price_short: f64,
    pub float_profit: f64,
    pub margin: f64,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn flat(symbol: Symbol) -> Self {
        Self {
            symbol,
            pos_long: 0,
            pos_short: 0,
            pos_long_td: 0,
            pos_long_yd: 0,
            pos_short_td: 0,
            pos_short_yd: 0,
            open_price_long: 0.0,
            open_price_short: 0.0,
            float_profit: 0.0,
            margin: 0.0,
            updated_at: Utc::now(),
        }
    }

    /// True when neither leg holds lots.
    pub fn is_flat(&self) -> bool {
        self.pos_long == 0 && self.pos_short == 0
    }
}
