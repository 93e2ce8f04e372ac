//! Pre-trade risk control: daily order/cancel counters and per-order volume
//! caps, reset on date change. Checked at `order_req` entry and again for
//! every executor slice.

use chrono::{Local, NaiveDate};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use qt_types::RiskControlConfig;

struct RiskState {
    daily_order_count: i64,
    daily_cancel_count: i64,
    last_reset: NaiveDate,
}

/// Result of a risk check.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskCheck {
    Approved,
    Rejected { reason: String },
}

impl RiskCheck {
    pub fn is_approved(&self) -> bool {
        matches!(self, RiskCheck::Approved)
    }

    pub fn into_result(self) -> Result<(), String> {
        match self {
            RiskCheck::Approved => Ok(()),
            RiskCheck::Rejected { reason } => Err(reason),
        }
    }
}

/// Per-account risk counters.
pub struct RiskControl {
    config: RiskControlConfig,
    state: Mutex<RiskState>,
}

impl RiskControl {
    pub fn new(config: RiskControlConfig) -> Self {
        Self {
            config,
            state: Mutex::new(RiskState {
                daily_order_count: 0,
                daily_cancel_count: 0,
                last_reset: Local::now().date_naive(),
            }),
        }
    }

    pub fn config(&self) -> &RiskControlConfig {
        &self.config
    }

    fn reset_if_new_day(state: &mut RiskState) {
        let today = Local::now().date_naive();
        if state.last_reset != today {
            state.daily_order_count = 0;
            state.daily_cancel_count = 0;
            state.last_reset = today;
            debug!("risk counters reset for new trading day");
        }
    }

    /// Gate a new order of `volume` lots.
    pub fn check_order(&self, volume: i64) -> RiskCheck {
        let mut state = self.state.lock();
        Self::reset_if_new_day(&mut state);

        if state.daily_order_count >= self.config.max_daily_orders {
            warn!(
                count = state.daily_order_count,
                max = self.config.max_daily_orders,
                "risk reject: daily order cap reached"
            );
            return RiskCheck::Rejected {
                reason: format!(
                    "daily order cap reached ({})",
                    self.config.max_daily_orders
                ),
            };
        }
        if volume > self.config.max_order_volume {
            warn!(
                volume,
                max = self.config.max_order_volume,
                "risk reject: order volume over cap"
            );
            return RiskCheck::Rejected {
                reason: format!(
                    "order volume {} exceeds single-order cap {}",
                    volume, self.config.max_order_volume
                ),
            };
        }
        RiskCheck::Approved
    }

    /// Gate a cancel.
    pub fn check_cancel(&self) -> RiskCheck {
        let mut state = self.state.lock();
        Self::reset_if_new_day(&mut state);

        if state.daily_cancel_count >= self.config.max_daily_cancels {
            warn!(
                count = state.daily_cancel_count,
                max = self.config.max_daily_cancels,
                "risk reject: daily cancel cap reached"
            );
            return RiskCheck::Rejected {
                reason: format!(
                    "daily cancel cap reached ({})",
                    self.config.max_daily_cancels
                ),
            };
        }
        RiskCheck::Approved
    }

    pub fn on_order_inserted(&self) {
        self.state.lock().daily_order_count += 1;
    }

    pub fn on_order_cancelled(&self) {
        self.state.lock().daily_cancel_count += 1;
    }

    /// Snapshot for status reporting.
    pub fn status(&self) -> Value {
        let mut state = self.state.lock();
        Self::reset_if_new_day(&mut state);
        json!({
            "daily_order_count": state.daily_order_count,
            "daily_cancel_count": state.daily_cancel_count,
            "max_daily_orders": self.config.max_daily_orders,
            "max_daily_cancels": self.config.max_daily_cancels,
            "max_order_volume": self.config.max_order_volume,
            "max_split_volume": self.config.max_split_volume,
            "order_timeout": self.config.order_timeout,
            "remaining_orders": self.config.max_daily_orders - state.daily_order_count,
            "remaining_cancels": self.config.max_daily_cancels - state.daily_cancel_count,
        })
    }
}
