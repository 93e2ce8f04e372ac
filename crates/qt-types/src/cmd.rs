use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::market::Symbol;
use crate::orders::{Direction, Offset};

/// Lifecycle status of an [`OrderCmdStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CmdStatus {
    Pending,
    Running,
    Finished,
}

/// Why a finished command stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinishReason {
    AllCompleted,
    PartialTimeout,
    Cancelled,
    Error,
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FinishReason::AllCompleted => "ALL_COMPLETED",
            FinishReason::PartialTimeout => "PARTIAL_TIMEOUT",
            FinishReason::Cancelled => "CANCELLED",
            FinishReason::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// A high-level split-and-retry execution directive. The executor satisfies
/// it through one or more child orders, each of volume at most
/// `max_volume_per_order`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCmdRequest {
    pub symbol: Symbol,
    pub direction: Direction,
    pub offset: Offset,
    pub volume: i64,
    /// None means price each slice off the opposite-side best quote.
    #[serde(default)]
    pub price: Option<f64>,
    pub max_volume_per_order: i64,
    /// Seconds to wait between order-update polls for a live slice.
    pub order_interval: f64,
    /// Seconds after which the whole command gives up with PARTIAL_TIMEOUT.
    pub total_timeout: f64,
    /// Seconds a single slice may stay unfilled before it is cancelled.
    pub order_timeout: f64,
    #[serde(default)]
    pub source: String,
}

/// Serializable snapshot of a command's progress, exposed through the
/// `get_order_cmds_status` RPC and read by the rotation monitor loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCmdStatus {
    pub cmd_id: Uuid,
    pub symbol: Symbol,
    pub direction: Direction,
    pub offset: Offset,
    pub volume: i64,
    pub filled_volume: i64,
    #[serde(default)]
    pub price: Option<f64>,
    pub status: CmdStatus,
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
    pub source: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Child order ids, in issue order.
    pub order_ids: Vec<String>,
}

impl OrderCmdStatus {
    pub fn is_active(&self) -> bool {
        self.status != CmdStatus::Finished
    }

    pub fn remaining(&self) -> i64 {
        self.volume - self.filled_volume
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reason_wire_format() {
        assert_eq!(
            serde_json::to_string(&FinishReason::AllCompleted).unwrap(),
            "\"ALL_COMPLETED\""
        );
        assert_eq!(
            serde_json::from_str::<FinishReason>("\"PARTIAL_TIMEOUT\"").unwrap(),
            FinishReason::PartialTimeout
        );
    }
}
