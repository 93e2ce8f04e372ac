use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::TypeError;
use crate::market::Symbol;

/// Direction of an order or trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Buy => Direction::Sell,
            Direction::Sell => Direction::Buy,
        }
    }

    /// Parse the loose spellings accepted by the rotation CSV files.
    pub fn parse_loose(s: &str) -> Result<Self, TypeError> {
        match s.trim() {
            "Buy" | "BUY" | "buy" | "买入" | "买" => Ok(Direction::Buy),
            "Sell" | "SELL" | "sell" | "卖出" | "卖" => Ok(Direction::Sell),
            other => Err(TypeError::InvalidEnum {
                field: "direction",
                value: other.to_string(),
            }),
        }
    }
}

/// Open/close flag of an order or trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Offset {
    Open,
    Close,
    CloseToday,
}

impl Offset {
    /// Parse the loose spellings accepted by the rotation CSV files.
    pub fn parse_loose(s: &str) -> Result<Self, TypeError> {
        match s.trim() {
            "Open" | "OPEN" | "open" | "开仓" | "开" => Ok(Offset::Open),
            "Close" | "CLOSE" | "close" | "平仓" | "平" => Ok(Offset::Close),
            "CloseToday" | "CLOSETODAY" | "平今" => Ok(Offset::CloseToday),
            other => Err(TypeError::InvalidEnum {
                field: "offset",
                value: other.to_string(),
            }),
        }
    }
}

/// Price type of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PriceType {
    Limit,
    Market,
}

/// Order lifecycle status as reported by the gateway.
///
/// A `Finished` order with `volume_left == volume` never traded and is
/// semantically a reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Pending,
    Active,
    Finished,
    Rejected,
    Cancelled,
}

impl OrderStatus {
    /// Terminal states receive no further updates.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Finished | OrderStatus::Rejected | OrderStatus::Cancelled
        )
    }
}

/// Request to insert a new order at the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub direction: Direction,
    pub offset: Offset,
    pub volume: i64,
    /// 0 means market / opposite-side pricing.
    #[serde(default)]
    pub price: f64,
}

/// Request to cancel a live order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub order_id: String,
}

/// A live brokerage order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    #[serde(default)]
    pub exchange_order_id: Option<String>,
    pub symbol: Symbol,
    pub direction: Direction,
    pub offset: Offset,
    pub volume: i64,
    pub volume_left: i64,
    pub price: f64,
    pub price_type: PriceType,
    pub status: OrderStatus,
    pub insert_time: DateTime<Utc>,
    #[serde(default)]
    pub status_msg: String,
}

impl Order {
    /// Lots that have traded so far.
    pub fn volume_filled(&self) -> i64 {
        self.volume - self.volume_left
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// An execution fill. Immutable once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub order_id: String,
    pub symbol: Symbol,
    pub direction: Direction,
    pub offset: Offset,
    pub price: f64,
    pub volume: i64,
    pub trade_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Direction::Buy).unwrap(), "\"BUY\"");
        assert_eq!(
            serde_json::from_str::<Offset>("\"CLOSETODAY\"").unwrap(),
            Offset::CloseToday
        );
    }

    #[test]
    fn loose_parse_accepts_chinese_spellings() {
        assert_eq!(Direction::parse_loose("买入").unwrap(), Direction::Buy);
        assert_eq!(Direction::parse_loose("Sell").unwrap(), Direction::Sell);
        assert_eq!(Offset::parse_loose("平仓").unwrap(), Offset::Close);
        assert!(Direction::parse_loose("hold").is_err());
    }

    #[test]
    fn order_volume_filled() {
        let order = Order {
            order_id: "O1".into(),
            exchange_order_id: None,
            symbol: "SHFE.rb2505".parse().unwrap(),
            direction: Direction::Buy,
            offset: Offset::Open,
            volume: 10,
            volume_left: 4,
            price: 3500.0,
            price_type: PriceType::Limit,
            status: OrderStatus::Active,
            insert_time: Utc::now(),
            status_msg: String::new(),
        };
        assert_eq!(order.volume_filled(), 6);
        assert!(order.is_active());
    }
}
