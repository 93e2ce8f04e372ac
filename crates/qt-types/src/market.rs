use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::errors::TypeError;

/// A futures instrument keyed by exchange and instrument id.
///
/// Serializes to / parses from the dotted form used by the gateway and the
/// rotation CSV files, e.g. `SHFE.rb2505`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Symbol {
    pub exchange: String,
    pub instrument: String,
}

impl Symbol {
    pub fn new(exchange: &str, instrument: &str) -> Self {
        Self {
            exchange: exchange.to_string(),
            instrument: instrument.to_string(),
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.exchange, self.instrument)
    }
}

impl FromStr for Symbol {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((exchange, instrument)) if !exchange.is_empty() && !instrument.is_empty() => {
                Ok(Self::new(exchange, instrument))
            }
            _ => Err(TypeError::InvalidSymbol {
                symbol: s.to_string(),
            }),
        }
    }
}

impl Serialize for Symbol {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Symbol {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Level-1 market data snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: Symbol,
    pub timestamp: DateTime<Utc>,
    pub last_price: f64,
    pub bid_price1: f64,
    pub bid_volume1: i64,
    pub ask_price1: f64,
    pub ask_volume1: i64,
    pub volume: i64,
    pub open_interest: i64,
    pub upper_limit: f64,
    pub lower_limit: f64,
}

impl Tick {
    /// Best price on the opposite side for an aggressive order in `direction`.
    pub fn opposite_price(&self, direction: crate::orders::Direction) -> f64 {
        match direction {
            crate::orders::Direction::Buy => self.ask_price1,
            crate::orders::Direction::Sell => self.bid_price1,
        }
    }
}

/// An aggregated bar of market data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: Symbol,
    pub timestamp: DateTime<Utc>,
    pub interval: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    pub open_interest: i64,
}

/// Static contract metadata reported by the gateway on connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub symbol: Symbol,
    pub instrument_name: String,
    pub product_type: String,
    pub volume_multiple: i64,
    pub price_tick: f64,
    pub min_volume: i64,
    /// YYYY-MM-DD of the snapshot the contract was last refreshed from.
    pub update_date: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_round_trip() {
        let sym: Symbol = "SHFE.rb2505".parse().unwrap();
        assert_eq!(sym.exchange, "SHFE");
        assert_eq!(sym.instrument, "rb2505");
        assert_eq!(sym.to_string(), "SHFE.rb2505");

        let json = serde_json::to_string(&sym).unwrap();
        assert_eq!(json, "\"SHFE.rb2505\"");
        let back: Symbol = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sym);
    }

    #[test]
    fn symbol_rejects_malformed() {
        assert!("rb2505".parse::<Symbol>().is_err());
        assert!(".rb2505".parse::<Symbol>().is_err());
        assert!("SHFE.".parse::<Symbol>().is_err());
    }

    #[test]
    fn tick_opposite_price() {
        let tick = Tick {
            symbol: "DCE.i2505".parse().unwrap(),
            timestamp: Utc::now(),
            last_price: 800.0,
            bid_price1: 799.5,
            bid_volume1: 10,
            ask_price1: 800.5,
            ask_volume1: 12,
            volume: 1000,
            open_interest: 5000,
            upper_limit: 880.0,
            lower_limit: 720.0,
        };
        assert_eq!(tick.opposite_price(crate::orders::Direction::Buy), 800.5);
        assert_eq!(tick.opposite_price(crate::orders::Direction::Sell), 799.5);
    }
}
