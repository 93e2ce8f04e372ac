use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::TypeError;
use crate::market::Symbol;
use crate::orders::{Direction, Offset};

/// Lifecycle status of a rotation instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstructionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// How a CSV import treats rows already present for the trading date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportMode {
    /// Add rows on top of the existing set.
    Append,
    /// Soft-delete all prior rows for the same trading date, then insert.
    Replace,
}

/// A persisted rotation instruction, one per CSV row. Soft-deleted only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationInstruction {
    /// DB row id, 0 until persisted.
    #[serde(default)]
    pub id: i64,
    pub account_id: String,
    pub strategy_id: String,
    pub symbol: Symbol,
    pub direction: Direction,
    pub offset: Offset,
    pub volume: i64,
    pub filled_volume: i64,
    #[serde(default)]
    pub price: f64,
    /// HH:MM:SS gate; empty means no gate.
    #[serde(default)]
    pub order_time: Option<String>,
    /// YYYYMMDD taken from the import filename.
    pub trading_date: String,
    pub enabled: bool,
    pub status: InstructionStatus,
    pub attempt_count: i64,
    pub remaining_attempts: i64,
    pub remaining_volume: i64,
    #[serde(default)]
    pub current_cmd_id: Option<String>,
    #[serde(default)]
    pub last_attempt_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Import filename, or a manual-entry marker.
    #[serde(default)]
    pub source: String,
    pub is_deleted: bool,
}

impl RotationInstruction {
    /// Build a fresh instruction from a validated CSV row.
    pub fn from_csv_row(
        account_id: &str,
        strategy_id: &str,
        symbol: Symbol,
        offset: Offset,
        direction: Direction,
        volume: i64,
        order_time: Option<String>,
        trading_date: &str,
        source: &str,
    ) -> Self {
        Self {
            id: 0,
            account_id: account_id.to_string(),
            strategy_id: strategy_id.to_string(),
            symbol,
            direction,
            offset,
            volume,
            filled_volume: 0,
            price: 0.0,
            order_time,
            trading_date: trading_date.to_string(),
            enabled: true,
            status: InstructionStatus::Pending,
            attempt_count: 0,
            remaining_attempts: 3,
            remaining_volume: volume,
            current_cmd_id: None,
            last_attempt_time: None,
            error_message: None,
            source: source.to_string(),
            is_deleted: false,
        }
    }

    /// Re-derive `remaining_volume` and terminal status from fills.
    pub fn reconcile(&mut self) {
        self.remaining_volume = self.volume - self.filled_volume;
        if self.remaining_volume <= 0 {
            self.status = InstructionStatus::Completed;
        }
    }
}

/// Extract the 8-digit YYYYMMDD trading date embedded in an import filename.
pub fn trading_date_from_filename(filename: &str) -> Result<String, TypeError> {
    let bytes = filename.as_bytes();
    for start in 0..bytes.len().saturating_sub(7) {
        let window = &bytes[start..start + 8];
        if window.iter().all(|b| b.is_ascii_digit()) {
            let date = std::str::from_utf8(window).expect("ascii digits");
            // Reject windows that are part of a longer digit run.
            let prev_digit = start > 0 && bytes[start - 1].is_ascii_digit();
            let next_digit = start + 8 < bytes.len() && bytes[start + 8].is_ascii_digit();
            if !prev_digit && !next_digit {
                return Ok(date.to_string());
            }
        }
    }
    Err(TypeError::InvalidFilename {
        filename: filename.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_date_extraction() {
        assert_eq!(trading_date_from_filename("20250115_r.csv").unwrap(), "20250115");
        assert_eq!(
            trading_date_from_filename("rot_ACC1_20250115.csv").unwrap(),
            "20250115"
        );
        assert!(trading_date_from_filename("rotation.csv").is_err());
        assert!(trading_date_from_filename("123456789_too_long.csv").is_err());
    }

    #[test]
    fn reconcile_marks_completed_at_zero_remaining() {
        let mut inst = RotationInstruction::from_csv_row(
            "ACC",
            "S1",
            "DCE.i2505".parse().unwrap(),
            Offset::Open,
            Direction::Buy,
            2,
            Some("09:05:00".into()),
            "20250115",
            "20250115_r.csv",
        );
        inst.filled_volume = 2;
        inst.reconcile();
        assert_eq!(inst.remaining_volume, 0);
        assert_eq!(inst.status, InstructionStatus::Completed);
    }
}
