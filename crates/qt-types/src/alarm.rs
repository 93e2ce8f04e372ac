use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

/// Confirmation state of an alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlarmStatus {
    Unconfirmed,
    Confirmed,
}

/// An operator-facing alarm raised by a Trader (error logs, health checks)
/// and stored/broadcast by the Manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmData {
    pub account_id: String,
    /// YYYY-MM-DD.
    pub alarm_date: String,
    /// HH:MM:SS.
    pub alarm_time: String,
    /// Emitting component, e.g. `executor`, `rotation`, `opening_check`.
    pub source: String,
    pub title: String,
    #[serde(default)]
    pub detail: String,
    pub status: AlarmStatus,
    pub created_at: DateTime<Utc>,
}

impl AlarmData {
    pub fn new(account_id: &str, source: &str, title: &str, detail: &str) -> Self {
        let now = Local::now();
        Self {
            account_id: account_id.to_string(),
            alarm_date: now.format("%Y-%m-%d").to_string(),
            alarm_time: now.format("%H:%M:%S").to_string(),
            source: source.to_string(),
            title: title.to_string(),
            detail: detail.to_string(),
            status: AlarmStatus::Unconfirmed,
            created_at: Utc::now(),
        }
    }
}
