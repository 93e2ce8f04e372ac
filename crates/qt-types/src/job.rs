use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A scheduler entry. Stateless between fires; `last_trigger_time` and
/// `next_trigger_time` are bookkeeping only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub job_name: String,
    #[serde(default = "default_group")]
    pub job_group: String,
    #[serde(default)]
    pub job_description: String,
    /// 5-field (min hour dom mon dow) or 6-field (sec first) cron expression,
    /// evaluated in Asia/Shanghai.
    pub cron_expression: String,
    /// Name of the JobManager method this entry fires.
    pub job_method: String,
    pub enabled: bool,
    #[serde(default)]
    pub last_trigger_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_trigger_time: Option<DateTime<Utc>>,
}

fn default_group() -> String {
    "default".to_string()
}
