use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Value type tag of a system parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Int,
    Float,
    Bool,
}

/// A persisted key/value tunable, grouped for the UI. Risk-control defaults
/// are seeded into group `risk` on first database open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemParam {
    pub param_key: String,
    pub param_value: String,
    pub param_type: ParamType,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_group")]
    pub group: String,
    pub updated_at: DateTime<Utc>,
}

fn default_group() -> String {
    "general".to_string()
}

impl SystemParam {
    pub fn new(key: &str, value: &str, param_type: ParamType, group: &str, description: &str) -> Self {
        Self {
            param_key: key.to_string(),
            param_value: value.to_string(),
            param_type,
            description: description.to_string(),
            group: group.to_string(),
            updated_at: Utc::now(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.param_value.parse().ok()
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.param_value.parse().ok()
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.param_value.as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        }
    }
}
