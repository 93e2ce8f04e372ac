//! The store itself: open/bootstrap, typed upserts, and a transaction scope
//! with commit-on-ok / rollback-on-error semantics.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use qt_types::{
    Account, AlarmData, Contract, Job, Order, ParamType, Position, RiskControlConfig,
    RotationInstruction, SystemParam, Trade,
};

use crate::schema::CREATE_TABLES;

/// Errors raised by store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("row not found: {0}")]
    NotFound(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn enum_to_str<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn enum_from_str<T: DeserializeOwned>(s: &str) -> Result<T, StoreError> {
    serde_json::from_value(Value::String(s.to_string()))
        .map_err(|e| StoreError::Corrupt(format!("{s}: {e}")))
}

fn ts_to_str(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn str_to_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {s}: {e}")))
}

/// The per-account store. `Connection` is guarded by a mutex; async callers
/// wrap calls in `spawn_blocking`.
pub struct Store {
    conn: Mutex<Connection>,
    account_id: String,
}

impl Store {
    /// Open (creating if absent) the database at `path`, apply the schema,
    /// and seed risk-control system parameters on first run.
    pub fn open(
        path: &Path,
        account_id: &str,
        risk: &RiskControlConfig,
    ) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self::bootstrap(conn, account_id, risk)?;
        info!(account_id, path = %path.display(), "database opened");
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory(account_id: &str, risk: &RiskControlConfig) -> Result<Self, StoreError> {
        Self::bootstrap(Connection::open_in_memory()?, account_id, risk)
    }

    fn bootstrap(
        conn: Connection,
        account_id: &str,
        risk: &RiskControlConfig,
    ) -> Result<Self, StoreError> {
        conn.execute_batch(CREATE_TABLES)?;
        let store = Self {
            conn: Mutex::new(conn),
            account_id: account_id.to_string(),
        };
        store.seed_risk_params(risk)?;
        Ok(store)
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Seed group `risk` parameters, leaving any operator-edited value alone.
    fn seed_risk_params(&self, risk: &RiskControlConfig) -> Result<(), StoreError> {
        let defaults = [
            ("risk.max_daily_orders", risk.max_daily_orders.to_string(), ParamType::Int, "max orders per day"),
            ("risk.max_daily_cancels", risk.max_daily_cancels.to_string(), ParamType::Int, "max cancels per day"),
            ("risk.max_order_volume", risk.max_order_volume.to_string(), ParamType::Int, "max lots per order"),
            ("risk.max_split_volume", risk.max_split_volume.to_string(), ParamType::Int, "max lots per executor slice"),
            ("risk.order_timeout", risk.order_timeout.to_string(), ParamType::Float, "seconds before a slice is cancelled"),
        ];
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "INSERT OR IGNORE INTO system_params
             (param_key, param_value, param_type, description, grp, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'risk', ?5)",
        )?;
        for (key, value, param_type, description) in defaults {
            stmt.execute(params![
                key,
                value,
                enum_to_str(&param_type),
                description,
                ts_to_str(&Utc::now()),
            ])?;
        }
        Ok(())
    }

    /// Run `f` inside one transaction: commit on `Ok`, roll back on `Err`.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                // Dropping the transaction rolls it back.
                Err(e)
            }
        }
    }

    // -- Accounts / positions / trades / orders -----------------------------

    pub fn upsert_account(&self, account: &Account) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "INSERT INTO accounts (account_id, currency, balance, available, margin,
                                   float_profit, position_profit, close_profit, risk_ratio, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(account_id) DO UPDATE SET
                 currency = excluded.currency,
                 balance = excluded.balance,
                 available = excluded.available,
                 margin = excluded.margin,
                 float_profit = excluded.float_profit,
                 position_profit = excluded.position_profit,
                 close_profit = excluded.close_profit,
                 risk_ratio = excluded.risk_ratio,
                 updated_at = excluded.updated_at",
            params![
                account.account_id,
                account.currency,
                account.balance,
                account.available,
                account.margin,
                account.float_profit,
                account.position_profit,
                account.close_profit,
                account.risk_ratio,
                ts_to_str(&account.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn upsert_position(&self, position: &Position) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "INSERT INTO positions (account_id, symbol, pos_long, pos_short,
                                    pos_long_td, pos_long_yd, pos_short_td, pos_short_yd,
                                    open_price_long, open_price_short, float_profit, margin, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(account_id, symbol) DO UPDATE SET
                 pos_long = excluded.pos_long,
                 pos_short = excluded.pos_short,
                 pos_long_td = excluded.pos_long_td,
                 pos_long_yd = excluded.pos_long_yd,
                 pos_short_td = excluded.pos_short_td,
                 pos_short_yd = excluded.pos_short_yd,
                 open_price_long = excluded.open_price_long,
                 open_price_short = excluded.open_price_short,
                 float_profit = excluded.float_profit,
                 margin = excluded.margin,
                 updated_at = excluded.updated_at",
            params![
                self.account_id,
                position.symbol.to_string(),
                position.pos_long,
                position.pos_short,
                position.pos_long_td,
                position.pos_long_yd,
                position.pos_short_td,
                position.pos_short_yd,
                position.open_price_long,
                position.open_price_short,
                position.float_profit,
                position.margin,
                ts_to_str(&position.updated_at),
            ],
        )?;
        Ok(())
    }

    /// Trades are immutable; re-delivery of a known `trade_id` is ignored.
    pub fn insert_trade(&self, trade: &Trade) -> Result<bool, StoreError> {
        let inserted = self.conn.lock().execute(
            "INSERT OR IGNORE INTO trades
             (account_id, trade_id, order_id, symbol, direction, offset, price, volume, trade_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                self.account_id,
                trade.trade_id,
                trade.order_id,
                trade.symbol.to_string(),
                enum_to_str(&trade.direction),
                enum_to_str(&trade.offset),
                trade.price,
                trade.volume,
                ts_to_str(&trade.trade_time),
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn upsert_order(&self, order: &Order) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "INSERT INTO orders (account_id, order_id, exchange_order_id, symbol, direction,
                                 offset, volume, volume_left, price, price_type, status,
                                 insert_time, status_msg)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(order_id) DO UPDATE SET
                 volume_left = excluded.volume_left,
                 status = excluded.status,
                 status_msg = excluded.status_msg,
                 exchange_order_id = excluded.exchange_order_id",
            params![
                self.account_id,
                order.order_id,
                order.exchange_order_id,
                order.symbol.to_string(),
                enum_to_str(&order.direction),
                enum_to_str(&order.offset),
                order.volume,
                order.volume_left,
                order.price,
                enum_to_str(&order.price_type),
                enum_to_str(&order.status),
                ts_to_str(&order.insert_time),
                order.status_msg,
            ],
        )?;
        Ok(())
    }

    pub fn count_trades(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM trades", [], |r| r.get(0))?)
    }

    pub fn upsert_contract(&self, contract: &Contract) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "INSERT INTO contracts (symbol, exchange_id, instrument_name, product_type,
                                    volume_multiple, price_tick, min_volume, update_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(symbol) DO UPDATE SET
                 instrument_name = excluded.instrument_name,
                 volume_multiple = excluded.volume_multiple,
                 price_tick = excluded.price_tick,
                 min_volume = excluded.min_volume,
                 update_date = excluded.update_date",
            params![
                contract.symbol.to_string(),
                contract.symbol.exchange,
                contract.instrument_name,
                contract.product_type,
                contract.volume_multiple,
                contract.price_tick,
                contract.min_volume,
                contract.update_date,
            ],
        )?;
        Ok(())
    }

    // -- Jobs ---------------------------------------------------------------

    pub fn upsert_job(&self, job: &Job) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "INSERT INTO jobs (job_id, job_name, job_group, job_description, cron_expression,
                               job_method, last_trigger_time, next_trigger_time, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(job_id) DO UPDATE SET
                 job_name = excluded.job_name,
                 cron_expression = excluded.cron_expression,
                 job_method = excluded.job_method,
                 last_trigger_time = excluded.last_trigger_time,
                 next_trigger_time = excluded.next_trigger_time,
                 enabled = excluded.enabled",
            params![
                job.job_id,
                job.job_name,
                job.job_group,
                job.job_description,
                job.cron_expression,
                job.job_method,
                job.last_trigger_time.as_ref().map(ts_to_str),
                job.next_trigger_time.as_ref().map(ts_to_str),
                job.enabled as i64,
            ],
        )?;
        Ok(())
    }

    // -- Alarms -------------------------------------------------------------

    pub fn insert_alarm(&self, alarm: &AlarmData) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "INSERT INTO alarms (account_id, alarm_date, alarm_time, source, title, detail, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                alarm.account_id,
                alarm.alarm_date,
                alarm.alarm_time,
                alarm.source,
                alarm.title,
                alarm.detail,
                enum_to_str(&alarm.status),
                ts_to_str(&alarm.created_at),
            ],
        )?;
        Ok(())
    }

    /// Drop alarms created before `cutoff`. Returns how many went.
    pub fn delete_alarms_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let deleted = self.conn.lock().execute(
            "DELETE FROM alarms WHERE created_at < ?1",
            params![ts_to_str(&cutoff)],
        )?;
        if deleted > 0 {
            debug!(deleted, "old alarms removed");
        }
        Ok(deleted)
    }

    pub fn count_alarms(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM alarms", [], |r| r.get(0))?)
    }

    // -- Rotation instructions ---------------------------------------------

    fn instruction_from_row(row: &Row<'_>) -> rusqlite::Result<RotationInstruction> {
        let symbol: String = row.get("symbol")?;
        let direction: String = row.get("direction")?;
        let offset: String = row.get("offset")?;
        let status: String = row.get("status")?;
        let last_attempt: Option<String> = row.get("last_attempt_time")?;
        Ok(RotationInstruction {
            id: row.get("id")?,
            account_id: row.get("account_id")?,
            strategy_id: row.get("strategy_id")?,
            symbol: symbol.parse().map_err(|_| {
                rusqlite::Error::InvalidColumnType(0, "symbol".into(), rusqlite::types::Type::Text)
            })?,
            direction: enum_from_str(&direction).map_err(|_| {
                rusqlite::Error::InvalidColumnType(0, "direction".into(), rusqlite::types::Type::Text)
            })?,
            offset: enum_from_str(&offset).map_err(|_| {
                rusqlite::Error::InvalidColumnType(0, "offset".into(), rusqlite::types::Type::Text)
            })?,
            volume: row.get("volume")?,
            filled_volume: row.get("filled_volume")?,
            price: row.get("price")?,
            order_time: row.get("order_time")?,
            trading_date: row.get::<_, Option<String>>("trading_date")?.unwrap_or_default(),
            enabled: row.get::<_, i64>("enabled")? != 0,
            status: enum_from_str(&status).map_err(|_| {
                rusqlite::Error::InvalidColumnType(0, "status".into(), rusqlite::types::Type::Text)
            })?,
            attempt_count: row.get("attempt_count")?,
            remaining_attempts: row.get("remaining_attempts")?,
            remaining_volume: row.get("remaining_volume")?,
            current_cmd_id: row.get("current_cmd_id")?,
            last_attempt_time: last_attempt.and_then(|s| str_to_ts(&s).ok()),
            error_message: row.get("error_message")?,
            source: row.get::<_, Option<String>>("source")?.unwrap_or_default(),
            is_deleted: row.get::<_, i64>("is_deleted")? != 0,
        })
    }

    pub fn insert_instruction(&self, instruction: &RotationInstruction) -> Result<i64, StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO rotation_instructions
             (account_id, strategy_id, symbol, offset, direction, volume, filled_volume, price,
              order_time, trading_date, enabled, status, attempt_count, remaining_attempts,
              remaining_volume, current_cmd_id, last_attempt_time, error_message, source, is_deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
            params![
                instruction.account_id,
                instruction.strategy_id,
                instruction.symbol.to_string(),
                enum_to_str(&instruction.offset),
                enum_to_str(&instruction.direction),
                instruction.volume,
                instruction.filled_volume,
                instruction.price,
                instruction.order_time,
                instruction.trading_date,
                instruction.enabled as i64,
                enum_to_str(&instruction.status),
                instruction.attempt_count,
                instruction.remaining_attempts,
                instruction.remaining_volume,
                instruction.current_cmd_id,
                instruction.last_attempt_time.as_ref().map(ts_to_str),
                instruction.error_message,
                instruction.source,
                instruction.is_deleted as i64,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_instruction(&self, instruction: &RotationInstruction) -> Result<(), StoreError> {
        let updated = self.conn.lock().execute(
            "UPDATE rotation_instructions SET
                 filled_volume = ?2, remaining_volume = ?3, status = ?4, enabled = ?5,
                 attempt_count = ?6, remaining_attempts = ?7, current_cmd_id = ?8,
                 last_attempt_time = ?9, error_message = ?10, is_deleted = ?11,
                 order_time = ?12, volume = ?13, price = ?14
             WHERE id = ?1",
            params![
                instruction.id,
                instruction.filled_volume,
                instruction.remaining_volume,
                enum_to_str(&instruction.status),
                instruction.enabled as i64,
                instruction.attempt_count,
                instruction.remaining_attempts,
                instruction.current_cmd_id,
                instruction.last_attempt_time.as_ref().map(ts_to_str),
                instruction.error_message,
                instruction.is_deleted as i64,
                instruction.order_time,
                instruction.volume,
                instruction.price,
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!(
                "rotation instruction {}",
                instruction.id
            )));
        }
        Ok(())
    }

    pub fn instruction_by_id(&self, id: i64) -> Result<Option<RotationInstruction>, StoreError> {
        let conn = self.conn.lock();
        let result = conn
            .query_row(
                "SELECT * FROM rotation_instructions WHERE id = ?1",
                params![id],
                Self::instruction_from_row,
            )
            .optional()?;
        Ok(result)
    }

    /// Non-deleted instructions for one trading date.
    pub fn instructions_by_date(
        &self,
        trading_date: &str,
    ) -> Result<Vec<RotationInstruction>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM rotation_instructions
             WHERE trading_date = ?1 AND is_deleted = 0 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![trading_date], Self::instruction_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn soft_delete_instructions(&self, ids: &[i64]) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("UPDATE rotation_instructions SET is_deleted = 1 WHERE id = ?1")?;
        let mut deleted = 0;
        for id in ids {
            deleted += stmt.execute(params![id])?;
        }
        Ok(deleted)
    }

    /// `replace`-mode import precursor: soft-delete every live row of a date.
    pub fn soft_delete_by_date(&self, trading_date: &str) -> Result<usize, StoreError> {
        Ok(self.conn.lock().execute(
            "UPDATE rotation_instructions SET is_deleted = 1
             WHERE trading_date = ?1 AND is_deleted = 0",
            params![trading_date],
        )?)
    }

    // -- switchPos import records ------------------------------------------

    pub fn import_recorded(&self, file_name: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM switchPos_import WHERE file_name = ?1",
            params![file_name],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn record_import(&self, file_name: &str, file_path: &str) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "INSERT OR IGNORE INTO switchPos_import (file_name, file_path, created_at)
             VALUES (?1, ?2, ?3)",
            params![file_name, file_path, ts_to_str(&Utc::now())],
        )?;
        Ok(())
    }

    // -- System parameters --------------------------------------------------

    fn param_from_row(row: &Row<'_>) -> rusqlite::Result<SystemParam> {
        let param_type: String = row.get("param_type")?;
        let updated_at: String = row.get("updated_at")?;
        Ok(SystemParam {
            param_key: row.get("param_key")?,
            param_value: row.get::<_, Option<String>>("param_value")?.unwrap_or_default(),
            param_type: enum_from_str(&param_type).unwrap_or(ParamType::String),
            description: row.get::<_, Option<String>>("description")?.unwrap_or_default(),
            group: row.get("grp")?,
            updated_at: str_to_ts(&updated_at).unwrap_or_else(|_| Utc::now()),
        })
    }

    pub fn list_system_params(&self) -> Result<Vec<SystemParam>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM system_params ORDER BY grp, param_key")?;
        let rows = stmt.query_map([], Self::param_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn system_params_by_group(&self, group: &str) -> Result<Vec<SystemParam>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM system_params WHERE grp = ?1 ORDER BY param_key")?;
        let rows = stmt.query_map(params![group], Self::param_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_system_param(&self, key: &str) -> Result<Option<SystemParam>, StoreError> {
        let conn = self.conn.lock();
        let result = conn
            .query_row(
                "SELECT * FROM system_params WHERE param_key = ?1",
                params![key],
                Self::param_from_row,
            )
            .optional()?;
        Ok(result)
    }

    pub fn set_system_param(&self, param: &SystemParam) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "INSERT INTO system_params (param_key, param_value, param_type, description, grp, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(param_key) DO UPDATE SET
                 param_value = excluded.param_value,
                 param_type = excluded.param_type,
                 description = excluded.description,
                 grp = excluded.grp,
                 updated_at = excluded.updated_at",
            params![
                param.param_key,
                param.param_value,
                enum_to_str(&param.param_type),
                param.description,
                param.group,
                ts_to_str(&param.updated_at),
            ],
        )?;
        Ok(())
    }
}
