//! Schema bootstrap, applied idempotently on every open.

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id      TEXT NOT NULL UNIQUE,
    currency        TEXT NOT NULL DEFAULT 'CNY',
    balance         REAL NOT NULL DEFAULT 0,
    available       REAL NOT NULL DEFAULT 0,
    margin          REAL NOT NULL DEFAULT 0,
    float_profit    REAL NOT NULL DEFAULT 0,
    position_profit REAL NOT NULL DEFAULT 0,
    close_profit    REAL NOT NULL DEFAULT 0,
    risk_ratio      REAL NOT NULL DEFAULT 0,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS positions (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id       TEXT NOT NULL,
    symbol           TEXT NOT NULL,
    pos_long         INTEGER NOT NULL DEFAULT 0,
    pos_short        INTEGER NOT NULL DEFAULT 0,
    pos_long_td      INTEGER NOT NULL DEFAULT 0,
    pos_long_yd      INTEGER NOT NULL DEFAULT 0,
    pos_short_td     INTEGER NOT NULL DEFAULT 0,
    pos_short_yd     INTEGER NOT NULL DEFAULT 0,
    open_price_long  REAL NOT NULL DEFAULT 0,
    open_price_short REAL NOT NULL DEFAULT 0,
    float_profit     REAL NOT NULL DEFAULT 0,
    margin           REAL NOT NULL DEFAULT 0,
    updated_at       TEXT NOT NULL,
    UNIQUE(account_id, symbol)
);

CREATE TABLE IF NOT EXISTS trades (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id TEXT NOT NULL,
    trade_id   TEXT NOT NULL UNIQUE,
    order_id   TEXT,
    symbol     TEXT NOT NULL,
    direction  TEXT NOT NULL,
    offset     TEXT NOT NULL,
    price      REAL NOT NULL,
    volume     INTEGER NOT NULL,
    trade_time TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol);

CREATE TABLE IF NOT EXISTS orders (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id        TEXT NOT NULL,
    order_id          TEXT NOT NULL UNIQUE,
    exchange_order_id TEXT,
    symbol            TEXT NOT NULL,
    direction         TEXT NOT NULL,
    offset            TEXT NOT NULL,
    volume            INTEGER NOT NULL,
    volume_left       INTEGER NOT NULL,
    price             REAL,
    price_type        TEXT NOT NULL,
    status            TEXT NOT NULL,
    insert_time       TEXT NOT NULL,
    status_msg        TEXT
);
CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);

CREATE TABLE IF NOT EXISTS jobs (
    job_id            TEXT PRIMARY KEY,
    job_name          TEXT NOT NULL,
    job_group         TEXT NOT NULL DEFAULT 'default',
    job_description   TEXT,
    cron_expression   TEXT NOT NULL,
    job_method        TEXT NOT NULL DEFAULT '',
    last_trigger_time TEXT,
    next_trigger_time TEXT,
    enabled           INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS alarms (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id TEXT NOT NULL,
    alarm_date TEXT NOT NULL,
    alarm_time TEXT NOT NULL,
    source     TEXT NOT NULL,
    title      TEXT NOT NULL,
    detail     TEXT,
    status     TEXT NOT NULL DEFAULT 'UNCONFIRMED',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_alarms_date ON alarms(alarm_date);

CREATE TABLE IF NOT EXISTS rotation_instructions (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id         TEXT NOT NULL,
    strategy_id        TEXT NOT NULL,
    symbol             TEXT NOT NULL,
    offset             TEXT NOT NULL,
    direction          TEXT NOT NULL,
    volume             INTEGER NOT NULL,
    filled_volume      INTEGER NOT NULL DEFAULT 0,
    price              REAL NOT NULL DEFAULT 0,
    order_time         TEXT,
    trading_date       TEXT,
    enabled            INTEGER NOT NULL DEFAULT 1,
    status             TEXT NOT NULL DEFAULT 'PENDING',
    attempt_count      INTEGER NOT NULL DEFAULT 0,
    remaining_attempts INTEGER NOT NULL DEFAULT 0,
    remaining_volume   INTEGER NOT NULL DEFAULT 0,
    current_cmd_id     TEXT,
    last_attempt_time  TEXT,
    error_message      TEXT,
    source             TEXT,
    is_deleted         INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_rotation_date ON rotation_instructions(trading_date);
CREATE INDEX IF NOT EXISTS idx_rotation_deleted ON rotation_instructions(is_deleted);

CREATE TABLE IF NOT EXISTS system_params (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    param_key   TEXT NOT NULL UNIQUE,
    param_value TEXT,
    param_type  TEXT NOT NULL DEFAULT 'string',
    description TEXT,
    grp         TEXT NOT NULL DEFAULT 'general',
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS contracts (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol          TEXT NOT NULL UNIQUE,
    exchange_id     TEXT NOT NULL,
    instrument_name TEXT,
    product_type    TEXT NOT NULL DEFAULT 'FUTURES',
    volume_multiple INTEGER NOT NULL DEFAULT 1,
    price_tick      REAL NOT NULL DEFAULT 0.01,
    min_volume      INTEGER NOT NULL DEFAULT 1,
    update_date     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS switchPos_import (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    file_name  TEXT NOT NULL UNIQUE,
    file_path  TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;
