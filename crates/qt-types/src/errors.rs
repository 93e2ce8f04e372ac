use thiserror::Error;

/// Errors raised while constructing or parsing core types.
#[derive(Error, Debug)]
pub enum TypeError {
    #[error("invalid symbol: {symbol} (expected EXCHANGE.instrument)")]
    InvalidSymbol { symbol: String },

    #[error("invalid {field}: {value}")]
    InvalidEnum { field: &'static str, value: String },

    #[error("no 8-digit trading date in filename: {filename}")]
    InvalidFilename { filename: String },

    #[error("cannot read config {path}: {message}")]
    ConfigIo { path: String, message: String },

    #[error("cannot parse config {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("invalid config: {message}")]
    ConfigInvalid { message: String },
}

/// Top-level error type for the qtrader system.
#[derive(Error, Debug)]
pub enum QtError {
    #[error("type error: {0}")]
    Type(#[from] TypeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}
