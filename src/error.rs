use thiserror::Error;

/// Errors surfaced by the collector's public operations.
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("stream pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("REST error: {0}")]
    Rest(#[from] RestError),

    #[error("operation cancelled")]
    Cancelled,
}

/// Stream pool construction and lifecycle errors.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("no stream accepted symbol {symbol} after {streams} attempts")]
    OverCapacity { symbol: String, streams: usize },

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),
}

/// Errors from a single streaming connection.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("stream closed: {0}")]
    Closed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("stream stopped")]
    Stopped,
}

/// Errors from the exchange REST endpoints.
#[derive(Error, Debug)]
pub enum RestError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("HTTP status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("request cancelled")]
    Cancelled,
}

impl RestError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RestError::Connection(_) | RestError::RateLimit(_))
    }
}

impl From<reqwest::Error> for RestError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RestError::Connection("request timeout".to_string())
        } else if err.is_connect() {
            RestError::Connection("failed to connect to exchange API".to_string())
        } else if let Some(status) = err.status() {
            match status.as_u16() {
                429 => RestError::RateLimit("too many requests".to_string()),
                418 => RestError::Connection("IP address banned by exchange".to_string()),
                403 => RestError::Connection("WAF limit violated".to_string()),
                s @ 500..=599 => RestError::Status {
                    status: s,
                    message: "exchange server error".to_string(),
                },
                s => RestError::Status {
                    status: s,
                    message: err.to_string(),
                },
            }
        } else {
            RestError::Connection(err.to_string())
        }
    }
}

impl From<serde_json::Error> for RestError {
    fn from(err: serde_json::Error) -> Self {
        RestError::Parse(format!("JSON decoding failed: {}", err))
    }
}

/// Errors from sorted views under strict consistency.
#[derive(Error, Debug)]
pub enum ViewError {
    #[error("side version moved from {captured} to {current} since materialization")]
    ConcurrentModification { captured: u64, current: u64 },

    #[error("view has not been materialized")]
    NotMaterialized,
}

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}
