use chrono::{DateTime, Utc};
use thiserror::Error;

pub type FunnelResult<T> = Result<T, FunnelError>;

#[derive(Error, Debug)]
pub enum FunnelError {
    #[error("Invalid date range: start {start} is after end {end}")]
    InvalidRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("Data unavailable: {0}")]
    DataUnavailable(String),

    /// Several sessions matched an order within the same second. Logged, never
    /// returned to callers.
    #[error("Ambiguous attribution for order {order_id}: {candidates} sessions matched")]
    AttributionAmbiguous { order_id: String, candidates: usize },

    #[error("Query for a stale period window was cancelled")]
    Cancelled,

    #[error("Invalid session transition: {0}")]
    InvalidTransition(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl FunnelError {
    /// Whether the caller may retry the same request with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FunnelError::DataUnavailable(_))
    }
}

impl From<config::ConfigError> for FunnelError {
    fn from(err: config::ConfigError) -> Self {
        FunnelError::Config(err.to_string())
    }
}
