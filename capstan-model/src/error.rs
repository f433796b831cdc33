use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate budget exhausted")]
    RateExhausted {
        /// When the forge says the budget window resets, if known.
        reset_at: Option<DateTime<Utc>>,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("store conflict")]
    StoreConflict,

    #[error("store error: {0}")]
    StoreError(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("feature is emergency-stopped")]
    EmergencyStopped,

    #[error("rollout gate excluded the request: {0}")]
    RolloutGated(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CaptureError>;
