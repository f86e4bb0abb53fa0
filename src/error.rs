//! Error types for chainwork.
//!
//! Failure, retry and cancellation of work are states, not errors. The
//! variants here cover misuse (bad chains, oversized data) and conditions
//! the ledger cannot recover from on its own.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("work unit not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: crate::model::State,
        to: crate::model::State,
    },

    #[error("invalid chain: {0}")]
    InvalidChain(String),

    #[error("invalid work unit: {0}")]
    InvalidWork(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("data is {size} bytes, limit is {limit}")]
    DataTooLarge { size: usize, limit: usize },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("scheduling unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt ledger: {0}")]
    Corrupt(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the error came from a busy or locked SQLite database, in
    /// which case the whole transaction can be retried.
    pub(crate) fn is_busy(&self) -> bool {
        matches!(
            self,
            Error::Storage(rusqlite::Error::SqliteFailure(e, _))
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                )
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
