//! Error types for the TallyGrid store adapter.
//!
//! `Busy` is the transient class: statements failing with it may be retried
//! a bounded number of times. Everything else is structural and fails fast.

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("database busy: {0}")]
    Busy(String),

    #[error("sql error: {0}")]
    Sql(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("row decode error: {0}")]
    Decode(String),
}

impl StoreError {
    /// True for the deadlock/lock-contention class of failures that a
    /// caller may retry with the same statement.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Busy(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match &e {
            rusqlite::Error::SqliteFailure(failure, _)
                if failure.code == ErrorCode::DatabaseBusy
                    || failure.code == ErrorCode::DatabaseLocked =>
            {
                StoreError::Busy(e.to_string())
            }
            _ => StoreError::Sql(e.to_string()),
        }
    }
}
