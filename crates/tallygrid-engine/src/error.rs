//! Error types for the TallyGrid engine.
//!
//! Validation failures are rejected synchronously and never partially
//! applied; store errors carry their transient/structural classification
//! through from the adapter; `Consistency` marks "should not happen"
//! states that are surfaced instead of silently defaulted.

use tally_core::DefinitionError;
use tallygrid_store::StoreError;
use thiserror::Error;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown accounting type '{0}'")]
    UnknownType(String),

    #[error("invalid type definition: {0}")]
    Definition(#[from] DefinitionError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unknown field '{field}' for type '{type_name}'")]
    UnknownField { type_name: String, field: String },

    #[error("consistency error: {0}")]
    Consistency(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
