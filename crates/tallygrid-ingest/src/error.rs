//! Error types for the ingestion pipeline.

use tallygrid_engine::EngineError;
use tallygrid_store::StoreError;
use thiserror::Error;

/// Result type alias for ingestion operations.
pub type IngestResult<T> = Result<T, IngestError>;

/// Errors that can occur during ingestion.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
