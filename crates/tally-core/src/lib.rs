//! tally-core — shared domain types for the TallyGrid accounting engine.
//!
//! Defines the accounting type model (`TypeDefinition`, `FieldSpec`,
//! `BucketRung`), the engine configuration, and epoch-time helpers used
//! by every other TallyGrid crate.

pub mod config;
pub mod time;
pub mod types;

pub use config::EngineConfig;
pub use time::epoch_secs;
pub use types::{BucketRung, DefinitionError, FieldSpec, FieldType, TypeDefinition};
