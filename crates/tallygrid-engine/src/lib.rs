//! tallygrid-engine — the TallyGrid accounting storage engine.
//!
//! A dynamically-schematized, time-bucketed metrics store layered on the
//! relational store adapter. Records carry dictionary-encoded dimension
//! fields and numeric metric fields over a `[start, end)` interval; the
//! engine splits each interval into ladder-aligned buckets, merges
//! proportional shares additively, compacts fine buckets into coarser ones
//! as data ages, and answers grouped/aggregated queries.
//!
//! # Architecture
//!
//! ```text
//! AccountingEngine
//!   ├── TypeCatalog     persisted type registry + in-memory mirror
//!   ├── KeyDictionary   string dimension value → surrogate id
//!   ├── bucketing       interval → proportional ladder-aligned slices
//!   ├── compaction      fine buckets → coarse buckets, sums preserved
//!   └── query           bucket/raw retrieval with dictionary joins
//! ```

pub mod bucketing;
pub mod catalog;
pub mod compaction;
pub mod dictionary;
pub mod engine;
pub mod error;
pub mod query;

pub use bucketing::{calculate_buckets, BucketSlice};
pub use catalog::TypeCatalog;
pub use dictionary::KeyDictionary;
pub use engine::AccountingEngine;
pub use error::{EngineError, EngineResult};
pub use query::{Aggregate, QueryResult, SelectItem, SortItem};
