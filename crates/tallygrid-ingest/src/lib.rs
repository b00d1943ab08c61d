//! tallygrid-ingest — buffered ingestion for the TallyGrid engine.
//!
//! Records are acknowledged as soon as they land in a type's durable
//! pending table; a periodic sweeper claims lease-free rows and drains
//! them through a bounded worker pool into the raw table and the bucket
//! store. Leases are time-bounded, so rows claimed by a crashed worker
//! become reclaimable, and a startup sweep releases every lease left over
//! from a previous process.
//!
//! # Architecture
//!
//! ```text
//! insert_record_through_queue ──► ac_pending_<type> (durable, immediate ack)
//!                                        │
//!                        sweeper (timer, re-entrancy guarded)
//!                                        │  claim N rows, lease them
//!                                        ▼
//!                          worker pool (semaphore-bounded)
//!                                        │  insert_record_directly
//!                            ok ─ delete pending row
//!                           err ─ release lease, retried next sweep
//! ```

pub mod error;
pub mod pending;
pub mod pipeline;

pub use error::{IngestError, IngestResult};
pub use pending::{PendingQueue, PendingRecord};
pub use pipeline::IngestPipeline;
