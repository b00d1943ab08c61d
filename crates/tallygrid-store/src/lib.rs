//! tallygrid-store — relational store adapter for the TallyGrid engine.
//!
//! Wraps a SQLite database behind a small typed surface: DDL from a schema
//! AST, parameterized DML/SELECT, transactions, and a transient-vs-structural
//! error classification the engine's retry policy keys off.
//!
//! # Architecture
//!
//! ```text
//! SqlStore (Arc<Mutex<Connection>>)
//!   ├── execute / query_rows      parameterized statements
//!   ├── execute_with_retry        bounded retry on Busy classification
//!   ├── with_transaction          closure over a StoreTx handle
//!   └── create_table / drop_table DDL rendered from TableDef/IndexDef
//! ```

pub mod error;
pub mod schema;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use schema::{names, quote_ident, ColumnDef, ColumnType, IndexDef, TableDef};
pub use store::{SqlExecutor, SqlStore, SqlValue, StoreTx};
