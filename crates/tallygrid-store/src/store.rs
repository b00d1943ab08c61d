//! SqlStore — SQLite-backed store adapter for TallyGrid.
//!
//! A single connection behind a mutex, shared by clone. Supports both
//! on-disk and in-memory backends (the latter for testing). All statements
//! bind values through parameters; dynamic identifiers only ever come from
//! the schema AST, which quotes them.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::types::ValueRef;
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::schema::{quote_ident, IndexDef, TableDef};

/// A dynamically-typed SQL value, used for both parameters and result cells.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view: integers widen to f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Real(v) => Some(*v),
            SqlValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl rusqlite::types::ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, Value};
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Int(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            SqlValue::Real(v) => ToSqlOutput::Owned(Value::Real(*v)),
            SqlValue::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
        })
    }
}

/// Anything that can execute parameterized statements: the store itself or
/// a transaction handle. Multi-statement engine operations are written
/// against this trait so they run identically in both contexts.
pub trait SqlExecutor {
    fn execute(&self, sql: &str, params: &[SqlValue]) -> StoreResult<usize>;
    fn query_rows(&self, sql: &str, params: &[SqlValue]) -> StoreResult<Vec<Vec<SqlValue>>>;
}

/// Thread-safe store handle backed by SQLite.
#[derive(Clone)]
pub struct SqlStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqlStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path).map_err(|e| StoreError::Open(e.to_string()))?;
        let store = Self::from_connection(conn)?;
        debug!(?path, "store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Open(e.to_string()))?;
        let store = Self::from_connection(conn)?;
        debug!("in-memory store opened");
        Ok(store)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| StoreError::Open(e.to_string()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| StoreError::Open(e.to_string()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| StoreError::Open(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Execute one statement with bounded retry on transient failures.
    pub fn execute_with_retry(
        &self,
        sql: &str,
        params: &[SqlValue],
        retries: u32,
    ) -> StoreResult<usize> {
        let mut attempt = 0;
        loop {
            match self.execute(sql, params) {
                Err(e) if e.is_transient() && attempt < retries => {
                    attempt += 1;
                    warn!(attempt, error = %e, "transient store failure, retrying statement");
                    std::thread::sleep(Duration::from_millis(50 * attempt as u64));
                }
                other => return other,
            }
        }
    }

    /// Run `f` inside a transaction. Commits on `Ok`, rolls back on `Err`.
    ///
    /// The closure must issue every statement through the provided handle;
    /// going back to the store would re-enter the connection mutex.
    pub fn with_transaction<T>(
        &self,
        f: impl FnOnce(&StoreTx<'_>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut conn = self.lock();
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        let handle = StoreTx { tx };
        match f(&handle) {
            Ok(value) => {
                handle
                    .tx
                    .commit()
                    .map_err(|e| StoreError::Transaction(e.to_string()))?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = handle.tx.rollback() {
                    warn!(error = %rollback_err, "transaction rollback failed");
                }
                Err(e)
            }
        }
    }

    // ── DDL ────────────────────────────────────────────────────────

    /// Create a table from its definition if it does not exist yet.
    pub fn create_table(&self, table: &TableDef) -> StoreResult<()> {
        let sql = table.to_sql();
        self.lock()
            .execute(&sql, [])
            .map_err(|e| StoreError::Schema(e.to_string()))?;
        Ok(())
    }

    /// Create a secondary index if it does not exist yet.
    pub fn create_index(&self, index: &IndexDef) -> StoreResult<()> {
        let sql = index.to_sql();
        self.lock()
            .execute(&sql, [])
            .map_err(|e| StoreError::Schema(e.to_string()))?;
        Ok(())
    }

    /// Drop a table. Succeeds if the table is already gone.
    pub fn drop_table(&self, name: &str) -> StoreResult<()> {
        let sql = format!("DROP TABLE IF EXISTS {}", quote_ident(name));
        self.lock()
            .execute(&sql, [])
            .map_err(|e| StoreError::Schema(e.to_string()))?;
        Ok(())
    }

    /// True if a table with this name exists.
    pub fn table_exists(&self, name: &str) -> StoreResult<bool> {
        let rows = self.query_rows(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            &[SqlValue::Text(name.to_string())],
        )?;
        Ok(!rows.is_empty())
    }
}

impl SqlExecutor for SqlStore {
    fn execute(&self, sql: &str, params: &[SqlValue]) -> StoreResult<usize> {
        exec_on(&self.lock(), sql, params)
    }

    fn query_rows(&self, sql: &str, params: &[SqlValue]) -> StoreResult<Vec<Vec<SqlValue>>> {
        query_on(&self.lock(), sql, params)
    }
}

/// Transaction handle passed to `with_transaction` closures.
pub struct StoreTx<'a> {
    tx: rusqlite::Transaction<'a>,
}

impl SqlExecutor for StoreTx<'_> {
    fn execute(&self, sql: &str, params: &[SqlValue]) -> StoreResult<usize> {
        exec_on(&self.tx, sql, params)
    }

    fn query_rows(&self, sql: &str, params: &[SqlValue]) -> StoreResult<Vec<Vec<SqlValue>>> {
        query_on(&self.tx, sql, params)
    }
}

fn exec_on(conn: &Connection, sql: &str, params: &[SqlValue]) -> StoreResult<usize> {
    let mut stmt = conn.prepare(sql)?;
    let count = stmt.execute(rusqlite::params_from_iter(params.iter()))?;
    Ok(count)
}

fn query_on(conn: &Connection, sql: &str, params: &[SqlValue]) -> StoreResult<Vec<Vec<SqlValue>>> {
    let mut stmt = conn.prepare(sql)?;
    let column_count = stmt.column_count();
    let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        let mut cells = Vec::with_capacity(column_count);
        for i in 0..column_count {
            let value = match row.get_ref(i)? {
                ValueRef::Null => SqlValue::Null,
                ValueRef::Integer(v) => SqlValue::Int(v),
                ValueRef::Real(v) => SqlValue::Real(v),
                ValueRef::Text(bytes) => SqlValue::Text(
                    String::from_utf8(bytes.to_vec())
                        .map_err(|e| StoreError::Decode(e.to_string()))?,
                ),
                ValueRef::Blob(_) => {
                    return Err(StoreError::Decode(
                        "unexpected blob column in result set".to_string(),
                    ));
                }
            };
            cells.push(value);
        }
        results.push(cells);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, ColumnType};

    fn counters_table() -> TableDef {
        TableDef::new("counters")
            .column(
                ColumnDef::new("id", ColumnType::Integer)
                    .primary_key()
                    .autoincrement(),
            )
            .column(ColumnDef::new("name", ColumnType::Text).not_null())
            .column(ColumnDef::new("value", ColumnType::Real).not_null())
            .unique(&["name"])
    }

    #[test]
    fn create_insert_query_round_trip() {
        let store = SqlStore::open_in_memory().unwrap();
        store.create_table(&counters_table()).unwrap();

        let inserted = store
            .execute(
                "INSERT INTO \"counters\" (\"name\", \"value\") VALUES (?1, ?2)",
                &[SqlValue::from("cpu"), SqlValue::from(1.5)],
            )
            .unwrap();
        assert_eq!(inserted, 1);

        let rows = store
            .query_rows(
                "SELECT \"name\", \"value\" FROM \"counters\"",
                &[],
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0].as_str(), Some("cpu"));
        assert_eq!(rows[0][1].as_f64(), Some(1.5));
    }

    #[test]
    fn table_exists_reflects_ddl() {
        let store = SqlStore::open_in_memory().unwrap();
        assert!(!store.table_exists("counters").unwrap());

        store.create_table(&counters_table()).unwrap();
        assert!(store.table_exists("counters").unwrap());

        store.drop_table("counters").unwrap();
        assert!(!store.table_exists("counters").unwrap());
        // Dropping again is not an error.
        store.drop_table("counters").unwrap();
    }

    #[test]
    fn upsert_merges_on_conflict() {
        let store = SqlStore::open_in_memory().unwrap();
        store.create_table(&counters_table()).unwrap();

        let sql = "INSERT INTO \"counters\" (\"name\", \"value\") VALUES (?1, ?2) \
                   ON CONFLICT(\"name\") DO UPDATE SET \"value\" = \"value\" + excluded.\"value\"";
        store
            .execute(sql, &[SqlValue::from("cpu"), SqlValue::from(2.0)])
            .unwrap();
        store
            .execute(sql, &[SqlValue::from("cpu"), SqlValue::from(3.0)])
            .unwrap();

        let rows = store
            .query_rows("SELECT \"value\" FROM \"counters\" WHERE \"name\" = ?1", &[
                SqlValue::from("cpu"),
            ])
            .unwrap();
        assert_eq!(rows[0][0].as_f64(), Some(5.0));
    }

    #[test]
    fn transaction_commits_on_ok() {
        let store = SqlStore::open_in_memory().unwrap();
        store.create_table(&counters_table()).unwrap();

        store
            .with_transaction(|tx| {
                tx.execute(
                    "INSERT INTO \"counters\" (\"name\", \"value\") VALUES (?1, ?2)",
                    &[SqlValue::from("a"), SqlValue::from(1.0)],
                )?;
                tx.execute(
                    "INSERT INTO \"counters\" (\"name\", \"value\") VALUES (?1, ?2)",
                    &[SqlValue::from("b"), SqlValue::from(2.0)],
                )?;
                Ok(())
            })
            .unwrap();

        let rows = store.query_rows("SELECT COUNT(*) FROM \"counters\"", &[]).unwrap();
        assert_eq!(rows[0][0].as_i64(), Some(2));
    }

    #[test]
    fn transaction_rolls_back_on_err() {
        let store = SqlStore::open_in_memory().unwrap();
        store.create_table(&counters_table()).unwrap();

        let result: StoreResult<()> = store.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO \"counters\" (\"name\", \"value\") VALUES (?1, ?2)",
                &[SqlValue::from("a"), SqlValue::from(1.0)],
            )?;
            Err(StoreError::Sql("boom".to_string()))
        });
        assert!(result.is_err());

        let rows = store.query_rows("SELECT COUNT(*) FROM \"counters\"", &[]).unwrap();
        assert_eq!(rows[0][0].as_i64(), Some(0));
    }

    #[test]
    fn retry_surfaces_non_transient_immediately() {
        let store = SqlStore::open_in_memory().unwrap();
        let err = store
            .execute_with_retry("INSERT INTO missing VALUES (1)", &[], 3)
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");

        {
            let store = SqlStore::open(&db_path).unwrap();
            store.create_table(&counters_table()).unwrap();
            store
                .execute(
                    "INSERT INTO \"counters\" (\"name\", \"value\") VALUES (?1, ?2)",
                    &[SqlValue::from("cpu"), SqlValue::from(7.0)],
                )
                .unwrap();
        }

        let store = SqlStore::open(&db_path).unwrap();
        let rows = store
            .query_rows("SELECT \"value\" FROM \"counters\"", &[])
            .unwrap();
        assert_eq!(rows[0][0].as_f64(), Some(7.0));
    }

    #[test]
    fn null_and_integer_cells_decode() {
        let store = SqlStore::open_in_memory().unwrap();
        let rows = store.query_rows("SELECT NULL, 42", &[]).unwrap();
        assert_eq!(rows[0][0], SqlValue::Null);
        assert_eq!(rows[0][1], SqlValue::Int(42));
    }
}
