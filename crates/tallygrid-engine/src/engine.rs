//! AccountingEngine — the RPC-shaped operational surface.
//!
//! The service host layers wire protocol and auth on top; everything that
//! reaches this type is already a validated request shape. Every method
//! returns a structured error, never panics across the boundary.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use tally_core::{epoch_secs, EngineConfig, TypeDefinition};
use tallygrid_store::{names, quote_ident, SqlExecutor, SqlStore, SqlValue};

use crate::bucketing::{calculate_buckets, write_buckets};
use crate::catalog::{is_float_field, TypeCatalog};
use crate::compaction;
use crate::dictionary::KeyDictionary;
use crate::error::{EngineError, EngineResult};
use crate::query::{self, QueryResult, SelectItem, SortItem};

/// Tolerance for matching stored float metrics during raw-row deletion.
const FLOAT_MATCH_EPSILON: f64 = 1e-6;

/// The accounting storage engine.
///
/// Construction loads the type catalog; no operation is accepted before
/// that succeeds.
pub struct AccountingEngine {
    store: SqlStore,
    catalog: TypeCatalog,
    dictionary: KeyDictionary,
    config: EngineConfig,
    /// Per-type locks that keep concurrent workers from stampeding the
    /// same aggregate row's update statement.
    merge_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AccountingEngine {
    pub fn new(store: SqlStore, config: EngineConfig) -> EngineResult<Self> {
        let catalog = TypeCatalog::load(store.clone())?;
        let dictionary = KeyDictionary::new(store.clone());
        Ok(Self {
            store,
            catalog,
            dictionary,
            config,
            merge_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Handle to the underlying store (shared by the ingestion pipeline).
    pub fn store(&self) -> SqlStore {
        self.store.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Type management ─────────────────────────────────────────────

    /// Register an accounting type. Returns `true` if it already existed.
    pub fn register_type(&self, def: TypeDefinition) -> EngineResult<bool> {
        self.catalog.register_type(def)
    }

    /// Drop a type, all its tables, and its catalog row.
    pub fn delete_type(&self, name: &str) -> EngineResult<()> {
        self.catalog.delete_type(name)
    }

    /// All registered type definitions.
    pub fn registered_types(&self) -> Vec<TypeDefinition> {
        self.catalog.definitions()
    }

    /// Look up one registered type.
    pub fn type_definition(&self, name: &str) -> EngineResult<Arc<TypeDefinition>> {
        self.catalog.get(name)
    }

    /// Update a type's retention horizon.
    pub fn set_data_timespan(&self, name: &str, secs: Option<u64>) -> EngineResult<()> {
        self.catalog.set_data_timespan(name, secs)
    }

    // ── Record ingestion / deletion ─────────────────────────────────

    /// Validate a record shape against the catalog and return its type.
    pub fn validate_record(
        &self,
        type_name: &str,
        start: i64,
        end: i64,
        keys: &[String],
        metrics: &[f64],
    ) -> EngineResult<Arc<TypeDefinition>> {
        let def = self.catalog.get(type_name)?;
        if keys.len() != def.key_fields.len() {
            return Err(EngineError::Validation(format!(
                "type '{type_name}' expects {} key values, got {}",
                def.key_fields.len(),
                keys.len()
            )));
        }
        if metrics.len() != def.value_fields.len() {
            return Err(EngineError::Validation(format!(
                "type '{type_name}' expects {} metric values, got {}",
                def.value_fields.len(),
                metrics.len()
            )));
        }
        if start > end {
            return Err(EngineError::Validation(format!(
                "record interval start {start} is after end {end}"
            )));
        }
        Ok(def)
    }

    /// Synchronously insert one record: resolve dictionary ids, append the
    /// raw row, and merge into every touched bucket — all in one
    /// transaction. This is the unit of work a pool worker runs, and the
    /// path compaction replay uses.
    pub fn insert_record_directly(
        &self,
        type_name: &str,
        start: i64,
        end: i64,
        keys: &[String],
        metrics: &[f64],
    ) -> EngineResult<()> {
        let def = self.validate_record(type_name, start, end, keys, metrics)?;
        let key_ids = self.resolve_ids(&def, keys)?;
        let now = epoch_secs();
        let retries = self.config.transient_retries;

        let lock = self.merge_lock(type_name);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        self.store.with_transaction(|tx| {
            let (sql, params) = raw_insert(&def, &key_ids, metrics, start, end);
            tx.execute(&sql, &params)?;
            write_buckets(tx, &def, &key_ids, metrics, 1.0, start, end, now, retries)
                .map_err(engine_to_store)?;
            Ok(())
        })?;

        debug!(type_name, start, end, "record inserted");
        Ok(())
    }

    /// Delete matching raw rows and subtract the record's proportional
    /// contribution from every touched bucket, clamped at zero. Returns
    /// the number of raw rows deleted; zero when nothing matched.
    pub fn delete_record(
        &self,
        type_name: &str,
        start: i64,
        end: i64,
        keys: &[String],
        metrics: &[f64],
    ) -> EngineResult<usize> {
        let def = self.validate_record(type_name, start, end, keys, metrics)?;

        // A dimension value the dictionary has never seen cannot match a
        // stored row.
        let mut key_ids = Vec::with_capacity(keys.len());
        for (field, value) in def.key_fields.iter().zip(keys) {
            match self.dictionary.lookup(type_name, &field.name, value)? {
                Some(id) => key_ids.push(id),
                None => return Ok(0),
            }
        }

        let now = epoch_secs();
        let lock = self.merge_lock(type_name);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let deleted = self.store.with_transaction(|tx| {
            let (sql, params) = raw_delete(&def, &key_ids, metrics, start, end);
            let deleted = tx.execute(&sql, &params)?;
            if deleted == 0 {
                return Ok(0);
            }

            let subtract_sql = bucket_subtract_sql(&def);
            for slice in calculate_buckets(&def, start, end, now) {
                let mut params: Vec<SqlValue> = Vec::new();
                params.push(SqlValue::Real(slice.proportion));
                for metric in metrics {
                    params.push(SqlValue::Real(metric * slice.proportion));
                }
                params.extend(key_ids.iter().map(|id| SqlValue::Int(*id)));
                params.push(SqlValue::Int(slice.start));
                params.push(SqlValue::Int(slice.length));
                tx.execute(&subtract_sql, &params)?;
            }
            Ok(deleted)
        })?;

        debug!(type_name, start, end, deleted, "record deleted");
        Ok(deleted)
    }

    // ── Retrieval ───────────────────────────────────────────────────

    /// Query the bucket table with dictionary joins, grouping, and
    /// aggregation.
    #[allow(clippy::too_many_arguments)]
    pub fn retrieve_bucketed_data(
        &self,
        type_name: &str,
        start: i64,
        end: i64,
        select: &[SelectItem],
        filters: &[(String, Vec<String>)],
        group: &[String],
        order: &[SortItem],
    ) -> EngineResult<QueryResult> {
        let def = self.catalog.get(type_name)?;
        let (sql, params, columns) = query::build_bucket_query(
            &def,
            &self.dictionary,
            start,
            end,
            epoch_secs(),
            select,
            filters,
            group,
            order,
        )?;
        let rows = self.store.query_rows(&sql, &params)?;
        Ok(QueryResult { columns, rows })
    }

    /// Query the raw record table (no bucket-length snapping).
    pub fn retrieve_raw_records(
        &self,
        type_name: &str,
        start: i64,
        end: i64,
        filters: &[(String, Vec<String>)],
        order: &[SortItem],
    ) -> EngineResult<QueryResult> {
        let def = self.catalog.get(type_name)?;
        let (sql, params, columns) =
            query::build_raw_query(&def, &self.dictionary, start, end, filters, order)?;
        let rows = self.store.query_rows(&sql, &params)?;
        Ok(QueryResult { columns, rows })
    }

    // ── Compaction ──────────────────────────────────────────────────

    /// Run retention and compaction for every registered type, or only
    /// those named in `type_filter`. A failing type is logged and skipped.
    pub fn compact_buckets(&self, type_filter: Option<&[&str]>) -> EngineResult<()> {
        let now = epoch_secs();
        let retries = self.config.transient_retries;

        for def in self.catalog.definitions() {
            if let Some(filter) = type_filter {
                if !filter.contains(&def.name.as_str()) {
                    continue;
                }
            }
            let lock = self.merge_lock(&def.name);
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = compaction::compact_type(&self.store, &def, now, retries) {
                warn!(type_name = %def.name, error = %e, "compaction failed for type, continuing");
            }
        }
        Ok(())
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn resolve_ids(&self, def: &TypeDefinition, keys: &[String]) -> EngineResult<Vec<i64>> {
        def.key_fields
            .iter()
            .zip(keys)
            .map(|(field, value)| self.dictionary.id_for(&def.name, &field.name, value))
            .collect()
    }

    fn merge_lock(&self, type_name: &str) -> Arc<Mutex<()>> {
        self.merge_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(type_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// `with_transaction` closures speak `StoreResult`; fold richer engine
/// errors into a store error so they survive the boundary.
fn engine_to_store(e: EngineError) -> tallygrid_store::StoreError {
    match e {
        EngineError::Store(inner) => inner,
        other => tallygrid_store::StoreError::Sql(other.to_string()),
    }
}

fn raw_insert(
    def: &TypeDefinition,
    key_ids: &[i64],
    metrics: &[f64],
    start: i64,
    end: i64,
) -> (String, Vec<SqlValue>) {
    let mut columns: Vec<String> = def
        .key_fields
        .iter()
        .chain(&def.value_fields)
        .map(|f| quote_ident(&f.name))
        .collect();
    columns.push(quote_ident("start_time"));
    columns.push(quote_ident("end_time"));

    let placeholders = vec!["?"; columns.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({placeholders})",
        quote_ident(&names::raw_table(&def.name)),
        columns.join(", ")
    );

    let mut params: Vec<SqlValue> = key_ids.iter().map(|id| SqlValue::Int(*id)).collect();
    params.extend(metrics.iter().map(|m| SqlValue::Real(*m)));
    params.push(SqlValue::Int(start));
    params.push(SqlValue::Int(end));
    (sql, params)
}

fn raw_delete(
    def: &TypeDefinition,
    key_ids: &[i64],
    metrics: &[f64],
    start: i64,
    end: i64,
) -> (String, Vec<SqlValue>) {
    let mut predicates = Vec::new();
    let mut params = Vec::new();

    for (field, id) in def.key_fields.iter().zip(key_ids) {
        predicates.push(format!("{} = ?", quote_ident(&field.name)));
        params.push(SqlValue::Int(*id));
    }
    for (field, metric) in def.value_fields.iter().zip(metrics) {
        // Float metrics match within a small epsilon, not exactly.
        if is_float_field(field.sql_type) {
            predicates.push(format!(
                "ABS({} - ?) < {FLOAT_MATCH_EPSILON}",
                quote_ident(&field.name)
            ));
        } else {
            predicates.push(format!("{} = ?", quote_ident(&field.name)));
        }
        params.push(SqlValue::Real(*metric));
    }
    predicates.push("\"start_time\" = ?".to_string());
    params.push(SqlValue::Int(start));
    predicates.push("\"end_time\" = ?".to_string());
    params.push(SqlValue::Int(end));

    let sql = format!(
        "DELETE FROM {} WHERE {}",
        quote_ident(&names::raw_table(&def.name)),
        predicates.join(" AND ")
    );
    (sql, params)
}

/// Subtractive bucket merge, floored at zero. Parameter order: entries
/// delta, metric deltas, then key ids, start_time, bucket_length.
fn bucket_subtract_sql(def: &TypeDefinition) -> String {
    let mut sets = vec![format!(
        "{col} = MAX(0, {col} - ?)",
        col = quote_ident("entries_in_bucket")
    )];
    for value in &def.value_fields {
        let col = quote_ident(&value.name);
        sets.push(format!("{col} = MAX(0, {col} - ?)"));
    }

    let mut predicates: Vec<String> = def
        .key_fields
        .iter()
        .map(|k| format!("{} = ?", quote_ident(&k.name)))
        .collect();
    predicates.push("\"start_time\" = ?".to_string());
    predicates.push("\"bucket_length\" = ?".to_string());

    format!(
        "UPDATE {} SET {} WHERE {}",
        quote_ident(&names::bucket_table(&def.name)),
        sets.join(", "),
        predicates.join(" AND ")
    )
}
