//! Durable pending queue over the per-type staging tables.
//!
//! Every row carries a lease (`taken`, `taken_since`): a sweep claims a
//! batch by setting the lease inside one transaction, and any row whose
//! lease has outlived the max wait is reclaimable by the next sweep.

use tally_core::TypeDefinition;
use tallygrid_store::{names, quote_ident, SqlExecutor, SqlStore, SqlValue};

use crate::error::IngestResult;

/// One claimed pending row.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRecord {
    pub id: i64,
    pub keys: Vec<String>,
    pub metrics: Vec<f64>,
    pub start: i64,
    pub end: i64,
}

/// Handle over the pending tables of all registered types.
#[derive(Clone)]
pub struct PendingQueue {
    store: SqlStore,
}

impl PendingQueue {
    pub fn new(store: SqlStore) -> Self {
        Self { store }
    }

    /// Append one record to a type's pending table.
    pub fn enqueue(
        &self,
        def: &TypeDefinition,
        start: i64,
        end: i64,
        keys: &[String],
        metrics: &[f64],
    ) -> IngestResult<()> {
        let columns = record_columns(def);
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            quote_ident(&names::pending_table(&def.name)),
            columns.join(", ")
        );

        let mut params: Vec<SqlValue> =
            keys.iter().map(|k| SqlValue::from(k.as_str())).collect();
        params.extend(metrics.iter().map(|m| SqlValue::Real(*m)));
        params.push(SqlValue::Int(start));
        params.push(SqlValue::Int(end));

        self.store.execute(&sql, &params)?;
        Ok(())
    }

    /// Atomically claim up to `limit` rows whose lease is free or expired,
    /// stamping them with a fresh lease.
    pub fn claim(
        &self,
        def: &TypeDefinition,
        limit: usize,
        lease_max_wait: i64,
        now: i64,
    ) -> IngestResult<Vec<PendingRecord>> {
        let table = quote_ident(&names::pending_table(&def.name));
        let columns = record_columns(def);
        let select_sql = format!(
            "SELECT \"id\", {} FROM {table} \
             WHERE \"taken\" = 0 OR (? - \"taken_since\") > ? ORDER BY \"id\" LIMIT ?",
            columns.join(", ")
        );

        let records = self.store.with_transaction(|tx| {
            let rows = tx.query_rows(
                &select_sql,
                &[
                    SqlValue::Int(now),
                    SqlValue::Int(lease_max_wait),
                    SqlValue::Int(limit as i64),
                ],
            )?;
            if rows.is_empty() {
                return Ok(Vec::new());
            }

            let records: Vec<PendingRecord> = rows
                .iter()
                .map(|row| decode_record(def, row))
                .collect::<Result<_, _>>()?;

            let placeholders = vec!["?"; records.len()].join(", ");
            let update_sql = format!(
                "UPDATE {table} SET \"taken\" = 1, \"taken_since\" = ? \
                 WHERE \"id\" IN ({placeholders})"
            );
            let mut params = vec![SqlValue::Int(now)];
            params.extend(records.iter().map(|r| SqlValue::Int(r.id)));
            tx.execute(&update_sql, &params)?;

            Ok(records)
        })?;
        Ok(records)
    }

    /// Release the lease on specific rows so a later sweep retries them.
    pub fn release(&self, def: &TypeDefinition, ids: &[i64]) -> IngestResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "UPDATE {} SET \"taken\" = 0, \"taken_since\" = 0 WHERE \"id\" IN ({placeholders})",
            quote_ident(&names::pending_table(&def.name))
        );
        let params: Vec<SqlValue> = ids.iter().map(|id| SqlValue::Int(*id)).collect();
        self.store.execute(&sql, &params)?;
        Ok(())
    }

    /// Delete a fully-processed row.
    pub fn delete(&self, def: &TypeDefinition, id: i64) -> IngestResult<()> {
        self.store.execute(
            &format!(
                "DELETE FROM {} WHERE \"id\" = ?",
                quote_ident(&names::pending_table(&def.name))
            ),
            &[SqlValue::Int(id)],
        )?;
        Ok(())
    }

    /// Release every lease for a type. Returns the number of rows touched.
    ///
    /// Run once at process start: an in-memory in-flight marker cannot
    /// survive a restart, so leases from the previous process are stale by
    /// definition.
    pub fn release_all(&self, def: &TypeDefinition) -> IngestResult<usize> {
        let released = self.store.execute(
            &format!(
                "UPDATE {} SET \"taken\" = 0, \"taken_since\" = 0 WHERE \"taken\" = 1",
                quote_ident(&names::pending_table(&def.name))
            ),
            &[],
        )?;
        Ok(released)
    }

    /// Number of rows currently pending for a type (leased or not).
    pub fn pending_count(&self, def: &TypeDefinition) -> IngestResult<usize> {
        let rows = self.store.query_rows(
            &format!(
                "SELECT COUNT(*) FROM {}",
                quote_ident(&names::pending_table(&def.name))
            ),
            &[],
        )?;
        Ok(rows[0][0].as_i64().unwrap_or(0) as usize)
    }
}

/// Quoted payload columns of a pending table, in table order.
fn record_columns(def: &TypeDefinition) -> Vec<String> {
    let mut columns: Vec<String> = def
        .key_fields
        .iter()
        .chain(&def.value_fields)
        .map(|f| quote_ident(&f.name))
        .collect();
    columns.push(quote_ident("start_time"));
    columns.push(quote_ident("end_time"));
    columns
}

fn decode_record(
    def: &TypeDefinition,
    row: &[SqlValue],
) -> Result<PendingRecord, tallygrid_store::StoreError> {
    let nk = def.key_fields.len();
    let nv = def.value_fields.len();
    if row.len() != 3 + nk + nv {
        return Err(tallygrid_store::StoreError::Decode(format!(
            "pending row has {} cells, expected {}",
            row.len(),
            3 + nk + nv
        )));
    }
    let cell_err =
        || tallygrid_store::StoreError::Decode("pending row cell has wrong type".to_string());

    let id = row[0].as_i64().ok_or_else(cell_err)?;
    let mut keys = Vec::with_capacity(nk);
    for cell in &row[1..1 + nk] {
        keys.push(cell.as_str().ok_or_else(cell_err)?.to_string());
    }
    let mut metrics = Vec::with_capacity(nv);
    for cell in &row[1 + nk..1 + nk + nv] {
        metrics.push(cell.as_f64().ok_or_else(cell_err)?);
    }
    let start = row[1 + nk + nv].as_i64().ok_or_else(cell_err)?;
    let end = row[2 + nk + nv].as_i64().ok_or_else(cell_err)?;

    Ok(PendingRecord {
        id,
        keys,
        metrics,
        start,
        end,
    })
}
