//! Compaction engine — re-buckets aged fine rows into the next coarser rung.
//!
//! For each adjacent ladder pair (fine, coarse), rows older than the fine
//! rung's max age are grouped by (key ids, coarse-aligned start) with their
//! metrics and entry counts summed, deleted, and replayed through the
//! bucketing write path over the group's `[min, max]` start span. Select,
//! delete, and re-insert all run inside one store transaction, so a crash
//! between the delete and the re-insert cannot lose the window.
//!
//! When a type carries a retention horizon, raw and bucket rows older than
//! it are dropped unconditionally before compaction.

use tally_core::TypeDefinition;
use tallygrid_store::{names, quote_ident, SqlExecutor, SqlStore, SqlValue};

use crate::bucketing::write_buckets;
use crate::error::{EngineError, EngineResult};

/// One summed group of fine buckets, keyed by coarse-aligned start.
struct CompactionGroup {
    key_ids: Vec<i64>,
    entries: f64,
    metrics: Vec<f64>,
    min_start: i64,
    max_start: i64,
}

/// Run retention and one full compaction pass for a type.
pub(crate) fn compact_type(
    store: &SqlStore,
    def: &TypeDefinition,
    now: i64,
    retries: u32,
) -> EngineResult<()> {
    enforce_retention(store, def, now)?;

    for pair in def.bucket_ladder.windows(2) {
        let (fine, coarse) = (pair[0], pair[1]);
        let cutoff = now - fine.max_age_secs as i64;

        let result = compact_window(
            store,
            def,
            fine.bucket_len_secs as i64,
            coarse.bucket_len_secs as i64,
            cutoff,
            now,
            retries,
        );
        match result {
            Ok(0) => {}
            Ok(groups) => {
                tracing::info!(
                    type_name = %def.name,
                    fine_len = fine.bucket_len_secs,
                    coarse_len = coarse.bucket_len_secs,
                    groups,
                    "bucket window compacted"
                );
            }
            // One failed window is skipped; the next pair still runs.
            Err(e) => {
                tracing::warn!(
                    type_name = %def.name,
                    fine_len = fine.bucket_len_secs,
                    error = %e,
                    "compaction window failed, skipping"
                );
            }
        }
    }
    Ok(())
}

/// Drop raw and bucket rows older than the type's retention horizon.
fn enforce_retention(store: &SqlStore, def: &TypeDefinition, now: i64) -> EngineResult<()> {
    let Some(timespan) = def.data_timespan_secs else {
        return Ok(());
    };
    let horizon = now - timespan as i64;

    let raw = store.execute(
        &format!(
            "DELETE FROM {} WHERE \"end_time\" < ?",
            quote_ident(&names::raw_table(&def.name))
        ),
        &[SqlValue::Int(horizon)],
    )?;
    let buckets = store.execute(
        &format!(
            "DELETE FROM {} WHERE \"start_time\" < ?",
            quote_ident(&names::bucket_table(&def.name))
        ),
        &[SqlValue::Int(horizon)],
    )?;
    if raw > 0 || buckets > 0 {
        tracing::info!(
            type_name = %def.name,
            raw_rows = raw,
            bucket_rows = buckets,
            "retention horizon enforced"
        );
    }
    Ok(())
}

/// Compact one (fine, coarse) window. Returns the number of groups moved.
fn compact_window(
    store: &SqlStore,
    def: &TypeDefinition,
    fine_len: i64,
    coarse_len: i64,
    cutoff: i64,
    now: i64,
    retries: u32,
) -> EngineResult<usize> {
    let table = quote_ident(&names::bucket_table(&def.name));
    let key_cols: Vec<String> = def
        .key_fields
        .iter()
        .map(|k| quote_ident(&k.name))
        .collect();

    let mut select_cols = key_cols.clone();
    select_cols.push("SUM(\"entries_in_bucket\")".to_string());
    for value in &def.value_fields {
        select_cols.push(format!("SUM({})", quote_ident(&value.name)));
    }
    select_cols.push("MIN(\"start_time\")".to_string());
    select_cols.push("MAX(\"start_time\")".to_string());

    let mut group_cols = key_cols.clone();
    group_cols.push("(\"start_time\" - (\"start_time\" % ?))".to_string());

    let select_sql = format!(
        "SELECT {} FROM {table} WHERE \"bucket_length\" = ? AND \"start_time\" < ? GROUP BY {}",
        select_cols.join(", "),
        group_cols.join(", ")
    );
    let delete_sql =
        format!("DELETE FROM {table} WHERE \"bucket_length\" = ? AND \"start_time\" < ?");

    store.with_transaction(|tx| {
        let rows = tx.query_rows(
            &select_sql,
            &[
                SqlValue::Int(fine_len),
                SqlValue::Int(cutoff),
                SqlValue::Int(coarse_len),
            ],
        )?;
        if rows.is_empty() {
            return Ok(0);
        }

        let groups = rows
            .iter()
            .map(|row| decode_group(def, row))
            .collect::<EngineResult<Vec<_>>>()
            .map_err(engine_to_store)?;

        tx.execute(
            &delete_sql,
            &[SqlValue::Int(fine_len), SqlValue::Int(cutoff)],
        )?;

        for group in &groups {
            write_buckets(
                tx,
                def,
                &group.key_ids,
                &group.metrics,
                group.entries,
                group.min_start,
                group.max_start,
                now,
                retries,
            )
            .map_err(engine_to_store)?;
        }
        Ok(groups.len())
    })
    .map_err(EngineError::from)
}

/// `with_transaction` closures speak `StoreResult`; fold richer engine
/// errors into a store error so they survive the boundary.
fn engine_to_store(e: EngineError) -> tallygrid_store::StoreError {
    match e {
        EngineError::Store(inner) => inner,
        other => tallygrid_store::StoreError::Sql(other.to_string()),
    }
}

fn decode_group(def: &TypeDefinition, row: &[SqlValue]) -> EngineResult<CompactionGroup> {
    let nk = def.key_fields.len();
    let nv = def.value_fields.len();
    let expected = nk + 1 + nv + 2;
    if row.len() != expected {
        return Err(EngineError::Consistency(format!(
            "compaction group row has {} cells, expected {expected}",
            row.len()
        )));
    }

    let cell_err = || EngineError::Consistency("compaction group cell has wrong type".to_string());

    let mut key_ids = Vec::with_capacity(nk);
    for cell in &row[..nk] {
        key_ids.push(cell.as_i64().ok_or_else(cell_err)?);
    }
    let entries = row[nk].as_f64().ok_or_else(cell_err)?;
    let mut metrics = Vec::with_capacity(nv);
    for cell in &row[nk + 1..nk + 1 + nv] {
        metrics.push(cell.as_f64().ok_or_else(cell_err)?);
    }
    let min_start = row[nk + 1 + nv].as_i64().ok_or_else(cell_err)?;
    let max_start = row[nk + 2 + nv].as_i64().ok_or_else(cell_err)?;

    Ok(CompactionGroup {
        key_ids,
        entries,
        metrics,
        min_start,
        max_start,
    })
}
