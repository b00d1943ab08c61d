//! Bucketing engine — proportional splitting of record intervals.
//!
//! A record's `[start, end)` interval is walked in ladder-aligned steps.
//! At each step the rung is re-selected from the bucket start's age (a long
//! interval may legitimately cross rungs), the cursor is aligned down to
//! the rung length, and the slice receives `overlap / total` of the
//! record's weight. All arithmetic happens in UTC epoch seconds.

use tally_core::time::align_down;
use tally_core::TypeDefinition;

use tallygrid_store::{names, quote_ident, SqlExecutor, SqlValue};

use crate::error::EngineResult;

/// One ladder-aligned slice of a record's interval.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketSlice {
    /// Aligned bucket start time.
    pub start: i64,
    /// Share of the record's weight landing in this bucket, in (0, 1].
    pub proportion: f64,
    /// Bucket length in seconds; always one of the ladder's lengths.
    pub length: i64,
}

/// Split `[start, end)` into ladder-aligned slices as seen from `now`.
///
/// The proportions sum to 1.0 (within floating tolerance). A zero-length
/// interval yields exactly one slice with proportion 1.0.
pub fn calculate_buckets(
    def: &TypeDefinition,
    start: i64,
    end: i64,
    now: i64,
) -> Vec<BucketSlice> {
    let total = (end - start) as f64;
    if total <= 0.0 {
        let length = def.rung_for_age(now - start).bucket_len_secs as i64;
        return vec![BucketSlice {
            start: align_down(start, length),
            proportion: 1.0,
            length,
        }];
    }

    let mut slices = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let length = def.rung_for_age(now - cursor).bucket_len_secs as i64;
        let aligned = align_down(cursor, length);
        let slice_end = aligned + length;
        let overlap = slice_end.min(end) - cursor;
        slices.push(BucketSlice {
            start: aligned,
            proportion: overlap as f64 / total,
            length,
        });
        cursor = slice_end;
    }
    slices
}

/// Render the additive-merge upsert for a type's bucket table.
///
/// Parameter order: key ids, start_time, bucket_length, entries delta,
/// then one delta per metric.
pub(crate) fn bucket_upsert_sql(def: &TypeDefinition) -> String {
    let table = quote_ident(&names::bucket_table(&def.name));

    let mut columns: Vec<String> = def
        .key_fields
        .iter()
        .map(|k| quote_ident(&k.name))
        .collect();
    columns.push(quote_ident("start_time"));
    columns.push(quote_ident("bucket_length"));
    let conflict = columns.clone();
    columns.push(quote_ident("entries_in_bucket"));
    for value in &def.value_fields {
        columns.push(quote_ident(&value.name));
    }

    let placeholders = vec!["?"; columns.len()].join(", ");
    let mut merges = vec![format!(
        "{col} = {col} + excluded.{col}",
        col = quote_ident("entries_in_bucket")
    )];
    for value in &def.value_fields {
        let col = quote_ident(&value.name);
        merges.push(format!("{col} = {col} + excluded.{col}"));
    }

    format!(
        "INSERT INTO {table} ({}) VALUES ({placeholders}) \
         ON CONFLICT({}) DO UPDATE SET {}",
        columns.join(", "),
        conflict.join(", "),
        merges.join(", ")
    )
}

/// Merge a weighted contribution into every bucket the interval touches.
///
/// `entry_count` is 1.0 for a fresh record and the summed
/// `entries_in_bucket` when compaction replays a group. Each statement is
/// retried up to `retries` times on a transient store failure.
#[allow(clippy::too_many_arguments)]
pub(crate) fn write_buckets(
    exec: &dyn SqlExecutor,
    def: &TypeDefinition,
    key_ids: &[i64],
    metrics: &[f64],
    entry_count: f64,
    start: i64,
    end: i64,
    now: i64,
    retries: u32,
) -> EngineResult<()> {
    let sql = bucket_upsert_sql(def);
    for slice in calculate_buckets(def, start, end, now) {
        let mut params: Vec<SqlValue> = key_ids.iter().map(|id| SqlValue::Int(*id)).collect();
        params.push(SqlValue::Int(slice.start));
        params.push(SqlValue::Int(slice.length));
        params.push(SqlValue::Real(entry_count * slice.proportion));
        for metric in metrics {
            params.push(SqlValue::Real(metric * slice.proportion));
        }
        execute_with_retry(exec, &sql, &params, retries)?;
    }
    Ok(())
}

fn execute_with_retry(
    exec: &dyn SqlExecutor,
    sql: &str,
    params: &[SqlValue],
    retries: u32,
) -> EngineResult<()> {
    let mut attempt = 0;
    loop {
        match exec.execute(sql, params) {
            Ok(_) => return Ok(()),
            Err(e) if e.is_transient() && attempt < retries => {
                attempt += 1;
                tracing::warn!(attempt, error = %e, "bucket merge hit transient failure, retrying");
            }
            Err(e) => return Err(e.into()),
        }
    }
}
