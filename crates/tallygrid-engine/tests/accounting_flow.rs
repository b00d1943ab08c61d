//! End-to-end accounting flows: proportional bucketing across ladder
//! rungs, grouped retrieval, compaction conservation, and catalog
//! persistence across reopen.

use tally_core::{epoch_secs, BucketRung, EngineConfig, FieldSpec, FieldType, TypeDefinition};
use tallygrid_engine::{Aggregate, AccountingEngine, SelectItem, SortItem};
use tallygrid_store::{SqlExecutor, SqlStore, SqlValue};

fn job_type() -> TypeDefinition {
    TypeDefinition {
        name: "Job".to_string(),
        key_fields: vec![FieldSpec::new("Site", FieldType::Text)],
        value_fields: vec![FieldSpec::new("CPUTime", FieldType::Float)],
        bucket_ladder: vec![
            BucketRung::new(3600, 60),
            BucketRung::new(86400, 300),
            BucketRung::new(0, 3600),
        ],
        data_timespan_secs: None,
    }
}

fn new_engine(store: SqlStore) -> AccountingEngine {
    let engine = AccountingEngine::new(store, EngineConfig::default()).unwrap();
    engine.register_type(job_type()).unwrap();
    engine
}

fn bucket_totals(store: &SqlStore) -> (f64, f64) {
    let rows = store
        .query_rows(
            "SELECT COALESCE(SUM(\"CPUTime\"), 0), COALESCE(SUM(\"entries_in_bucket\"), 0) \
             FROM \"ac_bucket_Job\"",
            &[],
        )
        .unwrap();
    (rows[0][0].as_f64().unwrap(), rows[0][1].as_f64().unwrap())
}

#[test]
fn two_hour_record_spans_two_rungs_and_conserves_cputime() {
    let store = SqlStore::open_in_memory().unwrap();
    let engine = new_engine(store.clone());
    let now = epoch_secs();
    let t0 = now - 7200;

    engine
        .insert_record_directly("Job", t0, t0 + 7200, &["CERN".to_string()], &[7200.0])
        .unwrap();

    // Fine (60s) buckets near now, coarser (300s) buckets further back.
    let rows = store
        .query_rows(
            "SELECT DISTINCT \"bucket_length\" FROM \"ac_bucket_Job\" ORDER BY \"bucket_length\"",
            &[],
        )
        .unwrap();
    let lengths: Vec<i64> = rows.iter().map(|r| r[0].as_i64().unwrap()).collect();
    assert!(lengths.contains(&60), "lengths {lengths:?}");
    assert!(lengths.contains(&300), "lengths {lengths:?}");

    // Total CPUTime across all produced buckets equals the record's value.
    let (cpu, entries) = bucket_totals(&store);
    assert!((cpu - 7200.0).abs() < 1e-6, "cpu {cpu}");
    assert!((entries - 1.0).abs() < 1e-6, "entries {entries}");

    // Grouped retrieval over the window returns one row per site with the
    // inserted total.
    let result = engine
        .retrieve_bucketed_data(
            "Job",
            t0,
            now,
            &[
                SelectItem::field("Site"),
                SelectItem::aggregated("CPUTime", Aggregate::Sum),
            ],
            &[],
            &["Site".to_string()],
            &[SortItem::asc("Site")],
        )
        .unwrap();
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0][0].as_str(), Some("CERN"));
    assert!((result.rows[0][1].as_f64().unwrap() - 7200.0).abs() < 1e-6);
}

#[test]
fn compaction_preserves_metric_and_entry_totals() {
    let store = SqlStore::open_in_memory().unwrap();
    let engine = new_engine(store.clone());
    let now = epoch_secs();

    // A recent record establishes the dictionary entry and some fresh
    // buckets that compaction must leave alone.
    engine
        .insert_record_directly("Job", now - 600, now, &["CERN".to_string()], &[100.0])
        .unwrap();
    let site_id = store
        .query_rows(
            "SELECT \"id\" FROM \"ac_key_Job_Site\" WHERE \"value\" = ?",
            &[SqlValue::from("CERN")],
        )
        .unwrap()[0][0]
        .as_i64()
        .unwrap();

    // Seed aged fine buckets, as if written two hours ago when the data
    // was young and never compacted since.
    let base = (now - 7200) - (now - 7200).rem_euclid(60);
    for i in 0..6 {
        store
            .execute(
                "INSERT INTO \"ac_bucket_Job\" \
                 (\"Site\", \"start_time\", \"bucket_length\", \"entries_in_bucket\", \"CPUTime\") \
                 VALUES (?, ?, ?, ?, ?)",
                &[
                    SqlValue::Int(site_id),
                    SqlValue::Int(base + i * 60),
                    SqlValue::Int(60),
                    SqlValue::Real(1.0),
                    SqlValue::Real(50.0),
                ],
            )
            .unwrap();
    }

    let (cpu_before, entries_before) = bucket_totals(&store);
    assert!((cpu_before - 400.0).abs() < 1e-6);
    assert!((entries_before - 7.0).abs() < 1e-6);

    engine.compact_buckets(None).unwrap();

    // No fine rows remain past the fine rung's max age.
    let stale = store
        .query_rows(
            "SELECT COUNT(*) FROM \"ac_bucket_Job\" \
             WHERE \"bucket_length\" = 60 AND \"start_time\" < ?",
            &[SqlValue::Int(now - 3600)],
        )
        .unwrap()[0][0]
        .as_i64()
        .unwrap();
    assert_eq!(stale, 0);

    // The aged mass moved into coarser buckets with sums intact.
    let (cpu_after, entries_after) = bucket_totals(&store);
    assert!((cpu_after - cpu_before).abs() < 1e-6, "cpu {cpu_after}");
    assert!(
        (entries_after - entries_before).abs() < 1e-6,
        "entries {entries_after}"
    );

    let coarse = store
        .query_rows(
            "SELECT COALESCE(SUM(\"CPUTime\"), 0) FROM \"ac_bucket_Job\" \
             WHERE \"bucket_length\" > 60",
            &[],
        )
        .unwrap()[0][0]
        .as_f64()
        .unwrap();
    assert!(coarse >= 300.0 - 1e-6, "coarse {coarse}");

    // Grouped retrieval still accounts for everything.
    let result = engine
        .retrieve_bucketed_data(
            "Job",
            now - 8000,
            now,
            &[SelectItem::aggregated("CPUTime", Aggregate::Sum)],
            &[],
            &[],
            &[],
        )
        .unwrap();
    assert!((result.rows[0][0].as_f64().unwrap() - 400.0).abs() < 1e-6);
}

#[test]
fn retention_horizon_drops_aged_rows_before_compaction() {
    let store = SqlStore::open_in_memory().unwrap();
    let engine = new_engine(store.clone());
    let now = epoch_secs();

    engine
        .insert_record_directly("Job", now - 600, now, &["CERN".to_string()], &[100.0])
        .unwrap();
    engine
        .insert_record_directly(
            "Job",
            now - 500_000,
            now - 499_000,
            &["CERN".to_string()],
            &[999.0],
        )
        .unwrap();
    engine.set_data_timespan("Job", Some(86400)).unwrap();

    engine.compact_buckets(None).unwrap();

    // Only the recent record's contribution survives.
    let (cpu, _entries) = bucket_totals(&store);
    assert!((cpu - 100.0).abs() < 1e-6, "cpu {cpu}");

    let raw = store
        .query_rows("SELECT COUNT(*) FROM \"ac_type_Job\"", &[])
        .unwrap()[0][0]
        .as_i64()
        .unwrap();
    assert_eq!(raw, 1);
}

#[test]
fn catalog_and_data_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("accounting.db");
    let now = epoch_secs();

    {
        let store = SqlStore::open(&db_path).unwrap();
        let engine = new_engine(store);
        engine
            .insert_record_directly("Job", now - 600, now, &["CERN".to_string()], &[600.0])
            .unwrap();
    }

    let store = SqlStore::open(&db_path).unwrap();
    let engine = AccountingEngine::new(store, EngineConfig::default()).unwrap();

    let types = engine.registered_types();
    assert_eq!(types.len(), 1);
    assert_eq!(types[0].name, "Job");

    let result = engine
        .retrieve_bucketed_data(
            "Job",
            now - 3600,
            now,
            &[
                SelectItem::field("Site"),
                SelectItem::aggregated("CPUTime", Aggregate::Sum),
            ],
            &[],
            &["Site".to_string()],
            &[],
        )
        .unwrap();
    assert_eq!(result.rows[0][0].as_str(), Some("CERN"));
    assert!((result.rows[0][1].as_f64().unwrap() - 600.0).abs() < 1e-6);
}

#[test]
fn insert_delete_inverse_across_rungs() {
    let store = SqlStore::open_in_memory().unwrap();
    let engine = new_engine(store.clone());
    let now = epoch_secs();
    let t0 = now - 7200;

    engine
        .insert_record_directly("Job", t0, t0 + 7200, &["CERN".to_string()], &[7200.0])
        .unwrap();
    let deleted = engine
        .delete_record("Job", t0, t0 + 7200, &["CERN".to_string()], &[7200.0])
        .unwrap();
    assert_eq!(deleted, 1);

    let (cpu, entries) = bucket_totals(&store);
    assert!(cpu.abs() < 1e-6, "cpu {cpu}");
    assert!(entries.abs() < 1e-6, "entries {entries}");
}
