//! Ingestion pipeline — sweeps the pending queues into the engine.
//!
//! `insert_record_through_queue` validates and stages a record, then
//! returns; the sweeper claims lease-free rows on a timer and drains them
//! in fixed-size batches through a semaphore-bounded worker pool. A failed
//! record's lease is released for a later sweep, a processed record's
//! pending row is deleted, so delivery is at-least-once with commutative
//! bucket merges absorbing replays.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use tally_core::{epoch_secs, TypeDefinition};
use tallygrid_engine::AccountingEngine;

use crate::error::IngestResult;
use crate::pending::{PendingQueue, PendingRecord};

/// Drives buffered ingestion for every registered type.
pub struct IngestPipeline {
    engine: Arc<AccountingEngine>,
    queue: PendingQueue,
    /// Bounds the number of in-flight worker batches.
    workers: Arc<Semaphore>,
    /// Sweep re-entrancy guard: epoch seconds since the in-flight sweep
    /// started, cleared on completion or once the safety timeout passes.
    running_since: Mutex<Option<i64>>,
}

impl IngestPipeline {
    pub fn new(engine: Arc<AccountingEngine>) -> Self {
        let queue = PendingQueue::new(engine.store());
        let workers = Arc::new(Semaphore::new(engine.config().worker_pool_size));
        Self {
            engine,
            queue,
            workers,
            running_since: Mutex::new(None),
        }
    }

    /// Stage one record in its type's pending table and return
    /// immediately. No bucketing happens synchronously; a write failure is
    /// reported to the caller and the record is dropped.
    pub fn insert_record_through_queue(
        &self,
        type_name: &str,
        start: i64,
        end: i64,
        keys: &[String],
        metrics: &[f64],
    ) -> IngestResult<()> {
        let def = self
            .engine
            .validate_record(type_name, start, end, keys, metrics)?;
        self.queue.enqueue(&def, start, end, keys, metrics)?;
        debug!(type_name, start, end, "record staged");
        Ok(())
    }

    /// Release every lease across all types. Run once at process start:
    /// rows claimed by a previous process can never complete.
    pub fn mark_all_pending_not_taken(&self) -> IngestResult<()> {
        let mut released = 0;
        for def in self.engine.registered_types() {
            released += self.queue.release_all(&def)?;
        }
        if released > 0 {
            info!(released, "stale pending leases released at startup");
        }
        Ok(())
    }

    /// Run one sweep: claim lease-free rows per type and drain them
    /// through the worker pool, waiting for the dispatched batches.
    ///
    /// Returns `false` without doing anything when another sweep is still
    /// in flight (the re-entrancy guard), unless that sweep has outlived
    /// the safety timeout.
    pub async fn sweep_once(&self) -> IngestResult<bool> {
        let now = epoch_secs();
        {
            let mut guard = self
                .running_since
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(since) = *guard {
                if now - since <= self.engine.config().sweep_guard_timeout_secs {
                    debug!(since, "sweep already in flight, skipping");
                    return Ok(false);
                }
                warn!(since, "sweep guard outlived safety timeout, reclaiming");
            }
            *guard = Some(now);
        }

        let result = self.sweep_inner(now).await;

        *self
            .running_since
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;

        result.map(|()| true)
    }

    async fn sweep_inner(&self, now: i64) -> IngestResult<()> {
        let config = self.engine.config();
        let batch_size = config.batch_size.max(1);
        let mut join_set = JoinSet::new();

        for def in self.engine.registered_types() {
            if self.workers.available_permits() == 0 {
                debug!("worker pool saturated, deferring remaining types to next sweep");
                break;
            }

            let records = self.queue.claim(
                &def,
                config.records_per_sweep,
                config.lease_max_wait_secs,
                now,
            )?;
            if records.is_empty() {
                continue;
            }
            debug!(type_name = %def.name, claimed = records.len(), "pending records claimed");

            for batch in records.chunks(batch_size) {
                let batch = batch.to_vec();
                let engine = self.engine.clone();
                let queue = self.queue.clone();
                let def = def.clone();
                let workers = self.workers.clone();
                join_set.spawn(async move {
                    let Ok(_permit) = workers.acquire_owned().await else {
                        return;
                    };
                    process_batch(&engine, &queue, &def, &batch);
                });
            }
        }

        while join_set.join_next().await.is_some() {}
        Ok(())
    }

    /// Run the sweep loop until shutdown signal.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = std::time::Duration::from_secs(self.engine.config().sweep_interval_secs);
        info!(interval_secs = interval.as_secs(), "ingestion sweeper started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.sweep_once().await {
                        tracing::error!(error = %e, "pending-queue sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("ingestion sweeper shutting down");
                    break;
                }
            }
        }
    }
}

/// Worker unit: drain one batch record-by-record. Success deletes the
/// pending row; failure releases its lease for a later sweep.
fn process_batch(
    engine: &AccountingEngine,
    queue: &PendingQueue,
    def: &TypeDefinition,
    batch: &[PendingRecord],
) {
    for record in batch {
        match engine.insert_record_directly(
            &def.name,
            record.start,
            record.end,
            &record.keys,
            &record.metrics,
        ) {
            Ok(()) => {
                if let Err(e) = queue.delete(def, record.id) {
                    // The record made it in; the leftover pending row will
                    // replay through the commutative bucket merge.
                    warn!(record_id = record.id, error = %e, "failed to delete processed pending row");
                }
            }
            Err(e) => {
                warn!(record_id = record.id, error = %e, "pending record failed, releasing lease");
                if let Err(release_err) = queue.release(def, &[record.id]) {
                    tracing::error!(
                        record_id = record.id,
                        error = %release_err,
                        "failed to release pending lease"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{BucketRung, EngineConfig, FieldSpec, FieldType};
    use tallygrid_store::{SqlExecutor, SqlStore};

    fn job_type() -> TypeDefinition {
        TypeDefinition {
            name: "Job".to_string(),
            key_fields: vec![FieldSpec::new("Site", FieldType::Text)],
            value_fields: vec![FieldSpec::new("CPUTime", FieldType::Float)],
            bucket_ladder: vec![
                BucketRung::new(3600, 60),
                BucketRung::new(0, 3600),
            ],
            data_timespan_secs: None,
        }
    }

    fn setup() -> (Arc<AccountingEngine>, IngestPipeline, SqlStore) {
        let store = SqlStore::open_in_memory().unwrap();
        let engine = Arc::new(
            AccountingEngine::new(store.clone(), EngineConfig::default()).unwrap(),
        );
        engine.register_type(job_type()).unwrap();
        let pipeline = IngestPipeline::new(engine.clone());
        (engine, pipeline, store)
    }

    fn raw_count(store: &SqlStore) -> i64 {
        store
            .query_rows("SELECT COUNT(*) FROM \"ac_type_Job\"", &[])
            .unwrap()[0][0]
            .as_i64()
            .unwrap()
    }

    #[tokio::test]
    async fn staged_records_drain_into_raw_and_buckets() {
        let (_engine, pipeline, store) = setup();
        let now = epoch_secs();

        pipeline
            .insert_record_through_queue("Job", now - 600, now, &["CERN".to_string()], &[600.0])
            .unwrap();
        // Staging alone writes nothing to the raw table.
        assert_eq!(raw_count(&store), 0);

        assert!(pipeline.sweep_once().await.unwrap());

        assert_eq!(raw_count(&store), 1);
        assert_eq!(pipeline.queue.pending_count(&job_type()).unwrap(), 0);

        let rows = store
            .query_rows("SELECT SUM(\"CPUTime\") FROM \"ac_bucket_Job\"", &[])
            .unwrap();
        assert!((rows[0][0].as_f64().unwrap() - 600.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn queue_insert_validates_shape() {
        let (_engine, pipeline, _store) = setup();
        let now = epoch_secs();

        let result =
            pipeline.insert_record_through_queue("Job", now - 10, now, &[], &[600.0]);
        assert!(result.is_err());

        let result = pipeline.insert_record_through_queue(
            "Unknown",
            now - 10,
            now,
            &["CERN".to_string()],
            &[600.0],
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn failed_record_keeps_pending_row_with_free_lease() {
        let (_engine, pipeline, store) = setup();
        let now = epoch_secs();

        pipeline
            .insert_record_through_queue("Job", now - 600, now, &["CERN".to_string()], &[600.0])
            .unwrap();

        // Sabotage the raw table so the worker's insert fails after claim.
        store.drop_table("ac_type_Job").unwrap();
        assert!(pipeline.sweep_once().await.unwrap());

        // The row is still pending and its lease was released.
        let def = job_type();
        assert_eq!(pipeline.queue.pending_count(&def).unwrap(), 1);
        let reclaimed = pipeline
            .queue
            .claim(&def, 10, 900, epoch_secs())
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
    }

    #[tokio::test]
    async fn startup_release_clears_stale_leases() {
        let (_engine, pipeline, _store) = setup();
        let now = epoch_secs();
        let def = job_type();

        pipeline
            .insert_record_through_queue("Job", now - 600, now, &["CERN".to_string()], &[600.0])
            .unwrap();
        // Simulate a crashed worker holding the lease.
        pipeline.queue.claim(&def, 10, 900, now).unwrap();
        assert!(pipeline.queue.claim(&def, 10, 900, now).unwrap().is_empty());

        pipeline.mark_all_pending_not_taken().unwrap();
        let reclaimed = pipeline.queue.claim(&def, 10, 900, now).unwrap();
        assert_eq!(reclaimed.len(), 1);
    }

    #[tokio::test]
    async fn replayed_record_keeps_bucket_sums_consistent() {
        let (engine, pipeline, store) = setup();
        let now = epoch_secs();

        pipeline
            .insert_record_through_queue("Job", now - 600, now, &["CERN".to_string()], &[600.0])
            .unwrap();

        // First processing: insert succeeded but the pending delete was
        // "lost" (crash between insert and delete). Simulate by releasing
        // the lease after the sweep instead of deleting — the row replays.
        let def = job_type();
        let claimed = pipeline.queue.claim(&def, 10, 900, now).unwrap();
        engine
            .insert_record_directly("Job", claimed[0].start, claimed[0].end, &claimed[0].keys, &claimed[0].metrics)
            .unwrap();
        pipeline.queue.release(&def, &[claimed[0].id]).unwrap();

        assert!(pipeline.sweep_once().await.unwrap());

        // Two raw rows (at-least-once), and bucket sums match both.
        assert_eq!(raw_count(&store), 2);
        let rows = store
            .query_rows("SELECT SUM(\"CPUTime\") FROM \"ac_bucket_Job\"", &[])
            .unwrap();
        assert!((rows[0][0].as_f64().unwrap() - 1200.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn sweep_with_nothing_pending_is_ok() {
        let (_engine, pipeline, _store) = setup();
        assert!(pipeline.sweep_once().await.unwrap());
        assert!(pipeline.sweep_once().await.unwrap());
    }
}
