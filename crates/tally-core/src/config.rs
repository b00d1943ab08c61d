//! Engine configuration.
//!
//! Loaded from a TOML file by the service host, or built with `Default`
//! for embedded/test use. Every knob covers the ingestion pipeline or the
//! store retry policy; the accounting semantics themselves are fixed.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of concurrent ingestion workers.
    pub worker_pool_size: usize,
    /// Seconds between pending-queue sweeps.
    pub sweep_interval_secs: u64,
    /// Maximum pending rows claimed per type per sweep.
    pub records_per_sweep: usize,
    /// Records dispatched to a worker as one batch.
    pub batch_size: usize,
    /// Seconds after which a pending row's lease is considered expired
    /// and the row becomes reclaimable by any worker.
    pub lease_max_wait_secs: i64,
    /// Safety timeout for the sweep re-entrancy guard: a sweep that has
    /// been marked in-flight for longer than this is assumed dead and the
    /// guard is cleared.
    pub sweep_guard_timeout_secs: i64,
    /// Bounded retry count for store statements that fail with a
    /// transient (busy/locked) classification.
    pub transient_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 8,
            sweep_interval_secs: 60,
            records_per_sweep: 1000,
            batch_size: 100,
            lease_max_wait_secs: 900,
            sweep_guard_timeout_secs: 600,
            transient_retries: 3,
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
