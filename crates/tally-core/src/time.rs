//! Epoch-time helpers.
//!
//! All bucket alignment happens in a single UTC epoch-seconds domain;
//! there is no calendar or timezone handling anywhere in the engine.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Align `t` down to a multiple of `len` seconds.
pub fn align_down(t: i64, len: i64) -> i64 {
    t - t.rem_euclid(len)
}
