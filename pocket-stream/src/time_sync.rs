//! Server clock tracking
//!
//! Every stream tick carries the venue's clock; the offset against the local
//! clock lets candle alignment use server time without a round trip.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use chrono::Utc;

use pocket_core::align_to_period;

/// Offset between the venue clock and the local clock
#[derive(Debug, Default)]
pub struct TimeSync {
    offset_ms: AtomicI64,
    synced: AtomicBool,
}

fn local_now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl TimeSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a server timestamp (seconds) observed now
    pub fn observe(&self, server_ts: f64) {
        self.observe_at(server_ts, local_now_ms());
    }

    /// Record a server timestamp (seconds) observed at `local_ms`
    pub fn observe_at(&self, server_ts: f64, local_ms: i64) {
        if !server_ts.is_finite() || server_ts <= 0.0 {
            return;
        }
        let server_ms = (server_ts * 1000.0).round() as i64;
        self.offset_ms.store(server_ms - local_ms, Ordering::Relaxed);
        self.synced.store(true, Ordering::Relaxed);
    }

    /// `server - local`, zero until the first observation
    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Relaxed)
    }

    /// Estimated server time in seconds
    pub fn server_now(&self) -> f64 {
        self.server_time_at(local_now_ms())
    }

    pub fn server_time_at(&self, local_ms: i64) -> f64 {
        (local_ms + self.offset_ms()) as f64 / 1000.0
    }

    /// Start of the server-clock bucket of `period` seconds containing now
    pub fn aligned_now(&self, period: u32) -> i64 {
        align_to_period(self.server_now(), period)
    }
}
