//! Fetch layer configuration

use std::time::Duration;

use tracing::warn;

use crate::retry::RetryPolicy;

/// Realtime price requests allowed in flight at once
pub const MAX_IN_FLIGHT: usize = 10;

/// Per-asset fetches allowed in flight while filling a bundle
pub const BUNDLE_IN_FLIGHT: usize = 5;

/// Budget for one realtime price
pub const PRICE_TIMEOUT: Duration = Duration::from_secs(3);

/// Settings for candle fetching, caching and retries
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub max_in_flight: usize,
    pub bundle_in_flight: usize,
    pub price_timeout: Duration,
    pub retry: RetryPolicy,
    /// Candle series live for `period * candle_ttl_factor` seconds
    pub candle_ttl_factor: u32,
    /// Bundles live for `period * bundle_ttl_factor` seconds
    pub bundle_ttl_factor: u32,
    /// Candles requested per history page
    pub chunk_candles: u32,
    /// Pages allowed beyond what `count` strictly needs
    pub extra_chunks: u32,
    pub cache_capacity: usize,
    /// Upper bound on waiting for an order to settle
    pub outcome_timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_in_flight: MAX_IN_FLIGHT,
            bundle_in_flight: BUNDLE_IN_FLIGHT,
            price_timeout: PRICE_TIMEOUT,
            retry: RetryPolicy::default(),
            candle_ttl_factor: 1,
            bundle_ttl_factor: 5,
            chunk_candles: 150,
            extra_chunks: 2,
            cache_capacity: 1024,
            outcome_timeout: Duration::from_secs(120),
        }
    }
}

impl FetchConfig {
    /// Defaults with `PO_MAX_INFLIGHT` / `PO_PRICE_TIMEOUT_MS` overrides
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(value) = env_number::<usize>("PO_MAX_INFLIGHT") {
            config.max_in_flight = value.max(1);
        }
        if let Some(value) = env_number::<u64>("PO_PRICE_TIMEOUT_MS") {
            config.price_timeout = Duration::from_millis(value);
        }

        config
    }

    pub fn candle_ttl(&self, period: u32) -> Duration {
        Duration::from_secs(u64::from(period) * u64::from(self.candle_ttl_factor.max(1)))
    }

    pub fn bundle_ttl(&self, period: u32) -> Duration {
        Duration::from_secs(u64::from(period) * u64::from(self.bundle_ttl_factor.max(1)))
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("[PO Fetch] Ignoring {}={:?}: not a number", name, raw);
            None
        }
    }
}
