//! Services for the Pocket realtime client
//!
//! This crate sits on top of the session transport and provides candle
//! aggregation, the TTL candle cache, retrying and bounded history fetches,
//! and the `PocketClient` facade consumers talk to.

pub mod candle_cache;
pub mod candle_service;
pub mod client;
pub mod config;
pub mod fetch;
pub mod retry;

pub use candle_cache::{CacheStats, TtlCache};
pub use candle_service::{aggregate, normalize_points, CandleAggregator};
pub use client::PocketClient;
pub use config::FetchConfig;
pub use fetch::{BundleKey, CandleBundle, CandleFetcher, CandleKey, HistorySource};
pub use retry::RetryPolicy;
