//! Bounded fetch layer
//!
//! Asset-facing candle API on top of the correlator's history requests:
//! TTL caching with single-flight, chunked backward walking for long
//! windows, retries with backoff and fixed concurrency bounds.
//!
//! The venue answers history requests without an id, so pages go out one at
//! a time; concurrency bounds apply to callers, not to the wire.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use pocket_core::{
    align_to_period, is_supported_period, CandleSeries, HistoryBatch, PocketError, PocketResult,
    RequestKind,
};
use pocket_stream::Transport;

use crate::candle_cache::{CacheStats, TtlCache};
use crate::candle_service::CandleAggregator;
use crate::config::FetchConfig;

/// Where history pages come from
#[async_trait]
pub trait HistorySource: Send + Sync + 'static {
    /// One page of `offset` seconds ending at `end_time`
    async fn load_history(
        &self,
        asset: &str,
        period: u32,
        offset: u64,
        end_time: i64,
    ) -> PocketResult<HistoryBatch>;

    /// Current server time in seconds
    fn server_time(&self) -> f64;
}

#[async_trait]
impl HistorySource for Transport {
    async fn load_history(
        &self,
        asset: &str,
        period: u32,
        offset: u64,
        end_time: i64,
    ) -> PocketResult<HistoryBatch> {
        Transport::load_history(self, asset, period, offset, end_time).await
    }

    fn server_time(&self) -> f64 {
        self.clock().server_now()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CandleKey {
    pub asset: String,
    pub period: u32,
    pub count: usize,
}

/// Keyed by the sorted, deduplicated asset set
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BundleKey {
    pub assets: Vec<String>,
    pub period: u32,
    pub count: usize,
}

/// Candles covered by the page behind a realtime price
const REALTIME_WINDOW: u64 = 2;

/// Series per asset
pub type CandleBundle = HashMap<String, CandleSeries>;

fn check_period(period: u32) -> PocketResult<()> {
    if is_supported_period(period) {
        Ok(())
    } else {
        Err(PocketError::config(format!("unsupported period {}s", period)))
    }
}

/// Cached, bounded candle fetching
pub struct CandleFetcher {
    source: Arc<dyn HistorySource>,
    config: FetchConfig,
    candles: TtlCache<CandleKey, CandleSeries>,
    bundles: TtlCache<BundleKey, CandleBundle>,
    price_slots: Semaphore,
    bundle_slots: Semaphore,
    /// One history page on the wire at a time
    wire: Mutex<()>,
}

impl CandleFetcher {
    pub fn new(source: Arc<dyn HistorySource>, config: FetchConfig) -> Self {
        Self {
            source,
            candles: TtlCache::new("PO Candles", config.cache_capacity),
            bundles: TtlCache::new("PO Bundles", config.cache_capacity),
            price_slots: Semaphore::new(config.max_in_flight.max(1)),
            bundle_slots: Semaphore::new(config.bundle_in_flight.max(1)),
            wire: Mutex::new(()),
            config,
        }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub fn candle_cache_stats(&self) -> CacheStats {
        self.candles.stats()
    }

    /// The most recent `count` candles of `asset` at `period`
    #[instrument(skip(self))]
    pub async fn get_candles(
        &self,
        asset: &str,
        period: u32,
        count: usize,
    ) -> PocketResult<CandleSeries> {
        check_period(period)?;
        if count == 0 {
            return Ok(CandleSeries::new(asset, period));
        }

        let key = CandleKey {
            asset: asset.to_string(),
            period,
            count,
        };
        self.candles
            .get_or_fetch(key, self.config.candle_ttl(period), || {
                self.fetch_series(asset, period, count)
            })
            .await
    }

    /// Walk history backwards page by page until `count` candles exist
    async fn fetch_series(
        &self,
        asset: &str,
        period: u32,
        count: usize,
    ) -> PocketResult<CandleSeries> {
        let chunk = self.config.chunk_candles.max(1) as usize;
        let max_pages = count.div_ceil(chunk) + self.config.extra_chunks as usize;
        let offset = u64::from(period) * chunk as u64;

        let mut end_time = align_to_period(self.source.server_time(), period) + i64::from(period);
        let mut merged = CandleAggregator::new(asset, period);

        for page in 1..=max_pages {
            let batch = self
                .config
                .retry
                .run("history", || self.load_page(asset, period, offset, end_time))
                .await?;

            let previous_earliest = merged.earliest();
            merged.extend(batch.points);
            let series = merged.build();
            debug!(
                "[PO Fetch] {} page {}: {} candles so far",
                asset,
                page,
                series.len()
            );

            if series.len() >= count {
                return Ok(series.tail(count));
            }

            match merged.earliest() {
                Some(earliest) if previous_earliest.is_none_or(|p| earliest < p) => {
                    end_time = earliest.floor() as i64;
                }
                _ => {
                    debug!("[PO Fetch] No older history for {}", asset);
                    break;
                }
            }
        }

        Ok(merged.build().tail(count))
    }

    async fn load_page(
        &self,
        asset: &str,
        period: u32,
        offset: u64,
        end_time: i64,
    ) -> PocketResult<HistoryBatch> {
        let _wire = self.wire.lock().await;
        self.source
            .load_history(asset, period, offset, end_time)
            .await
    }

    /// Latest close per asset at `period`; assets that fail or time out are omitted
    ///
    /// Each asset's timeout starts once its page owns the wire, so time
    /// spent queued behind other assets does not count against it.
    #[instrument(skip(self, assets), fields(assets = assets.len()))]
    pub async fn get_realtime_prices(
        &self,
        assets: &[String],
        period: u32,
    ) -> PocketResult<HashMap<String, f64>> {
        check_period(period)?;

        let lookups = assets.iter().map(|asset| async move {
            let _permit = self.price_slots.acquire().await.ok()?;
            match self.fetch_latest(asset, period).await {
                Ok(Some(price)) => Some((asset.clone(), price)),
                Ok(None) => {
                    debug!("[PO Fetch] No recent history for {}", asset);
                    None
                }
                Err(PocketError::RequestTimeout(_)) => {
                    warn!("[PO Fetch] Price for {} timed out", asset);
                    None
                }
                Err(e) => {
                    warn!("[PO Fetch] Price for {} failed: {}", asset, e);
                    None
                }
            }
        });

        Ok(join_all(lookups).await.into_iter().flatten().collect())
    }

    /// Close of the newest candle from one short page
    async fn fetch_latest(&self, asset: &str, period: u32) -> PocketResult<Option<f64>> {
        let end_time = align_to_period(self.source.server_time(), period) + i64::from(period);
        let offset = u64::from(period) * REALTIME_WINDOW;

        let batch = {
            let _wire = self.wire.lock().await;
            timeout(
                self.config.price_timeout,
                self.source.load_history(asset, period, offset, end_time),
            )
            .await
            .map_err(|_| PocketError::RequestTimeout(RequestKind::FetchHistory))??
        };

        let mut candles = CandleAggregator::new(asset, period);
        candles.extend(batch.points);
        Ok(candles.build().last_close())
    }

    /// Series for a set of assets, cached as one unit
    ///
    /// Assets that fail are left out; a bundle where every asset failed is an
    /// error and is not cached.
    #[instrument(skip(self, assets), fields(assets = assets.len()))]
    pub async fn get_candle_bundle(
        &self,
        assets: &[String],
        period: u32,
        count: usize,
    ) -> PocketResult<CandleBundle> {
        check_period(period)?;

        let mut symbols = assets.to_vec();
        symbols.sort();
        symbols.dedup();
        if symbols.is_empty() {
            return Ok(CandleBundle::new());
        }

        let key = BundleKey {
            assets: symbols.clone(),
            period,
            count,
        };

        self.bundles
            .get_or_fetch(key, self.config.bundle_ttl(period), || async {
                let fetches = symbols.iter().map(|asset| async move {
                    let _permit = self.bundle_slots.acquire().await.ok()?;
                    match self.get_candles(asset, period, count).await {
                        Ok(series) => Some((asset.clone(), series)),
                        Err(e) => {
                            warn!("[PO Fetch] Bundle member {} failed: {}", asset, e);
                            None
                        }
                    }
                });

                let bundle: CandleBundle = join_all(fetches).await.into_iter().flatten().collect();
                if bundle.is_empty() {
                    return Err(PocketError::transient(format!(
                        "no series for any of {} assets",
                        symbols.len()
                    )));
                }
                Ok(bundle)
            })
            .await
    }
}
