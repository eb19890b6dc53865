//! Candle Service
//!
//! Aggregates raw price points into OHLC candles. History pages, symbol
//! snapshots and stream ticks all go through the same pass:
//!
//! 1. stable sort by timestamp
//! 2. drop exact-timestamp duplicates, keeping the first seen
//! 3. forward-fill missing prices from the previous point (never backward;
//!    leading points with nothing to fill from are dropped)
//! 4. bucket by `floor(ts / period) * period`, one candle per non-empty bucket
//!
//! Empty buckets stay empty: gaps are never fabricated.

use std::collections::BTreeMap;

use pocket_core::{align_to_period, Candle, CandleSeries, PricePoint};

/// Clean a batch of points into `(timestamp, price)` pairs ready to bucket
pub fn normalize_points(points: impl IntoIterator<Item = PricePoint>) -> Vec<(f64, f64)> {
    let mut points: Vec<PricePoint> = points
        .into_iter()
        .filter(|p| p.timestamp.is_finite())
        .collect();

    // Stable, so equal timestamps keep their arrival order
    points.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
    points.dedup_by(|later, earlier| later.timestamp == earlier.timestamp);

    let mut last_price: Option<f64> = None;
    let mut cleaned = Vec::with_capacity(points.len());

    for point in points {
        let price = point.price.filter(|p| p.is_finite()).or(last_price);
        if let Some(price) = price {
            last_price = Some(price);
            cleaned.push((point.timestamp, price));
        }
    }

    cleaned
}

/// Build a candle series from raw points in one pass
pub fn aggregate(
    asset: impl Into<String>,
    period: u32,
    points: impl IntoIterator<Item = PricePoint>,
) -> CandleSeries {
    let mut buckets: BTreeMap<i64, Candle> = BTreeMap::new();

    for (timestamp, price) in normalize_points(points) {
        let bucket = align_to_period(timestamp, period);
        buckets
            .entry(bucket)
            .and_modify(|candle| candle.apply_price(price))
            .or_insert_with(|| Candle::from_price(bucket, period, price));
    }

    CandleSeries {
        asset: asset.into(),
        period,
        candles: buckets.into_values().collect(),
    }
}

/// Accumulates history pages fetched backwards in chunks
///
/// Overlapping pages are harmless: every build re-runs the full pass over
/// the merged points.
#[derive(Debug, Clone)]
pub struct CandleAggregator {
    asset: String,
    period: u32,
    points: Vec<PricePoint>,
}

impl CandleAggregator {
    pub fn new(asset: impl Into<String>, period: u32) -> Self {
        Self {
            asset: asset.into(),
            period,
            points: Vec::new(),
        }
    }

    pub fn extend(&mut self, points: impl IntoIterator<Item = PricePoint>) {
        self.points.extend(points);
    }

    /// Raw points merged so far, duplicates included
    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    /// Oldest timestamp seen so far
    pub fn earliest(&self) -> Option<f64> {
        self.points
            .iter()
            .map(|p| p.timestamp)
            .filter(|ts| ts.is_finite())
            .min_by(|a, b| a.total_cmp(b))
    }

    pub fn build(&self) -> CandleSeries {
        aggregate(self.asset.clone(), self.period, self.points.iter().copied())
    }
}
