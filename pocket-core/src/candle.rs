//! Price points, OHLC candles and candle series

use serde::{Deserialize, Serialize};

/// Candle periods (seconds) the venue serves history for
pub const SUPPORTED_PERIODS: [u32; 19] = [
    1, 5, 10, 15, 30, 60, 120, 300, 600, 900, 1800, 3600, 7200, 14400, 28800, 43200, 86400,
    604800, 2592000,
];

/// Variation below this is treated as no variation at all
pub const DEGENERATE_EPSILON: f64 = 1e-9;

/// Check whether a period is one the venue understands
pub fn is_supported_period(period: u32) -> bool {
    SUPPORTED_PERIODS.contains(&period)
}

/// Floor a timestamp (seconds) to the start of its bucket
pub fn align_to_period(timestamp: f64, period: u32) -> i64 {
    let period = i64::from(period.max(1));
    (timestamp.floor() as i64).div_euclid(period) * period
}

/// A single raw price observation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    /// Seconds since the epoch, fractional part preserved
    pub timestamp: f64,
    /// `None` when the venue sent the point without a usable value
    pub price: Option<f64>,
}

impl PricePoint {
    pub fn new(timestamp: f64, price: f64) -> Self {
        Self {
            timestamp,
            price: Some(price),
        }
    }

    pub fn missing(timestamp: f64) -> Self {
        Self {
            timestamp,
            price: None,
        }
    }
}

/// A single OHLC candle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bucket start, aligned to `period`
    pub timestamp: i64,
    /// Bucket length in seconds
    pub period: u32,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Candle {
    /// Candle opened by a single price
    pub fn from_price(timestamp: i64, period: u32, price: f64) -> Self {
        Self {
            timestamp,
            period,
            open: price,
            high: price,
            low: price,
            close: price,
        }
    }

    /// Fold another price into the candle
    pub fn apply_price(&mut self, price: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    /// High minus low
    pub fn range(&self) -> f64 {
        self.high - self.low
    }
}

/// Result of checking the recent variation of a series
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WindowVariation {
    /// Highest high minus lowest low over the window
    Range(f64),
    /// Variation was numerically negligible (or the window was empty)
    Degenerate,
}

impl WindowVariation {
    pub fn is_degenerate(&self) -> bool {
        matches!(self, WindowVariation::Degenerate)
    }
}

/// Candles for one asset at one period, oldest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleSeries {
    pub asset: String,
    pub period: u32,
    pub candles: Vec<Candle>,
}

impl CandleSeries {
    /// Create an empty series
    pub fn new(asset: impl Into<String>, period: u32) -> Self {
        Self {
            asset: asset.into(),
            period,
            candles: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Most recent candle
    pub fn latest(&self) -> Option<&Candle> {
        self.candles.last()
    }

    /// Close of the most recent candle
    pub fn last_close(&self) -> Option<f64> {
        self.latest().map(|c| c.close)
    }

    /// Keep only the most recent `count` candles
    pub fn tail(mut self, count: usize) -> Self {
        if self.candles.len() > count {
            let drop = self.candles.len() - count;
            self.candles.drain(..drop);
        }
        self
    }

    /// Whether every consecutive pair of candles is exactly one period apart
    pub fn is_contiguous(&self) -> bool {
        self.candles
            .windows(2)
            .all(|w| w[1].timestamp - w[0].timestamp == i64::from(self.period))
    }

    /// OHLC of the whole series collapsed into one candle at the first bucket
    pub fn summary(&self) -> Option<Candle> {
        let first = self.candles.first()?;
        let last = self.candles.last()?;
        let high = self.candles.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let low = self.candles.iter().map(|c| c.low).fold(f64::MAX, f64::min);

        Some(Candle {
            timestamp: first.timestamp,
            period: self.period,
            open: first.open,
            high,
            low,
            close: last.close,
        })
    }

    /// Variation across the most recent `window` candles
    ///
    /// Reported as `Degenerate` when the range is below `epsilon` so that
    /// ratio-based consumers never divide by (nearly) zero.
    pub fn window_variation(&self, window: usize, epsilon: f64) -> WindowVariation {
        let start = self.candles.len().saturating_sub(window);
        let recent = &self.candles[start..];
        if recent.is_empty() {
            return WindowVariation::Degenerate;
        }

        let high = recent.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let low = recent.iter().map(|c| c.low).fold(f64::MAX, f64::min);
        let range = high - low;

        if !range.is_finite() || range.abs() < epsilon {
            WindowVariation::Degenerate
        } else {
            WindowVariation::Range(range)
        }
    }
}

/// One `loadHistoryPeriod` response
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryBatch {
    pub asset: Option<String>,
    pub period: Option<u32>,
    pub points: Vec<PricePoint>,
}

/// One `updateHistoryNew` push, sent after subscribing to a symbol
#[derive(Debug, Clone, PartialEq)]
pub struct HistorySnapshot {
    pub asset: String,
    pub period: Option<u32>,
    pub points: Vec<PricePoint>,
}

/// One realtime price push from `updateStream`
#[derive(Debug, Clone, PartialEq)]
pub struct StreamTick {
    pub asset: String,
    /// Server clock, seconds since the epoch
    pub timestamp: f64,
    pub price: f64,
}
