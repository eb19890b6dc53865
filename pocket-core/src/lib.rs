//! Core types for the Pocket realtime client
//!
//! This crate defines the shared data structures used across the client,
//! including candles, orders, asset metadata, session state and the
//! error taxonomy.

pub mod asset;
pub mod candle;
pub mod error;
pub mod order;
pub mod session;

pub use asset::{is_otc_symbol, AssetInfo, OTC_SUFFIX};
pub use candle::{
    align_to_period, is_supported_period, Candle, CandleSeries, HistoryBatch, HistorySnapshot,
    PricePoint, StreamTick, WindowVariation, DEGENERATE_EPSILON, SUPPORTED_PERIODS,
};
pub use error::{PocketError, PocketResult};
pub use order::{
    BuyReceipt, DealRecord, Direction, OpenOrderAck, Order, OrderOutcome, OrderSettlement,
    OrderStatus,
};
pub use session::{Balance, ConnectionState, RequestKind};
