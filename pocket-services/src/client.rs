//! Pocket client facade
//!
//! One object for consumers: connection lifecycle from the transport, the
//! bounded fetch layer for candles and prices, and order placement.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, instrument, warn};

use pocket_core::{
    is_otc_symbol, AssetInfo, Balance, BuyReceipt, CandleSeries, ConnectionState, Direction,
    HistorySnapshot, OrderSettlement, PocketError, PocketResult,
};
use pocket_stream::{StreamConfig, Transport};

use crate::config::FetchConfig;
use crate::fetch::{CandleBundle, CandleFetcher};

/// High-level client over one venue session
#[derive(Clone)]
pub struct PocketClient {
    transport: Transport,
    fetcher: Arc<CandleFetcher>,
}

impl PocketClient {
    pub fn new(stream: StreamConfig, fetch: FetchConfig) -> Self {
        Self::with_transport(Transport::new(stream), fetch)
    }

    /// Build on an existing transport, e.g. one with a custom connector
    pub fn with_transport(transport: Transport, fetch: FetchConfig) -> Self {
        let fetcher = Arc::new(CandleFetcher::new(Arc::new(transport.clone()), fetch));
        Self { transport, fetcher }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn fetcher(&self) -> &CandleFetcher {
        &self.fetcher
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Connect and authenticate; false when every endpoint failed or auth was refused
    pub async fn connect(&self) -> bool {
        self.transport.connect().await
    }

    pub async fn try_connect(&self) -> PocketResult<()> {
        self.transport.try_connect().await
    }

    pub fn disconnect(&self) {
        self.transport.disconnect();
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.connection_state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.transport.subscribe_state()
    }

    /// Replace the session credential, clearing a previous auth rejection
    pub fn set_credential(&self, credential: impl Into<String>) {
        self.transport.set_credential(credential);
    }

    /// Synced server clock, seconds since the epoch
    pub fn server_time(&self) -> f64 {
        self.transport.clock().server_now()
    }

    // ========================================================================
    // Account
    // ========================================================================

    /// Balance value, only while fresh for the current connection
    pub fn get_balance(&self) -> Option<f64> {
        self.transport.session().balance().map(|b| b.value)
    }

    pub fn balance(&self) -> PocketResult<Balance> {
        self.transport.session().balance().ok_or_else(|| {
            PocketError::stale("no balance received on the current connection")
        })
    }

    /// Wait until the balance and the asset table of the current session arrived
    ///
    /// Both are pushed right after authentication.
    pub async fn wait_for_session_data(&self, within: Duration) -> PocketResult<()> {
        let mut balance = self.transport.session().subscribe_balance();
        let mut assets = self.transport.market().subscribe_assets();

        let arrived = async {
            balance
                .wait_for(Option::is_some)
                .await
                .map_err(|_| PocketError::ConnectionClosed)?;
            assets
                .wait_for(|count| *count > 0)
                .await
                .map_err(|_| PocketError::ConnectionClosed)?;
            Ok::<(), PocketError>(())
        };

        match tokio::time::timeout(within, arrived).await {
            Ok(result) => result,
            Err(_) => Err(PocketError::stale(format!(
                "balance or asset table not pushed within {:?}",
                within
            ))),
        }
    }

    // ========================================================================
    // Market data
    // ========================================================================

    pub async fn get_candles(
        &self,
        asset: &str,
        period: u32,
        count: usize,
    ) -> PocketResult<CandleSeries> {
        self.fetcher.get_candles(asset, period, count).await
    }

    /// Latest close per asset at `period`; assets that fail are left out
    pub async fn get_realtime_prices(
        &self,
        assets: &[String],
        period: u32,
    ) -> PocketResult<HashMap<String, f64>> {
        self.fetcher.get_realtime_prices(assets, period).await
    }

    pub async fn get_candle_bundle(
        &self,
        assets: &[String],
        period: u32,
        count: usize,
    ) -> PocketResult<CandleBundle> {
        self.fetcher.get_candle_bundle(assets, period, count).await
    }

    pub async fn change_symbol(&self, asset: &str, period: u32) -> PocketResult<HistorySnapshot> {
        self.transport.change_symbol(asset, period).await
    }

    /// Payout percentage from the latest asset table
    pub fn get_payout(&self, asset: &str) -> Option<f64> {
        self.transport.market().payout(asset)
    }

    /// Open OTC assets paying at least `min_payout`, best payout first
    pub fn open_otc_assets(&self, min_payout: f64) -> Vec<AssetInfo> {
        let mut assets: Vec<AssetInfo> = self
            .transport
            .market()
            .assets()
            .into_iter()
            .filter(|a| {
                a.is_open
                    && is_otc_symbol(&a.symbol)
                    && a.payout.is_some_and(|p| p >= min_payout)
            })
            .collect();
        assets.sort_by(|a, b| {
            let (pa, pb) = (a.payout.unwrap_or(0.0), b.payout.unwrap_or(0.0));
            pb.total_cmp(&pa).then_with(|| a.symbol.cmp(&b.symbol))
        });
        assets
    }

    // ========================================================================
    // Orders
    // ========================================================================

    /// Place an order; any failure, including a timeout, is a rejected receipt
    #[instrument(skip(self))]
    pub async fn buy(
        &self,
        amount: f64,
        asset: &str,
        direction: Direction,
        duration: u32,
    ) -> BuyReceipt {
        if let Err(e) = validate_order(amount, asset, duration) {
            warn!("[PO WS] Buy refused locally: {}", e);
            return BuyReceipt::rejected();
        }

        match self
            .transport
            .open_order(asset, amount, direction, duration)
            .await
        {
            Ok(order) => BuyReceipt::accepted(order.id),
            Err(e) => {
                warn!("[PO WS] Buy {} {} failed: {}", direction, asset, e);
                BuyReceipt::rejected()
            }
        }
    }

    /// Profit, outcome and final order record; `(None, Unknown)` if it does not settle in time
    #[instrument(skip(self))]
    pub async fn check_outcome(&self, order_id: &str) -> OrderSettlement {
        let timeout = self.fetcher.config().outcome_timeout;
        let settlement = self.transport.check_outcome(order_id, timeout).await;
        info!("[PO WS] Outcome for {}: {:?}", order_id, settlement.outcome);
        settlement
    }
}

fn validate_order(amount: f64, asset: &str, duration: u32) -> PocketResult<()> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(PocketError::order_rejected(format!("invalid amount {}", amount)));
    }
    if asset.trim().is_empty() {
        return Err(PocketError::order_rejected("empty asset"));
    }
    if duration == 0 {
        return Err(PocketError::order_rejected("zero duration"));
    }
    Ok(())
}
