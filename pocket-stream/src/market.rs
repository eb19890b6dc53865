//! Latest venue-pushed market facts: asset table, ticks, symbol snapshots

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::debug;

use pocket_core::{AssetInfo, HistorySnapshot, StreamTick};

/// Thread-safe store of what the venue pushed without being asked
#[derive(Debug)]
pub struct MarketBook {
    assets: RwLock<HashMap<String, AssetInfo>>,
    /// Size of the latest asset table push
    asset_count: watch::Sender<usize>,
    ticks: RwLock<HashMap<String, StreamTick>>,
    snapshots: RwLock<HashMap<String, HistorySnapshot>>,
}

impl Default for MarketBook {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketBook {
    pub fn new() -> Self {
        let (asset_count, _) = watch::channel(0);
        Self {
            assets: RwLock::new(HashMap::new()),
            asset_count,
            ticks: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the asset table with a fresh push
    pub fn update_assets(&self, assets: Vec<AssetInfo>) {
        debug!("[PO WS] Asset table updated ({} assets)", assets.len());
        let count = {
            let mut table = self.assets.write();
            table.clear();
            for asset in assets {
                table.insert(asset.symbol.clone(), asset);
            }
            table.len()
        };
        self.asset_count.send_replace(count);
    }

    /// Observe asset table pushes; the value is the table size
    pub fn subscribe_assets(&self) -> watch::Receiver<usize> {
        self.asset_count.subscribe()
    }

    pub fn asset(&self, symbol: &str) -> Option<AssetInfo> {
        self.assets.read().get(symbol).cloned()
    }

    pub fn assets(&self) -> Vec<AssetInfo> {
        let mut assets: Vec<AssetInfo> = self.assets.read().values().cloned().collect();
        assets.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        assets
    }

    pub fn has_assets(&self) -> bool {
        !self.assets.read().is_empty()
    }

    /// Payout percentage for `symbol`, if the venue published one
    pub fn payout(&self, symbol: &str) -> Option<f64> {
        self.assets.read().get(symbol).and_then(|a| a.payout)
    }

    /// Keep the newest tick per asset
    pub fn record_tick(&self, tick: StreamTick) {
        let mut ticks = self.ticks.write();
        match ticks.get(&tick.asset) {
            Some(existing) if existing.timestamp > tick.timestamp => {}
            _ => {
                ticks.insert(tick.asset.clone(), tick);
            }
        }
    }

    pub fn last_tick(&self, asset: &str) -> Option<StreamTick> {
        self.ticks.read().get(asset).cloned()
    }

    pub fn store_snapshot(&self, snapshot: HistorySnapshot) {
        self.snapshots
            .write()
            .insert(snapshot.asset.clone(), snapshot);
    }

    pub fn snapshot(&self, asset: &str) -> Option<HistorySnapshot> {
        self.snapshots.read().get(asset).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset(symbol: &str, payout: Option<f64>) -> AssetInfo {
        AssetInfo {
            id: 1,
            symbol: symbol.to_string(),
            name: symbol.to_string(),
            asset_type: "currency".to_string(),
            payout,
            is_open: true,
        }
    }

    #[test]
    fn test_payout_lookup() {
        let book = MarketBook::new();
        book.update_assets(vec![asset("EURUSD_otc", Some(92.0)), asset("GBPUSD", None)]);
        assert_eq!(book.payout("EURUSD_otc"), Some(92.0));
        assert_eq!(book.payout("GBPUSD"), None);
        assert_eq!(book.payout("XAUUSD"), None);
        assert_eq!(book.assets()[0].symbol, "EURUSD_otc");
    }

    #[tokio::test]
    async fn test_asset_push_wakes_subscriber() {
        let book = std::sync::Arc::new(MarketBook::new());
        let mut rx = book.subscribe_assets();
        assert_eq!(*rx.borrow(), 0);

        let pusher = std::sync::Arc::clone(&book);
        tokio::spawn(async move {
            pusher.update_assets(vec![asset("EURUSD_otc", Some(92.0))]);
        });

        let count = *rx.wait_for(|n| *n > 0).await.unwrap();
        assert_eq!(count, 1);
        assert!(book.has_assets());
    }

    #[test]
    fn test_out_of_order_tick_ignored() {
        let book = MarketBook::new();
        let tick = |ts: f64, price: f64| StreamTick {
            asset: "EURUSD_otc".to_string(),
            timestamp: ts,
            price,
        };
        book.record_tick(tick(10.0, 1.1));
        book.record_tick(tick(9.0, 1.0));
        assert_eq!(book.last_tick("EURUSD_otc").unwrap().price, 1.1);
    }
}
