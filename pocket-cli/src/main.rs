//! Pocket market snapshot
//!
//! Connects with the session credential from the environment, then prints the
//! balance, open OTC assets above a payout floor, latest prices and a candle
//! summary per asset.
//!
//! Environment:
//! - `PO_SSID`: full auth frame copied from the web client (required)
//! - `PO_DEMO`: `1` for the demo venue
//! - `PO_ASSETS`: comma-separated symbols; defaults to the open OTC list
//! - `PO_TIMEFRAME`: candle period in seconds (default 60)
//! - `PO_MIN_PAYOUT`: payout floor in percent (default 80)

use std::time::Duration;

use anyhow::{bail, Context};
use pocket_core::{is_supported_period, DEGENERATE_EPSILON};
use pocket_services::{FetchConfig, PocketClient};
use pocket_stream::StreamConfig;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Candles summarised per asset
const SUMMARY_CANDLES: usize = 30;

/// Window used for the flat-market check
const VARIATION_WINDOW: usize = 5;

/// Symbols listed when no `PO_ASSETS` are configured
const DEFAULT_ASSET_LIMIT: usize = 10;

/// How long to wait for the asset table after connecting
const ASSETS_WAIT: Duration = Duration::from_secs(5);

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .ok()
            .with_context(|| format!("{} is not valid: {:?}", name, raw)),
        _ => Ok(default),
    }
}

fn configured_assets() -> Vec<String> {
    std::env::var("PO_ASSETS")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env: {}", e);
        }
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,pocket_stream=debug")),
        )
        .init();

    let period: u32 = env_or("PO_TIMEFRAME", 60)?;
    let min_payout: f64 = env_or("PO_MIN_PAYOUT", 80.0)?;
    if !is_supported_period(period) {
        bail!("PO_TIMEFRAME={} is not a supported candle period", period);
    }

    let stream = StreamConfig::default();
    if stream.ssid.is_none() {
        bail!("PO_SSID is not set");
    }

    let client = PocketClient::new(stream, FetchConfig::from_env());
    client.try_connect().await.context("connecting to the venue")?;

    let result = tokio::select! {
        result = snapshot(&client, period, min_payout) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            Ok(())
        }
    };

    client.disconnect();
    result
}

async fn snapshot(client: &PocketClient, period: u32, min_payout: f64) -> anyhow::Result<()> {
    if let Err(e) = client.wait_for_session_data(ASSETS_WAIT).await {
        warn!("Continuing without full session data: {}", e);
    }

    match client.balance() {
        Ok(balance) => info!(
            "Balance: {:.2} ({})",
            balance.value,
            if balance.is_demo { "demo" } else { "live" }
        ),
        Err(e) => warn!("Balance unavailable: {}", e),
    }

    let open = client.open_otc_assets(min_payout);
    info!("{} open OTC assets at or above {}% payout", open.len(), min_payout);
    for asset in open.iter().take(DEFAULT_ASSET_LIMIT) {
        info!("  {:<16} {:>5.1}%", asset.symbol, asset.payout.unwrap_or_default());
    }

    let mut assets = configured_assets();
    if assets.is_empty() {
        assets = open
            .iter()
            .take(DEFAULT_ASSET_LIMIT)
            .map(|a| a.symbol.clone())
            .collect();
    }
    if assets.is_empty() {
        warn!("No assets to fetch");
        return Ok(());
    }

    let prices = client
        .get_realtime_prices(&assets, period)
        .await
        .context("fetching prices")?;
    let bundle = client
        .get_candle_bundle(&assets, period, SUMMARY_CANDLES)
        .await
        .context("fetching candles")?;

    for asset in &assets {
        let price = prices
            .get(asset)
            .map(|p| format!("{:.5}", p))
            .unwrap_or_else(|| "-".to_string());

        let Some(series) = bundle.get(asset) else {
            info!("{:<16} price {:>10}  no candles", asset, price);
            continue;
        };

        let variation = series.window_variation(VARIATION_WINDOW, DEGENERATE_EPSILON);
        match series.summary() {
            Some(whole) => info!(
                "{:<16} price {:>10}  {} x {}s  O {:.5} H {:.5} L {:.5} C {:.5}{}",
                asset,
                price,
                series.len(),
                period,
                whole.open,
                whole.high,
                whole.low,
                whole.close,
                if variation.is_degenerate() { "  (flat)" } else { "" }
            ),
            None => info!("{:<16} price {:>10}  empty series", asset, price),
        }
    }

    Ok(())
}
