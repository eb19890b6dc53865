//! Tradable assets and their payouts

use serde::{Deserialize, Serialize};

/// Suffix the venue uses for over-the-counter instruments
pub const OTC_SUFFIX: &str = "_otc";

/// One entry of the venue's asset table (`updateAssets`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetInfo {
    pub id: i64,
    /// Wire symbol, e.g. `EURUSD_otc`
    pub symbol: String,
    pub name: String,
    /// `currency`, `stock`, `commodity`, `cryptocurrency`, `index`
    pub asset_type: String,
    /// Payout percentage on a winning trade
    pub payout: Option<f64>,
    pub is_open: bool,
}

impl AssetInfo {
    /// Over-the-counter instrument offered outside market hours
    pub fn is_otc(&self) -> bool {
        is_otc_symbol(&self.symbol)
    }
}

/// Check the symbol for the OTC suffix, case-insensitively
pub fn is_otc_symbol(symbol: &str) -> bool {
    symbol.to_lowercase().ends_with(OTC_SUFFIX)
}
