//! Transport configuration
//!
//! Defaults mirror the venue's observed behaviour; every field can be
//! overridden from the environment (`PO_*` variables) or directly.

use std::time::Duration;

use tracing::warn;

use crate::region::{default_regions, parse_region_list, Region};

/// Connection passes over the region list before giving up
pub const MAX_CONNECT_PASSES: u32 = 5;

/// Pause between two endpoints of the same pass
pub const REGION_DELAY: Duration = Duration::from_secs(2);

/// Pause between two full passes
pub const PASS_DELAY: Duration = Duration::from_secs(5);

/// Application heartbeat period (`42["ps"]`)
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Time allowed between socket open and `successauth`
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

pub const BUY_TIMEOUT: Duration = Duration::from_secs(5);

pub const HISTORY_TIMEOUT: Duration = Duration::from_secs(10);

pub const CHANGE_SYMBOL_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on waiting for a trade to settle
pub const OUTCOME_TIMEOUT: Duration = Duration::from_secs(120);

/// TCP + TLS + upgrade budget for a single endpoint
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_ORIGIN: &str = "https://pocketoption.com";

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Configuration for the session transport
#[derive(Clone)]
pub struct StreamConfig {
    /// Raw session credential frame, sent verbatim after the namespace ack
    pub ssid: Option<String>,
    /// Use the demo endpoint table and flag orders as demo
    pub demo: bool,
    /// Endpoints to try; empty means the built-in table for `demo`
    pub regions: Vec<Region>,
    /// Shuffle the endpoint order at the start of every pass
    pub shuffle_regions: bool,
    pub max_passes: u32,
    pub region_delay: Duration,
    pub pass_delay: Duration,
    pub heartbeat_interval: Duration,
    pub open_timeout: Duration,
    pub auth_timeout: Duration,
    pub buy_timeout: Duration,
    pub history_timeout: Duration,
    pub change_symbol_timeout: Duration,
    pub outcome_timeout: Duration,
    pub origin: String,
    pub user_agent: String,
}

impl std::fmt::Debug for StreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConfig")
            .field("ssid", &self.ssid.as_ref().map(|_| "[REDACTED]"))
            .field("demo", &self.demo)
            .field("regions", &self.regions.len())
            .field("shuffle_regions", &self.shuffle_regions)
            .field("max_passes", &self.max_passes)
            .field("region_delay", &self.region_delay)
            .field("pass_delay", &self.pass_delay)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("auth_timeout", &self.auth_timeout)
            .finish()
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        let demo = std::env::var("PO_DEMO")
            .map(|v| parse_flag(&v))
            .unwrap_or(false);

        let regions = match std::env::var("PO_REGIONS") {
            Ok(list) => {
                let parsed = parse_region_list(&list, demo);
                if parsed.is_empty() {
                    warn!("[PO WS] PO_REGIONS has no usable endpoints, using built-in table");
                }
                parsed
            }
            Err(_) => Vec::new(),
        };

        Self {
            ssid: std::env::var("PO_SSID").ok().filter(|s| !s.trim().is_empty()),
            demo,
            regions,
            shuffle_regions: true,
            max_passes: MAX_CONNECT_PASSES,
            region_delay: REGION_DELAY,
            pass_delay: PASS_DELAY,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            open_timeout: OPEN_TIMEOUT,
            auth_timeout: AUTH_TIMEOUT,
            buy_timeout: BUY_TIMEOUT,
            history_timeout: HISTORY_TIMEOUT,
            change_symbol_timeout: CHANGE_SYMBOL_TIMEOUT,
            outcome_timeout: OUTCOME_TIMEOUT,
            origin: DEFAULT_ORIGIN.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl StreamConfig {
    /// Config for a credential, everything else from the environment/defaults
    pub fn with_ssid(ssid: impl Into<String>) -> Self {
        Self {
            ssid: Some(ssid.into()),
            ..Self::default()
        }
    }

    /// Endpoints to try during one connection pass
    pub fn regions_for_pass(&self) -> Vec<Region> {
        let mut regions = if self.regions.is_empty() {
            default_regions(self.demo)
        } else {
            self.regions.clone()
        };

        if self.shuffle_regions {
            use rand::seq::SliceRandom;
            regions.shuffle(&mut rand::rng());
        }

        regions
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
