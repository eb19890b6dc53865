//! Regional endpoint table

use std::fmt;

use tracing::warn;
use url::Url;

const LIVE_ENDPOINTS: &[(&str, &str)] = &[
    ("EUROPA", "wss://api-eu.po.market/socket.io/?EIO=4&transport=websocket"),
    ("SEYCHELLES", "wss://api-sc.po.market/socket.io/?EIO=4&transport=websocket"),
    ("HONGKONG", "wss://api-hk.po.market/socket.io/?EIO=4&transport=websocket"),
    ("SERVER1", "wss://api-spb.po.market/socket.io/?EIO=4&transport=websocket"),
    ("FRANCE2", "wss://api-fr2.po.market/socket.io/?EIO=4&transport=websocket"),
    ("UNITED_STATES4", "wss://api-us4.po.market/socket.io/?EIO=4&transport=websocket"),
    ("UNITED_STATES3", "wss://api-us3.po.market/socket.io/?EIO=4&transport=websocket"),
    ("UNITED_STATES2", "wss://api-us2.po.market/socket.io/?EIO=4&transport=websocket"),
    ("UNITED_STATES", "wss://api-us-north.po.market/socket.io/?EIO=4&transport=websocket"),
    ("RUSSIA", "wss://api-msk.po.market/socket.io/?EIO=4&transport=websocket"),
    ("INDIA", "wss://api-in.po.market/socket.io/?EIO=4&transport=websocket"),
    ("FRANCE", "wss://api-fr.po.market/socket.io/?EIO=4&transport=websocket"),
    ("FINLAND", "wss://api-fin.po.market/socket.io/?EIO=4&transport=websocket"),
    ("ASIA", "wss://api-asia.po.market/socket.io/?EIO=4&transport=websocket"),
];

const DEMO_ENDPOINTS: &[(&str, &str)] = &[
    ("DEMO", "wss://demo-api-eu.po.market/socket.io/?EIO=4&transport=websocket"),
    ("DEMO_2", "wss://try-demo-eu.po.market/socket.io/?EIO=4&transport=websocket"),
];

/// A named regional endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Region {
    pub name: String,
    pub url: String,
    pub demo: bool,
}

impl Region {
    pub fn new(name: impl Into<String>, url: impl Into<String>, demo: bool) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            demo,
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.url)
    }
}

/// Built-in endpoint table, in declaration order
pub fn default_regions(demo: bool) -> Vec<Region> {
    let table = if demo { DEMO_ENDPOINTS } else { LIVE_ENDPOINTS };
    table
        .iter()
        .map(|(name, url)| Region::new(*name, *url, demo))
        .collect()
}

/// Parse a comma-separated endpoint override
///
/// Entries are either `NAME=wss://...` or a bare URL; names must match the
/// built-in table when given alone. Anything that is not a ws/wss URL is
/// skipped with a warning.
pub fn parse_region_list(list: &str, demo: bool) -> Vec<Region> {
    let known = default_regions(demo);

    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            if let Some(region) = known.iter().find(|r| r.name.eq_ignore_ascii_case(entry)) {
                return Some(region.clone());
            }

            let (name, raw_url) = match entry.split_once('=') {
                Some((name, url)) if !name.contains(':') => (name.trim().to_string(), url.trim()),
                _ => (String::new(), entry),
            };

            match Url::parse(raw_url) {
                Ok(url) if matches!(url.scheme(), "ws" | "wss") => {
                    let name = if name.is_empty() {
                        url.host_str().unwrap_or("custom").to_string()
                    } else {
                        name
                    };
                    Some(Region::new(name, raw_url, demo))
                }
                Ok(url) => {
                    warn!("[PO WS] Ignoring endpoint with scheme {}: {}", url.scheme(), entry);
                    None
                }
                Err(e) => {
                    warn!("[PO WS] Ignoring unparseable endpoint '{}': {}", entry, e);
                    None
                }
            }
        })
        .collect()
}
