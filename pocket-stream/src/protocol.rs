//! Wire codec for the venue's socket.io-flavoured text protocol
//!
//! Inbound frames are classified by prefix:
//!
//! | Frame                     | Meaning                                   |
//! |---------------------------|-------------------------------------------|
//! | `0{"sid":...}`            | Engine open, answered with `40`           |
//! | `2` / `3`                 | Engine ping / pong                        |
//! | `40{"sid":...}`           | Namespace ack, answered with the SSID     |
//! | `451-["name",{...}]`      | Event announcing the next data frame      |
//! | `42[...NotAuthorized...]` | Credential refused                        |
//! | `{...}` / `[...]`         | Bare data frame                           |
//!
//! Data frames carry no correlation key; they belong to the most recent
//! announcement (see [`crate::router`]).

use serde_json::{json, Map, Value};

use pocket_core::{
    AssetInfo, Balance, DealRecord, Direction, HistoryBatch, HistorySnapshot, OpenOrderAck,
    PocketError, PocketResult, PricePoint, StreamTick,
};

/// Application-level heartbeat
pub const APP_PING: &str = r#"42["ps"]"#;

/// Option type the venue expects on `openOrder`
const OPTION_TYPE_BINARY: u32 = 100;

// ============================================================================
// Inbound frames
// ============================================================================

/// A classified inbound text frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Engine-level open packet
    Open { sid: Option<String> },
    Ping,
    Pong,
    /// Namespace connected; the credential must follow
    NamespaceConnect,
    /// Event announcement with a placeholder payload
    Event { name: String, payload: Value },
    /// Session credential refused
    NotAuthorized,
    /// Untagged JSON payload
    Data(Value),
    /// Recognised as protocol noise, safe to ignore
    Other(String),
}

/// Classify one inbound text frame
pub fn parse_frame(raw: &str) -> PocketResult<Frame> {
    let raw = raw.trim();

    if raw == "2" {
        return Ok(Frame::Ping);
    }
    if raw == "3" {
        return Ok(Frame::Pong);
    }

    if let Some(rest) = raw.strip_prefix("451-") {
        return parse_event(rest);
    }

    if raw.starts_with("42") && raw.contains("NotAuthorized") {
        return Ok(Frame::NotAuthorized);
    }

    if raw.starts_with("40") && raw.contains("sid") {
        return Ok(Frame::NamespaceConnect);
    }

    if let Some(rest) = raw.strip_prefix('0') {
        if rest.contains("sid") {
            let sid = serde_json::from_str::<Value>(rest)
                .ok()
                .and_then(|v| v.get("sid").and_then(Value::as_str).map(str::to_string));
            return Ok(Frame::Open { sid });
        }
    }

    if raw.starts_with('{') || raw.starts_with('[') {
        return serde_json::from_str::<Value>(raw)
            .map(Frame::Data)
            .map_err(|e| PocketError::malformed(format!("bad data frame: {}", e)));
    }

    Ok(Frame::Other(raw.to_string()))
}

fn parse_event(body: &str) -> PocketResult<Frame> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| PocketError::malformed(format!("bad event frame: {}", e)))?;

    let mut items = match value {
        Value::Array(items) => items.into_iter(),
        _ => return Err(PocketError::malformed("event frame is not an array")),
    };

    let name = match items.next() {
        Some(Value::String(name)) => name,
        _ => return Err(PocketError::malformed("event frame has no name")),
    };

    Ok(Frame::Event {
        name,
        payload: items.next().unwrap_or(Value::Null),
    })
}

// ============================================================================
// Outbound frames
// ============================================================================

/// Protocol-level replies the router asks the transport to send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// `40`, after the engine open
    NamespaceConnect,
    /// `3`, after an engine ping
    Pong,
    /// The raw session credential, after the namespace ack
    Credential,
}

impl Reply {
    /// Text to put on the wire; the credential is sent as-is
    pub fn render(&self, credential: &str) -> String {
        match self {
            Reply::NamespaceConnect => "40".to_string(),
            Reply::Pong => "3".to_string(),
            Reply::Credential => credential.to_string(),
        }
    }
}

fn event_frame(name: &str, body: Value) -> String {
    format!("42{}", json!([name, body]))
}

/// `openOrder` command
pub fn open_order(
    asset: &str,
    amount: f64,
    direction: Direction,
    duration: u32,
    is_demo: bool,
) -> String {
    event_frame(
        "openOrder",
        json!({
            "asset": asset,
            "amount": amount,
            "action": direction.as_str(),
            "isDemo": if is_demo { 1 } else { 0 },
            "requestId": "buy",
            "optionType": OPTION_TYPE_BINARY,
            "time": duration,
        }),
    )
}

/// `loadHistoryPeriod` command
///
/// `index` is an opaque request marker; the venue echoes nothing back.
pub fn load_history_period(
    asset: &str,
    period: u32,
    offset: u64,
    end_time: i64,
    index: i64,
) -> String {
    event_frame(
        "loadHistoryPeriod",
        json!({
            "asset": asset,
            "index": index,
            "time": end_time,
            "offset": offset,
            "period": period,
        }),
    )
}

/// `changeSymbol` command, subscribing the session to one asset
pub fn change_symbol(asset: &str, period: u32) -> String {
    event_frame(
        "changeSymbol",
        json!({
            "asset": asset,
            "period": period,
        }),
    )
}

/// Request marker for `loadHistoryPeriod`: end time scaled by 100 plus jitter
pub fn history_index(end_time: i64) -> i64 {
    use rand::Rng;
    end_time * 100 + rand::rng().random_range(0..100)
}

// ============================================================================
// Payload decoding
// ============================================================================

fn as_f64(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|v| v.is_finite())
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_flag(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
        Value::String(s) => matches!(s.as_str(), "1" | "true"),
        _ => false,
    }
}

/// `{"balance": 1000.0, "isDemo": 1, "uid": 42}`
pub fn decode_balance(object: &Map<String, Value>) -> PocketResult<Balance> {
    let value = object
        .get("balance")
        .and_then(as_f64)
        .ok_or_else(|| PocketError::malformed("balance is not a number"))?;

    Ok(Balance {
        value,
        is_demo: object.get("isDemo").map(as_flag).unwrap_or(false),
        uid: object.get("uid").and_then(as_i64),
    })
}

/// Order acknowledgement tagged `requestId: "buy"`
///
/// A frame carrying `error` is a rejection.
pub fn decode_open_order(object: &Map<String, Value>) -> PocketResult<OpenOrderAck> {
    if let Some(error) = object.get("error") {
        let reason = match error {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Err(PocketError::order_rejected(reason));
    }

    let id = object
        .get("id")
        .and_then(as_id)
        .ok_or_else(|| PocketError::malformed("order acknowledgement without id"))?;

    Ok(OpenOrderAck {
        id,
        asset: object.get("asset").and_then(Value::as_str).map(str::to_string),
        amount: object.get("amount").and_then(as_f64),
        open_price: object.get("openPrice").and_then(as_f64),
        open_timestamp: object.get("openTimestamp").and_then(as_i64),
    })
}

fn decode_deal(value: &Value) -> Option<DealRecord> {
    let object = value.as_object()?;
    let id = object.get("id").and_then(as_id)?;
    Some(DealRecord {
        id,
        asset: object.get("asset").and_then(Value::as_str).map(str::to_string),
        profit: object.get("profit").and_then(as_f64),
        amount: object.get("amount").and_then(as_f64),
        command: object.get("command").and_then(as_i64),
        open_price: object.get("openPrice").and_then(as_f64),
        close_price: object.get("closePrice").and_then(as_f64),
        close_timestamp: object.get("closeTimestamp").and_then(as_f64),
    })
}

/// `updateClosedDeals` payload: a list of deal objects
pub fn decode_closed_deals(value: &Value) -> PocketResult<Vec<DealRecord>> {
    let items = value
        .as_array()
        .ok_or_else(|| PocketError::malformed("closed deals payload is not a list"))?;
    Ok(items.iter().filter_map(decode_deal).collect())
}

/// `successcloseOrder` payload: `{"deals": [...], "profit": ...}`
pub fn decode_close_order(value: &Value) -> PocketResult<Vec<DealRecord>> {
    let deals = value
        .get("deals")
        .ok_or_else(|| PocketError::malformed("close order payload without deals"))?;
    decode_closed_deals(deals)
}

/// `loadHistoryPeriod` payload: `{"asset", "period", "data": [{"time", "price"}]}`
///
/// Points without a usable timestamp are dropped; points without a usable
/// price are kept as missing so the aggregator can forward-fill them.
pub fn decode_history(value: &Value) -> PocketResult<HistoryBatch> {
    let data = value
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| PocketError::malformed("history payload without data"))?;

    let points = data
        .iter()
        .filter_map(|item| {
            let timestamp = item.get("time").and_then(as_f64)?;
            let price = item
                .get("price")
                .or_else(|| item.get("close"))
                .and_then(as_f64);
            Some(PricePoint { timestamp, price })
        })
        .collect();

    Ok(HistoryBatch {
        asset: value.get("asset").and_then(Value::as_str).map(str::to_string),
        period: value.get("period").and_then(as_i64).map(|p| p as u32),
        points,
    })
}

/// `updateStream` payload: `[["EURUSD_otc", 1700000000.123, 1.0812], ...]`
pub fn decode_stream(value: &Value) -> PocketResult<Vec<StreamTick>> {
    let items = value
        .as_array()
        .ok_or_else(|| PocketError::malformed("stream payload is not a list"))?;

    Ok(items
        .iter()
        .filter_map(|item| {
            let row = item.as_array()?;
            Some(StreamTick {
                asset: row.first()?.as_str()?.to_string(),
                timestamp: row.get(1).and_then(as_f64)?,
                price: row.get(2).and_then(as_f64)?,
            })
        })
        .collect())
}

/// `updateHistoryNew` payload: `{"asset", "period", "history": [[ts, price], ...]}`
pub fn decode_history_new(value: &Value) -> PocketResult<HistorySnapshot> {
    let asset = value
        .get("asset")
        .and_then(Value::as_str)
        .ok_or_else(|| PocketError::malformed("history snapshot without asset"))?;

    let points = value
        .get("history")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    let row = row.as_array()?;
                    let timestamp = row.first().and_then(as_f64)?;
                    Some(PricePoint {
                        timestamp,
                        price: row.get(1).and_then(as_f64),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(HistorySnapshot {
        asset: asset.to_string(),
        period: value.get("period").and_then(as_i64).map(|p| p as u32),
        points,
    })
}

/// `updateAssets` payload: positional rows
/// `[id, symbol, name, type, group, payout, ..., is_open (14), ...]`
pub fn decode_assets(value: &Value) -> PocketResult<Vec<AssetInfo>> {
    let rows = value
        .as_array()
        .ok_or_else(|| PocketError::malformed("assets payload is not a list"))?;

    Ok(rows
        .iter()
        .filter_map(|row| {
            let row = row.as_array()?;
            Some(AssetInfo {
                id: row.first().and_then(as_i64)?,
                symbol: row.get(1)?.as_str()?.to_string(),
                name: row
                    .get(2)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                asset_type: row
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                payout: row.get(5).and_then(as_f64),
                is_open: row.get(14).map(as_flag).unwrap_or(false),
            })
        })
        .collect())
}
