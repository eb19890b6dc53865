//! Orders, closed deals and their outcomes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of a binary option
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Price ends above the open price
    Call,
    /// Price ends below the open price
    Put,
}

impl Direction {
    /// Wire name used in the `action` field
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Call => "call",
            Direction::Put => "put",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "call" | "buy" | "up" => Ok(Direction::Call),
            "put" | "sell" | "down" => Ok(Direction::Put),
            _ => Err(format!("Unknown direction: {}", s)),
        }
    }
}

/// Lifecycle status of a tracked order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Won,
    Lost,
    Unknown,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Open)
    }
}

/// Outcome reported by an outcome poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderOutcome {
    Win,
    Lose,
    Unknown,
}

impl OrderOutcome {
    /// Classify a settled profit; anything not strictly positive is a loss
    pub fn from_profit(profit: f64) -> Self {
        if profit > 0.0 {
            OrderOutcome::Win
        } else {
            OrderOutcome::Lose
        }
    }
}

impl From<OrderOutcome> for OrderStatus {
    fn from(outcome: OrderOutcome) -> Self {
        match outcome {
            OrderOutcome::Win => OrderStatus::Won,
            OrderOutcome::Lose => OrderStatus::Lost,
            OrderOutcome::Unknown => OrderStatus::Unknown,
        }
    }
}

/// An order the venue confirmed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub asset: String,
    pub direction: Direction,
    pub amount: f64,
    /// Expiry in seconds
    pub duration: u32,
    pub open_price: Option<f64>,
    /// Seconds since the epoch
    pub open_timestamp: i64,
    pub status: OrderStatus,
}

/// Result of waiting on an order's settlement
#[derive(Debug, Clone, PartialEq)]
pub struct OrderSettlement {
    pub profit: Option<f64>,
    pub outcome: OrderOutcome,
    /// The order as it was tracked, now in its terminal status; `None` for
    /// ids this session never placed or no longer remembers
    pub order: Option<Order>,
}

impl OrderSettlement {
    /// Settlement of an order that did not settle in time, or was never known
    pub fn unknown(order: Option<Order>) -> Self {
        Self {
            profit: None,
            outcome: OrderOutcome::Unknown,
            order: order.map(|mut order| {
                order.status = OrderStatus::Unknown;
                order
            }),
        }
    }

    /// `(profit, outcome)` pair
    pub fn result(&self) -> (Option<f64>, OrderOutcome) {
        (self.profit, self.outcome)
    }
}

/// Venue acknowledgement of an `openOrder` command
#[derive(Debug, Clone, PartialEq)]
pub struct OpenOrderAck {
    pub id: String,
    pub asset: Option<String>,
    pub amount: Option<f64>,
    pub open_price: Option<f64>,
    pub open_timestamp: Option<i64>,
}

/// Result of a buy call
#[derive(Debug, Clone, PartialEq)]
pub struct BuyReceipt {
    pub accepted: bool,
    pub order_id: Option<String>,
}

impl BuyReceipt {
    pub fn accepted(order_id: impl Into<String>) -> Self {
        Self {
            accepted: true,
            order_id: Some(order_id.into()),
        }
    }

    pub fn rejected() -> Self {
        Self {
            accepted: false,
            order_id: None,
        }
    }
}

/// A settled deal as pushed by `successcloseOrder` / `updateClosedDeals`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealRecord {
    pub id: String,
    #[serde(default)]
    pub asset: Option<String>,
    #[serde(default)]
    pub profit: Option<f64>,
    #[serde(default)]
    pub amount: Option<f64>,
    /// 0 = call, 1 = put
    #[serde(default)]
    pub command: Option<i64>,
    #[serde(default, rename = "openPrice")]
    pub open_price: Option<f64>,
    #[serde(default, rename = "closePrice")]
    pub close_price: Option<f64>,
    #[serde(default, rename = "closeTimestamp")]
    pub close_timestamp: Option<f64>,
}

impl DealRecord {
    /// Outcome implied by the settled profit, `Unknown` if the venue omitted it
    pub fn outcome(&self) -> OrderOutcome {
        self.profit
            .map(OrderOutcome::from_profit)
            .unwrap_or(OrderOutcome::Unknown)
    }
}
