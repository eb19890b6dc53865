//! Session-level state shared between the transport and its observers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of the logical session
///
/// `Disconnected → Connecting → HandshakeSent → Authenticated → Connected`,
/// then `Reconnecting → Connecting` after an unexpected close. `Stopped` is
/// terminal and only reached through an explicit disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Namespace ack received and the credential has been sent
    HandshakeSent,
    Authenticated,
    /// Authenticated and heartbeat running
    Connected,
    Reconnecting,
    Stopped,
}

impl ConnectionState {
    /// A live socket exists (not necessarily authenticated yet)
    pub fn has_socket(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::HandshakeSent | Self::Authenticated | Self::Connected
        )
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::HandshakeSent => "handshake_sent",
            Self::Authenticated => "authenticated",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Logical request kinds the correlator can track
///
/// Order outcomes are not a request kind: any number of outcome waits may
/// run at once, each watching the settled-deal book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Connect,
    Buy,
    FetchHistory,
    ChangeSymbol,
}

impl RequestKind {
    pub const ALL: [RequestKind; 4] = [
        RequestKind::Connect,
        RequestKind::Buy,
        RequestKind::FetchHistory,
        RequestKind::ChangeSymbol,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Buy => "buy",
            Self::FetchHistory => "fetch_history",
            Self::ChangeSymbol => "change_symbol",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Account balance as last pushed by the venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub value: f64,
    pub is_demo: bool,
    pub uid: Option<i64>,
}
