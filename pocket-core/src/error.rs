//! Error types for the Pocket client

use thiserror::Error;

use crate::RequestKind;

/// Client-wide error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PocketError {
    /// Every regional endpoint failed across every connection pass
    #[error("Connection failed after {attempts} endpoint attempts")]
    ConnectionFailed { attempts: u32 },

    /// The venue refused the session credential; never retried with the same one
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Request timed out: {0}")]
    RequestTimeout(RequestKind),

    /// A newer request of the same kind replaced this one before it completed
    #[error("Request superseded: {0}")]
    RequestSuperseded(RequestKind),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Transient fetch error: {0}")]
    TransientFetch(String),

    #[error("Stale data: {0}")]
    StaleData(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PocketError {
    pub fn auth_rejected(msg: impl Into<String>) -> Self {
        PocketError::AuthRejected(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        PocketError::MalformedFrame(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        PocketError::TransientFetch(msg.into())
    }

    pub fn stale(msg: impl Into<String>) -> Self {
        PocketError::StaleData(msg.into())
    }

    pub fn order_rejected(msg: impl Into<String>) -> Self {
        PocketError::OrderRejected(msg.into())
    }

    pub fn websocket(msg: impl Into<String>) -> Self {
        PocketError::WebSocket(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        PocketError::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        PocketError::Internal(msg.into())
    }

    /// Whether a fetch that failed with this error is worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PocketError::ConnectionClosed
                | PocketError::RequestTimeout(_)
                | PocketError::RequestSuperseded(_)
                | PocketError::TransientFetch(_)
                | PocketError::WebSocket(_)
        )
    }

    /// Whether the error must stop all further connection attempts
    pub fn is_fatal(&self) -> bool {
        matches!(self, PocketError::AuthRejected(_))
    }
}

/// Result type alias for Pocket operations
pub type PocketResult<T> = Result<T, PocketError>;
