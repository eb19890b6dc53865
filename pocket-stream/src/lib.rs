//! Streaming session engine for the Pocket venue
//!
//! This crate owns the single WebSocket session: regional failover and the
//! socket.io handshake ([`Transport`]), frame classification and payload
//! attribution ([`FrameRouter`]), request/response correlation
//! ([`Correlator`]) and server clock tracking ([`TimeSync`]).

pub mod config;
pub mod connector;
pub mod correlator;
pub mod market;
pub mod protocol;
pub mod region;
mod requests;
pub mod router;
pub mod session;
pub mod time_sync;
pub mod transport;

pub use config::StreamConfig;
pub use connector::{Connector, FrameChannel, WsConnector};
pub use correlator::{Completion, Correlator, PendingRequest, MAX_TRACKED_ORDERS};
pub use market::MarketBook;
pub use protocol::{parse_frame, Frame, Reply};
pub use region::{default_regions, parse_region_list, Region};
pub use router::{AwaitingSlots, FrameRouter, PayloadSlot, ProtocolEvent, Routed};
pub use session::Session;
pub use time_sync::TimeSync;
pub use transport::Transport;
