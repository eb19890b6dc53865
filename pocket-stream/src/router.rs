//! Frame router
//!
//! The venue announces most payloads with a `451-` event frame and ships the
//! payload itself in the next untagged data frame. The router remembers which
//! announcements are outstanding ([`AwaitingSlots`]) and attributes each data
//! frame to the highest-priority outstanding slot whose shape it matches.
//! Balance pushes and order acknowledgements describe themselves and skip the
//! slots entirely.

use serde_json::Value;
use tracing::{debug, warn};

use pocket_core::{
    AssetInfo, Balance, DealRecord, HistoryBatch, HistorySnapshot, OpenOrderAck, PocketError,
    PocketResult, StreamTick,
};

use crate::protocol::{self, Frame, Reply};

/// A data frame the router is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSlot {
    /// `updateClosedDeals`, a list
    ClosedDeals,
    /// `successcloseOrder`, an object
    CloseOrder,
    /// `loadHistoryPeriod`, an object
    History,
    /// `updateStream`, a list
    Stream,
    /// `updateHistoryNew`, an object
    HistoryNew,
    /// `updateAssets`, a list
    Assets,
}

impl PayloadSlot {
    /// Resolution order when several slots are armed at once
    pub const PRIORITY: [PayloadSlot; 6] = [
        PayloadSlot::ClosedDeals,
        PayloadSlot::CloseOrder,
        PayloadSlot::History,
        PayloadSlot::Stream,
        PayloadSlot::HistoryNew,
        PayloadSlot::Assets,
    ];

    fn index(self) -> usize {
        match self {
            PayloadSlot::ClosedDeals => 0,
            PayloadSlot::CloseOrder => 1,
            PayloadSlot::History => 2,
            PayloadSlot::Stream => 3,
            PayloadSlot::HistoryNew => 4,
            PayloadSlot::Assets => 5,
        }
    }

    /// Slot armed by an event announcement, if any
    pub fn for_event(name: &str) -> Option<Self> {
        match name {
            "updateClosedDeals" => Some(PayloadSlot::ClosedDeals),
            "successcloseOrder" => Some(PayloadSlot::CloseOrder),
            "loadHistoryPeriod" => Some(PayloadSlot::History),
            "updateStream" => Some(PayloadSlot::Stream),
            "updateHistoryNew" => Some(PayloadSlot::HistoryNew),
            "updateAssets" => Some(PayloadSlot::Assets),
            _ => None,
        }
    }

    fn expects_list(self) -> bool {
        matches!(
            self,
            PayloadSlot::ClosedDeals | PayloadSlot::Stream | PayloadSlot::Assets
        )
    }

    /// Shape check: list slots take arrays, object slots take objects
    pub fn accepts(self, value: &Value) -> bool {
        if self.expects_list() {
            value.is_array()
        } else {
            value.is_object()
        }
    }
}

/// Announcements still waiting for their data frame
#[derive(Debug, Default, Clone)]
pub struct AwaitingSlots {
    armed: [bool; 6],
}

impl AwaitingSlots {
    pub fn arm(&mut self, slot: PayloadSlot) {
        self.armed[slot.index()] = true;
    }

    pub fn is_armed(&self, slot: PayloadSlot) -> bool {
        self.armed[slot.index()]
    }

    pub fn is_empty(&self) -> bool {
        !self.armed.iter().any(|armed| *armed)
    }

    /// Consume the first armed slot, in priority order, that accepts `value`
    pub fn take_match(&mut self, value: &Value) -> Option<PayloadSlot> {
        let slot = PayloadSlot::PRIORITY
            .into_iter()
            .find(|slot| self.is_armed(*slot) && slot.accepts(value))?;
        self.armed[slot.index()] = false;
        Some(slot)
    }

    pub fn clear(&mut self) {
        self.armed = [false; 6];
    }
}

/// Something the venue told us, decoded
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    Authenticated,
    AuthRejected(String),
    BalanceUpdated(Balance),
    OrderOpened(OpenOrderAck),
    OrderRejected(String),
    DealsClosed(Vec<DealRecord>),
    HistoryLoaded(HistoryBatch),
    StreamTicks(Vec<StreamTick>),
    HistoryNew(HistorySnapshot),
    AssetsUpdated(Vec<AssetInfo>),
}

/// Router output for one inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// A protocol reply to put on the wire
    Reply(Reply),
    Event(ProtocolEvent),
}

/// Per-connection frame router
#[derive(Debug, Default)]
pub struct FrameRouter {
    slots: AwaitingSlots,
    malformed: u64,
}

impl FrameRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget outstanding announcements, e.g. after a reconnect
    pub fn reset(&mut self) {
        self.slots.clear();
    }

    pub fn slots(&self) -> &AwaitingSlots {
        &self.slots
    }

    /// Frames (or payloads) that could not be decoded so far
    pub fn malformed_count(&self) -> u64 {
        self.malformed
    }

    /// Route one inbound text frame
    ///
    /// Malformed input is logged and absorbed; it never fails the caller.
    pub fn route(&mut self, raw: &str) -> Vec<Routed> {
        let frame = match protocol::parse_frame(raw) {
            Ok(frame) => frame,
            Err(e) => {
                self.malformed += 1;
                warn!("[PO WS] Dropping frame: {}", e);
                return Vec::new();
            }
        };

        match frame {
            Frame::Open { sid } => {
                debug!("[PO WS] Engine open, sid={:?}", sid);
                vec![Routed::Reply(Reply::NamespaceConnect)]
            }
            Frame::Ping => vec![Routed::Reply(Reply::Pong)],
            Frame::Pong => Vec::new(),
            Frame::NamespaceConnect => vec![Routed::Reply(Reply::Credential)],
            Frame::NotAuthorized => {
                vec![Routed::Event(ProtocolEvent::AuthRejected(raw.to_string()))]
            }
            Frame::Event { name, payload } => self.route_event(&name, payload),
            Frame::Data(value) => self.route_data(value),
            Frame::Other(text) => {
                debug!("[PO WS] Ignoring frame: {}", text);
                Vec::new()
            }
        }
    }

    fn route_event(&mut self, name: &str, payload: Value) -> Vec<Routed> {
        if let Some(slot) = PayloadSlot::for_event(name) {
            self.slots.arm(slot);
            return Vec::new();
        }

        match name {
            "successauth" => vec![Routed::Event(ProtocolEvent::Authenticated)],
            "failopenOrder" => {
                let reason = match payload {
                    Value::String(s) => s,
                    Value::Null => name.to_string(),
                    other => other.to_string(),
                };
                vec![Routed::Event(ProtocolEvent::OrderRejected(reason))]
            }
            // The balance and order payloads that follow describe themselves
            "successupdateBalance" | "successopenOrder" => Vec::new(),
            other => {
                debug!("[PO WS] Unhandled event: {}", other);
                Vec::new()
            }
        }
    }

    fn route_data(&mut self, value: Value) -> Vec<Routed> {
        if let Some(object) = value.as_object() {
            if object.contains_key("balance") {
                return self.decoded(protocol::decode_balance(object).map(ProtocolEvent::BalanceUpdated));
            }

            if object.get("requestId").and_then(Value::as_str) == Some("buy") {
                let event = match protocol::decode_open_order(object) {
                    Ok(ack) => Ok(ProtocolEvent::OrderOpened(ack)),
                    Err(PocketError::OrderRejected(reason)) => {
                        Ok(ProtocolEvent::OrderRejected(reason))
                    }
                    Err(e) => Err(e),
                };
                return self.decoded(event);
            }
        }

        let Some(slot) = self.slots.take_match(&value) else {
            debug!("[PO WS] Unsolicited data frame ({} bytes)", value.to_string().len());
            return Vec::new();
        };

        let event = match slot {
            PayloadSlot::ClosedDeals => {
                protocol::decode_closed_deals(&value).map(ProtocolEvent::DealsClosed)
            }
            PayloadSlot::CloseOrder => {
                protocol::decode_close_order(&value).map(ProtocolEvent::DealsClosed)
            }
            PayloadSlot::History => {
                protocol::decode_history(&value).map(ProtocolEvent::HistoryLoaded)
            }
            PayloadSlot::Stream => protocol::decode_stream(&value).map(ProtocolEvent::StreamTicks),
            PayloadSlot::HistoryNew => {
                protocol::decode_history_new(&value).map(ProtocolEvent::HistoryNew)
            }
            PayloadSlot::Assets => {
                protocol::decode_assets(&value).map(ProtocolEvent::AssetsUpdated)
            }
        };

        self.decoded(event)
    }

    fn decoded(&mut self, event: PocketResult<ProtocolEvent>) -> Vec<Routed> {
        match event {
            Ok(event) => vec![Routed::Event(event)],
            Err(e) => {
                self.malformed += 1;
                warn!("[PO WS] Dropping payload: {}", e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route_all(router: &mut FrameRouter, frames: &[&str]) -> Vec<Routed> {
        frames.iter().flat_map(|f| router.route(f)).collect()
    }

    #[test]
    fn test_handshake_replies() {
        let mut router = FrameRouter::new();
        let out = route_all(
            &mut router,
            &[r#"0{"sid":"a"}"#, "2", r#"40{"sid":"b"}"#, r#"451-["successauth",{"_placeholder":true}]"#],
        );
        assert_eq!(
            out,
            vec![
                Routed::Reply(Reply::NamespaceConnect),
                Routed::Reply(Reply::Pong),
                Routed::Reply(Reply::Credential),
                Routed::Event(ProtocolEvent::Authenticated),
            ]
        );
    }

    #[test]
    fn test_announced_payloads_route_by_priority() {
        let mut router = FrameRouter::new();
        router.route(r#"451-["updateStream",{"_placeholder":true,"num":0}]"#);
        router.route(r#"451-["updateClosedDeals",{"_placeholder":true,"num":0}]"#);

        // Both list slots are armed; closed deals win.
        let out = router.route(r#"[{"id":"d1","profit":1.5}]"#);
        match &out[..] {
            [Routed::Event(ProtocolEvent::DealsClosed(deals))] => assert_eq!(deals[0].id, "d1"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(router.slots().is_armed(PayloadSlot::Stream));
        assert!(!router.slots().is_armed(PayloadSlot::ClosedDeals));

        let out = router.route(r#"[["EURUSD_otc",1700000000.5,1.0812]]"#);
        assert!(matches!(&out[..], [Routed::Event(ProtocolEvent::StreamTicks(t))] if t.len() == 1));
        assert!(router.slots().is_empty());
    }

    #[test]
    fn test_shape_mismatch_skips_slot() {
        let mut router = FrameRouter::new();
        router.route(r#"451-["updateStream",{"_placeholder":true}]"#);
        router.route(r#"451-["loadHistoryPeriod",{"_placeholder":true}]"#);

        let out = router.route(r#"{"asset":"EURUSD_otc","period":60,"data":[{"time":1,"price":2}]}"#);
        assert!(matches!(&out[..], [Routed::Event(ProtocolEvent::HistoryLoaded(_))]));
        assert!(router.slots().is_armed(PayloadSlot::Stream));
    }

    #[test]
    fn test_self_describing_frames_bypass_slots() {
        let mut router = FrameRouter::new();
        router.route(r#"451-["loadHistoryPeriod",{"_placeholder":true}]"#);

        let out = router.route(r#"{"balance":1000.5,"isDemo":1}"#);
        assert_eq!(
            out,
            vec![Routed::Event(ProtocolEvent::BalanceUpdated(Balance {
                value: 1000.5,
                is_demo: true,
                uid: None,
            }))]
        );

        let out = router.route(r#"{"requestId":"buy","id":"ord-1","openPrice":1.08}"#);
        assert!(matches!(&out[..], [Routed::Event(ProtocolEvent::OrderOpened(ack))] if ack.id == "ord-1"));

        let out = router.route(r#"{"requestId":"buy","error":"amount_too_low"}"#);
        assert_eq!(
            out,
            vec![Routed::Event(ProtocolEvent::OrderRejected("amount_too_low".to_string()))]
        );

        // The history slot is still waiting
        assert!(router.slots().is_armed(PayloadSlot::History));
    }

    #[test]
    fn test_unsolicited_and_malformed_are_absorbed() {
        let mut router = FrameRouter::new();
        assert!(router.route(r#"{"asset":"EURUSD_otc"}"#).is_empty());
        assert!(router.route(r#"451-not json"#).is_empty());
        assert_eq!(router.malformed_count(), 1);
    }

    #[test]
    fn test_not_authorized() {
        let mut router = FrameRouter::new();
        let out = router.route(r#"42["NotAuthorized"]"#);
        assert!(matches!(&out[..], [Routed::Event(ProtocolEvent::AuthRejected(_))]));
    }
}
