//! Session lifecycle against an in-memory venue
//!
//! Run with: cargo test -p pocket-stream --test session_flow -- --nocapture

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use pocket_core::{ConnectionState, Direction, OrderOutcome, PocketError, PocketResult, RequestKind};
use pocket_stream::{Connector, FrameChannel, Region, StreamConfig, Transport};

const SSID: &str = r#"42["auth",{"session":"test-session","isDemo":1,"uid":77,"platform":2}]"#;

// ============================================================================
// Fake venue
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum AuthMode {
    Accept,
    Reject,
}

struct FakeVenue {
    refuse: bool,
    auth: Mutex<AuthMode>,
    answer_orders: bool,
    /// Time `open` takes before handing out the socket
    open_delay: Duration,
    /// Time the venue sits on the credential before answering
    auth_delay: Duration,
    opens: AtomicUsize,
    sent: Arc<Mutex<Vec<String>>>,
    kills: Mutex<Vec<oneshot::Sender<()>>>,
}

impl FakeVenue {
    fn build(refuse: bool, auth: AuthMode, answer_orders: bool) -> Arc<Self> {
        Arc::new(Self {
            refuse,
            auth: Mutex::new(auth),
            answer_orders,
            open_delay: Duration::ZERO,
            auth_delay: Duration::ZERO,
            opens: AtomicUsize::new(0),
            sent: Arc::new(Mutex::new(Vec::new())),
            kills: Mutex::new(Vec::new()),
        })
    }

    fn accepting() -> Arc<Self> {
        Self::build(false, AuthMode::Accept, true)
    }

    fn refusing() -> Arc<Self> {
        Self::build(true, AuthMode::Accept, true)
    }

    fn rejecting() -> Arc<Self> {
        Self::build(false, AuthMode::Reject, true)
    }

    fn silent_on_orders() -> Arc<Self> {
        Self::build(false, AuthMode::Accept, false)
    }

    fn slow(open_delay: Duration, auth_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            refuse: false,
            auth: Mutex::new(AuthMode::Accept),
            answer_orders: true,
            open_delay,
            auth_delay,
            opens: AtomicUsize::new(0),
            sent: Arc::new(Mutex::new(Vec::new())),
            kills: Mutex::new(Vec::new()),
        })
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Drop every open socket from the server side
    fn kill_all(&self) {
        for kill in self.kills.lock().drain(..) {
            let _ = kill.send(());
        }
    }

    fn respond(auth: AuthMode, answer_orders: bool, frame: &str) -> Vec<String> {
        if frame == "40" {
            return vec![r#"40{"sid":"ns-1"}"#.to_string()];
        }

        if frame == SSID {
            return match auth {
                AuthMode::Accept => vec![
                    r#"451-["successauth",{"_placeholder":true,"num":0}]"#.to_string(),
                    r#"451-["successupdateBalance",{"_placeholder":true,"num":0}]"#.to_string(),
                    r#"{"uid":77,"balance":1000.0,"isDemo":1}"#.to_string(),
                ],
                AuthMode::Reject => vec![r#"42["NotAuthorized"]"#.to_string()],
            };
        }

        let Some(body) = frame.strip_prefix("42") else {
            return Vec::new();
        };
        let Ok(Value::Array(items)) = serde_json::from_str::<Value>(body) else {
            return Vec::new();
        };
        let args = items.get(1).cloned().unwrap_or(Value::Null);

        match items.first().and_then(Value::as_str) {
            Some("openOrder") if answer_orders => vec![
                r#"451-["successopenOrder",{"_placeholder":true,"num":0}]"#.to_string(),
                json!({
                    "requestId": "buy",
                    "id": "ord-1",
                    "asset": args["asset"],
                    "amount": args["amount"],
                    "openPrice": 1.0845,
                    "openTimestamp": 1_700_000_000,
                })
                .to_string(),
            ],
            Some("loadHistoryPeriod") => {
                let end = args["time"].as_i64().unwrap_or(0);
                vec![
                    r#"451-["loadHistoryPeriod",{"_placeholder":true,"num":0}]"#.to_string(),
                    json!({
                        "asset": args["asset"],
                        "period": args["period"],
                        "data": [
                            {"time": end - 2, "price": 1.08},
                            {"time": end - 1, "price": 1.09},
                        ],
                    })
                    .to_string(),
                ]
            }
            Some("changeSymbol") => vec![
                r#"451-["updateHistoryNew",{"_placeholder":true,"num":0}]"#.to_string(),
                json!({
                    "asset": args["asset"],
                    "period": args["period"],
                    "history": [[1_700_000_000.5, 1.1], [1_700_000_001.0, 1.2]],
                })
                .to_string(),
            ],
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl Connector for FakeVenue {
    async fn open(&self, region: &Region) -> PocketResult<FrameChannel> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        if self.refuse {
            return Err(PocketError::websocket(format!("{} refused", region.name)));
        }

        let (channel, mut from_client, to_client) = FrameChannel::pair();
        let (kill_tx, mut kill_rx) = oneshot::channel();
        self.kills.lock().push(kill_tx);

        let sent = Arc::clone(&self.sent);
        let auth = *self.auth.lock();
        let answer_orders = self.answer_orders;
        let auth_delay = self.auth_delay;

        tokio::spawn(async move {
            if to_client
                .send(Ok(r#"0{"sid":"engine-1","pingInterval":25000}"#.to_string()))
                .await
                .is_err()
            {
                return;
            }

            loop {
                tokio::select! {
                    _ = &mut kill_rx => break,
                    frame = from_client.recv() => {
                        let Some(frame) = frame else { break };
                        sent.lock().push(frame.clone());
                        if frame == SSID && !auth_delay.is_zero() {
                            tokio::time::sleep(auth_delay).await;
                        }
                        for reply in FakeVenue::respond(auth, answer_orders, &frame) {
                            if to_client.send(Ok(reply)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(channel)
    }
}

fn config(regions: usize) -> StreamConfig {
    StreamConfig {
        ssid: Some(SSID.to_string()),
        demo: true,
        regions: (0..regions)
            .map(|i| Region::new(format!("r{}", i), format!("ws://r{}.test/socket.io/", i), true))
            .collect(),
        ..StreamConfig::default()
    }
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_handshake_authenticates() {
    let venue = FakeVenue::accepting();
    let transport = Transport::with_connector(config(1), venue.clone());

    assert_eq!(transport.connection_state(), ConnectionState::Disconnected);
    assert!(transport.connect().await);
    assert_eq!(transport.connection_state(), ConnectionState::Connected);
    assert_eq!(transport.region().unwrap().name, "r0");

    let sent = venue.sent();
    assert_eq!(sent[0], "40");
    assert_eq!(sent[1], SSID);

    assert!(eventually(|| transport.session().balance().is_some()).await);
    assert_eq!(transport.session().balance().unwrap().value, 1000.0);

    transport.disconnect();
}

#[tokio::test]
async fn test_connect_walks_every_state_in_order() {
    let venue = FakeVenue::accepting();
    let transport = Transport::with_connector(config(1), venue.clone());
    let mut transitions = transport.session().subscribe_transitions();
    let latest = transport.subscribe_state();

    assert!(transport.connect().await);

    let seen: Vec<ConnectionState> = std::iter::from_fn(|| transitions.try_recv().ok()).collect();
    assert_eq!(
        seen,
        vec![
            ConnectionState::Connecting,
            ConnectionState::HandshakeSent,
            ConnectionState::Authenticated,
            ConnectionState::Connected,
        ]
    );
    assert_eq!(*latest.borrow(), ConnectionState::Connected);

    transport.disconnect();
    assert_eq!(transitions.try_recv().unwrap(), ConnectionState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_while_socket_opens() {
    let venue = FakeVenue::slow(Duration::from_millis(300), Duration::ZERO);
    let transport = Transport::with_connector(config(2), venue.clone());

    let connecting = tokio::spawn({
        let transport = transport.clone();
        async move { transport.connect().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    transport.disconnect();

    assert!(!connecting.await.unwrap());
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(transport.connection_state(), ConnectionState::Stopped);
    // The late socket is dropped and no other region is tried
    assert_eq!(venue.opens(), 1);
    assert!(venue.sent().is_empty());
    assert_eq!(
        transport.send(r#"42["ps"]"#.to_string()).await.unwrap_err(),
        PocketError::ConnectionClosed
    );
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_while_awaiting_auth() {
    let venue = FakeVenue::slow(Duration::ZERO, Duration::from_millis(300));
    let transport = Transport::with_connector(config(2), venue.clone());

    let connecting = tokio::spawn({
        let transport = transport.clone();
        async move { transport.connect().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.connection_state(), ConnectionState::HandshakeSent);
    transport.disconnect();

    assert!(!connecting.await.unwrap());
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(transport.connection_state(), ConnectionState::Stopped);
    assert!(!transport.session().is_authenticated());
    assert!(transport.session().balance().is_none());
    assert_eq!(venue.opens(), 1);

    // An explicit connect is the only way out of Stopped
    assert!(transport.connect().await);
    assert_eq!(transport.connection_state(), ConnectionState::Connected);
    transport.disconnect();
}

#[tokio::test(start_paused = true)]
async fn test_every_region_refused() {
    let venue = FakeVenue::refusing();
    let transport = Transport::with_connector(config(3), venue.clone());

    assert!(!transport.connect().await);
    assert_eq!(venue.opens(), 15);
    assert_eq!(transport.connection_state(), ConnectionState::Disconnected);
    assert_eq!(
        transport.session().last_error(),
        Some(PocketError::ConnectionFailed { attempts: 15 })
    );
}

#[tokio::test]
async fn test_rejected_credential_is_sticky() {
    let venue = FakeVenue::rejecting();
    let transport = Transport::with_connector(config(3), venue.clone());

    let err = transport.try_connect().await.unwrap_err();
    assert!(matches!(err, PocketError::AuthRejected(_)));
    assert_eq!(venue.opens(), 1);
    assert_eq!(transport.connection_state(), ConnectionState::Disconnected);

    // Same credential: refused without touching the network
    assert!(!transport.connect().await);
    assert_eq!(venue.opens(), 1);

    *venue.auth.lock() = AuthMode::Accept;
    transport.set_credential(SSID);
    assert!(transport.connect().await);
    assert_eq!(venue.opens(), 2);

    transport.disconnect();
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_runs_once_connected() {
    let venue = FakeVenue::accepting();
    let transport = Transport::with_connector(config(1), venue.clone());
    assert!(transport.connect().await);

    tokio::time::sleep(Duration::from_secs(41)).await;
    let pings = venue.sent().iter().filter(|f| *f == r#"42["ps"]"#).count();
    assert_eq!(pings, 2);

    transport.disconnect();
    tokio::time::sleep(Duration::from_secs(60)).await;
    let pings = venue.sent().iter().filter(|f| *f == r#"42["ps"]"#).count();
    assert_eq!(pings, 2);
}

#[tokio::test]
async fn test_history_and_symbol_requests() {
    let venue = FakeVenue::accepting();
    let transport = Transport::with_connector(config(1), venue.clone());
    assert!(transport.connect().await);

    let batch = transport
        .load_history("EURUSD_otc", 60, 3000, 1_700_000_000)
        .await
        .unwrap();
    assert_eq!(batch.points.len(), 2);
    assert_eq!(batch.points[1].price, Some(1.09));

    let request = venue
        .sent()
        .into_iter()
        .find(|f| f.contains("loadHistoryPeriod"))
        .unwrap();
    let body: Value = serde_json::from_str(&request[2..]).unwrap();
    assert_eq!(body[1]["offset"], 3000);
    assert_eq!(body[1]["period"], 60);

    let snapshot = transport.change_symbol("EURUSD_otc", 60).await.unwrap();
    assert_eq!(snapshot.points.len(), 2);
    assert!(transport.market().snapshot("EURUSD_otc").is_some());

    transport.disconnect();
}

#[tokio::test]
async fn test_buy_is_acknowledged_and_tracked() {
    let venue = FakeVenue::accepting();
    let transport = Transport::with_connector(config(1), venue.clone());
    assert!(transport.connect().await);

    let order = transport
        .open_order("EURUSD_otc", 1.0, Direction::Call, 60)
        .await
        .unwrap();
    assert_eq!(order.id, "ord-1");
    assert_eq!(order.open_price, Some(1.0845));
    assert_eq!(transport.correlator().open_orders().len(), 1);

    transport.disconnect();
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_buy_times_out() {
    let venue = FakeVenue::silent_on_orders();
    let transport = Transport::with_connector(config(1), venue.clone());
    assert!(transport.connect().await);

    let err = transport
        .open_order("EURUSD_otc", 1.0, Direction::Put, 60)
        .await
        .unwrap_err();
    assert_eq!(err, PocketError::RequestTimeout(RequestKind::Buy));
    assert!(!transport.correlator().is_pending(RequestKind::Buy));

    transport.disconnect();
}

#[tokio::test(start_paused = true)]
async fn test_unknown_order_outcome() {
    let venue = FakeVenue::accepting();
    let transport = Transport::with_connector(config(1), venue.clone());
    assert!(transport.connect().await);

    let started = tokio::time::Instant::now();
    let settlement = transport
        .check_outcome("never-placed", Duration::from_secs(120))
        .await;
    assert_eq!(settlement.result(), (None, OrderOutcome::Unknown));
    assert!(settlement.order.is_none());
    assert!(started.elapsed() >= Duration::from_secs(120));

    transport.disconnect();
}

#[tokio::test]
async fn test_reconnects_after_server_drop() {
    let venue = FakeVenue::accepting();
    let transport = Transport::with_connector(config(1), venue.clone());
    assert!(transport.connect().await);

    venue.kill_all();

    assert!(
        eventually(|| venue.opens() == 2
            && transport.connection_state() == ConnectionState::Connected)
        .await
    );

    transport.disconnect();
    assert_eq!(transport.connection_state(), ConnectionState::Stopped);
}

#[tokio::test]
async fn test_disconnect_stops_everything() {
    let venue = FakeVenue::accepting();
    let transport = Transport::with_connector(config(1), venue.clone());
    assert!(transport.connect().await);

    transport.disconnect();
    assert_eq!(transport.connection_state(), ConnectionState::Stopped);
    assert!(transport.session().balance().is_none());
    assert_eq!(
        transport.send(r#"42["ps"]"#.to_string()).await.unwrap_err(),
        PocketError::ConnectionClosed
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(venue.opens(), 1);
}
