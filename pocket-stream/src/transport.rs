//! Session transport
//!
//! Owns the single physical connection: regional failover, the socket.io
//! handshake, the credential send, the application heartbeat and automatic
//! reconnection. Each socket gets one listener task that feeds frames, in
//! arrival order, through the [`FrameRouter`] and applies the decoded events
//! to the session, correlator, clock and market book.
//!
//! Reconnection runs in a supervisor task. Listeners only report closures
//! (tagged with their connection generation), so a stale listener can never
//! tear down or reconnect a newer socket.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};
use tracing::{debug, error, info, warn};

use pocket_core::{ConnectionState, PocketError, PocketResult, RequestKind};

use crate::config::StreamConfig;
use crate::connector::{Connector, FrameChannel, WsConnector};
use crate::correlator::{Completion, Correlator};
use crate::market::MarketBook;
use crate::protocol::{Reply, APP_PING};
use crate::region::Region;
use crate::router::{FrameRouter, ProtocolEvent, Routed};
use crate::session::Session;
use crate::time_sync::TimeSync;

// ============================================================================
// Internal state
// ============================================================================

/// The live socket
struct Link {
    generation: u64,
    outbound: mpsc::Sender<String>,
    listener: JoinHandle<()>,
}

struct Supervisor {
    closures: mpsc::UnboundedSender<u64>,
    handle: JoinHandle<()>,
}

pub(crate) struct TransportInner {
    pub(crate) config: StreamConfig,
    connector: Arc<dyn Connector>,
    credential: RwLock<Option<String>>,
    pub(crate) session: Session,
    pub(crate) correlator: Correlator,
    pub(crate) clock: TimeSync,
    pub(crate) market: MarketBook,
    router: Mutex<FrameRouter>,
    link: Mutex<Option<Link>>,
    generation: AtomicU64,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    supervisor: Mutex<Option<Supervisor>>,
    /// Serialises connection attempts so at most one socket exists
    connect_lock: tokio::sync::Mutex<()>,
    stopped: AtomicBool,
}

/// Session transport handle; cheap to clone
#[derive(Clone)]
pub struct Transport {
    pub(crate) inner: Arc<TransportInner>,
}

impl Transport {
    /// Transport over real WebSockets
    pub fn new(config: StreamConfig) -> Self {
        let connector = WsConnector::new(
            config.origin.clone(),
            config.user_agent.clone(),
            config.open_timeout,
        );
        Self::with_connector(config, Arc::new(connector))
    }

    /// Transport over a custom socket connector
    pub fn with_connector(config: StreamConfig, connector: Arc<dyn Connector>) -> Self {
        let credential = config.ssid.clone();
        Self {
            inner: Arc::new(TransportInner {
                config,
                connector,
                credential: RwLock::new(credential),
                session: Session::new(),
                correlator: Correlator::new(),
                clock: TimeSync::new(),
                market: MarketBook::new(),
                router: Mutex::new(FrameRouter::new()),
                link: Mutex::new(None),
                generation: AtomicU64::new(0),
                heartbeat: Mutex::new(None),
                supervisor: Mutex::new(None),
                connect_lock: tokio::sync::Mutex::new(()),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    pub fn correlator(&self) -> &Correlator {
        &self.inner.correlator
    }

    pub fn clock(&self) -> &TimeSync {
        &self.inner.clock
    }

    pub fn market(&self) -> &MarketBook {
        &self.inner.market
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.session.state()
    }

    pub fn region(&self) -> Option<Region> {
        self.inner.session.region()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.session.subscribe()
    }

    /// Install a new session credential and lift a previous rejection
    pub fn set_credential(&self, credential: impl Into<String>) {
        *self.inner.credential.write() = Some(credential.into());
        self.inner.session.clear_auth_rejection();
        info!("[PO WS] Session credential replaced");
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Connect, reporting only success
    pub async fn connect(&self) -> bool {
        match self.try_connect().await {
            Ok(()) => true,
            Err(e) => {
                error!("[PO WS] Connect failed: {}", e);
                false
            }
        }
    }

    /// Connect through the endpoint table, up to `max_passes` full passes
    pub async fn try_connect(&self) -> PocketResult<()> {
        self.inner.stopped.store(false, Ordering::SeqCst);
        if self.connection_state() == ConnectionState::Stopped {
            self.inner.session.set_state(ConnectionState::Disconnected);
        }
        self.ensure_supervisor();
        self.connect_inner().await
    }

    async fn connect_inner(&self) -> PocketResult<()> {
        let _guard = self.inner.connect_lock.lock().await;
        let inner = &self.inner;

        if let Some(reason) = inner.session.auth_rejection() {
            return Err(PocketError::AuthRejected(reason));
        }
        if inner.session.state().is_connected() && inner.link.lock().is_some() {
            return Ok(());
        }
        if inner.credential.read().is_none() {
            let err = PocketError::config("no session credential (PO_SSID) configured");
            inner.session.record_error(err.clone());
            return Err(err);
        }

        let max_passes = inner.config.max_passes;
        let mut attempts = 0u32;

        for pass in 1..=max_passes {
            let regions = inner.config.regions_for_pass();

            for (index, region) in regions.iter().enumerate() {
                if inner.stopped.load(Ordering::SeqCst) {
                    return Err(PocketError::ConnectionClosed);
                }

                attempts += 1;
                info!(
                    "[PO WS] Connecting to {} (pass {}/{})",
                    region, pass, max_passes
                );

                let result = match self.attempt(region).await {
                    Ok(generation) => self.promote(generation),
                    Err(e) => Err(e),
                };

                match result {
                    Ok(()) => {
                        self.start_heartbeat();
                        info!("[PO WS] Connected via {}", region.name);
                        return Ok(());
                    }
                    Err(e) => {
                        inner.drop_link();
                        inner.session.mark_disconnected();

                        if inner.stopped.load(Ordering::SeqCst) {
                            info!("[PO WS] Connect to {} abandoned by disconnect", region.name);
                            return Err(PocketError::ConnectionClosed);
                        }

                        if e.is_fatal() {
                            error!("[PO WS] {} refused the session: {}", region.name, e);
                            inner.session.advance(ConnectionState::Disconnected);
                            return Err(e);
                        }

                        warn!("[PO WS] {} failed: {}", region.name, e);
                        inner.session.record_error(e);

                        if index + 1 < regions.len() {
                            sleep(inner.config.region_delay).await;
                        }
                    }
                }
            }

            if pass < max_passes {
                warn!(
                    "[PO WS] Pass {}/{} exhausted, retrying in {:?}",
                    pass, max_passes, inner.config.pass_delay
                );
                sleep(inner.config.pass_delay).await;
            }
        }

        let err = PocketError::ConnectionFailed { attempts };
        error!("[PO WS] {}", err);
        inner.session.advance(ConnectionState::Disconnected);
        inner.session.record_error(err.clone());
        Err(err)
    }

    /// Open one socket and wait for authentication
    async fn attempt(&self, region: &Region) -> PocketResult<u64> {
        let inner = &self.inner;
        inner.session.advance(ConnectionState::Connecting);
        inner.session.set_region(region.clone());
        inner.router.lock().reset();

        let FrameChannel { outbound, inbound } = inner.connector.open(region).await?;

        let pending = inner
            .correlator
            .register(RequestKind::Connect, inner.config.auth_timeout);
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        {
            let mut link = inner.link.lock();
            // `disconnect` flags first and then takes this lock
            if inner.stopped.load(Ordering::SeqCst) {
                debug!("[PO WS] Stopped while opening {}, dropping socket", region.name);
                return Err(PocketError::ConnectionClosed);
            }
            let listener = tokio::spawn(Arc::clone(inner).listen(
                generation,
                outbound.clone(),
                inbound,
            ));
            *link = Some(Link {
                generation,
                outbound,
                listener,
            });
        }

        pending.wait().await?;
        Ok(generation)
    }

    /// Mark an authenticated socket as the session's connection
    ///
    /// Checked under the link lock so a socket that closed right after
    /// authenticating is not reported as connected.
    fn promote(&self, generation: u64) -> PocketResult<()> {
        let link = self.inner.link.lock();
        let live = link.as_ref().map(|l| l.generation) == Some(generation);
        if !live || self.inner.stopped.load(Ordering::SeqCst) {
            return Err(PocketError::ConnectionClosed);
        }
        self.inner.session.advance(ConnectionState::Connected);
        Ok(())
    }

    /// Tear down the session; no reconnect follows
    pub fn disconnect(&self) {
        let inner = &self.inner;
        inner.stopped.store(true, Ordering::SeqCst);
        inner.session.set_state(ConnectionState::Stopped);

        if let Some(supervisor) = inner.supervisor.lock().take() {
            supervisor.handle.abort();
        }
        inner.stop_heartbeat();
        if let Some(link) = inner.link.lock().take() {
            link.listener.abort();
        }

        inner.session.mark_disconnected();
        inner.correlator.fail_all(PocketError::ConnectionClosed);
        info!("[PO WS] Disconnected");
    }

    /// Queue a raw text frame on the live socket
    pub async fn send(&self, frame: String) -> PocketResult<()> {
        self.inner.send_text(frame).await
    }

    // ========================================================================
    // Background tasks
    // ========================================================================

    fn start_heartbeat(&self) {
        let period = self.inner.config.heartbeat_interval;
        if period.is_zero() {
            warn!("[PO WS] Heartbeat disabled (zero interval)");
            return;
        }

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if let Err(e) = inner.send_text(APP_PING.to_string()).await {
                    warn!("[PO WS] Heartbeat send failed, stopping: {}", e);
                    break;
                }
                debug!("[PO WS] Heartbeat sent");
            }
        });

        if let Some(previous) = self.inner.heartbeat.lock().replace(handle) {
            previous.abort();
        }
    }

    fn ensure_supervisor(&self) {
        let mut supervisor = self.inner.supervisor.lock();
        if supervisor.as_ref().is_some_and(|s| !s.handle.is_finished()) {
            return;
        }

        let (closures, mut rx) = mpsc::unbounded_channel::<u64>();
        let weak: Weak<TransportInner> = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            while let Some(generation) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                let transport = Transport { inner };

                if transport.connection_state() != ConnectionState::Reconnecting {
                    continue;
                }

                info!("[PO WS] Connection {} lost, reconnecting", generation);
                match transport.connect_inner().await {
                    Ok(()) => info!("[PO WS] Reconnected"),
                    Err(e) => error!("[PO WS] Reconnect failed: {}", e),
                }
            }
            debug!("[PO WS] Supervisor stopped");
        });

        *supervisor = Some(Supervisor { closures, handle });
    }
}

impl TransportInner {
    async fn send_text(&self, text: String) -> PocketResult<()> {
        let outbound = self
            .link
            .lock()
            .as_ref()
            .map(|link| link.outbound.clone())
            .ok_or(PocketError::ConnectionClosed)?;

        outbound
            .send(text)
            .await
            .map_err(|_| PocketError::ConnectionClosed)
    }

    fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.abort();
        }
    }

    /// Forget the current socket; its pump closes once the sender is gone
    fn drop_link(&self) {
        if let Some(link) = self.link.lock().take() {
            link.listener.abort();
        }
    }

    // ========================================================================
    // Listener
    // ========================================================================

    async fn listen(
        self: Arc<Self>,
        generation: u64,
        outbound: mpsc::Sender<String>,
        mut inbound: mpsc::Receiver<PocketResult<String>>,
    ) {
        debug!("[PO WS] Listener {} started", generation);

        'frames: while let Some(frame) = inbound.recv().await {
            let text = match frame {
                Ok(text) => text,
                Err(PocketError::MalformedFrame(reason)) => {
                    warn!("[PO WS] Dropping frame: {}", reason);
                    continue;
                }
                Err(e) => {
                    warn!("[PO WS] Connection {} failed: {}", generation, e);
                    self.session.record_error(e);
                    break;
                }
            };

            let routed = self.router.lock().route(&text);

            for item in routed {
                match item {
                    Routed::Reply(reply) => {
                        let frame = reply.render(self.credential.read().as_deref().unwrap_or(""));
                        if outbound.send(frame).await.is_err() {
                            break 'frames;
                        }
                        if reply == Reply::Credential
                            && self.session.state() == ConnectionState::Connecting
                        {
                            self.session.advance(ConnectionState::HandshakeSent);
                        }
                    }
                    Routed::Event(event) => {
                        let fatal = matches!(event, ProtocolEvent::AuthRejected(_));
                        self.apply(event);
                        if fatal {
                            self.reject_link(generation);
                            return;
                        }
                    }
                }
            }
        }

        self.on_link_closed(generation);
    }

    /// Apply one decoded event to session state and waiters
    fn apply(&self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::Authenticated => {
                info!("[PO WS] Authenticated");
                self.session.mark_authenticated();
                if !self.session.state().is_connected() {
                    self.session.advance(ConnectionState::Authenticated);
                }
                self.correlator
                    .complete(RequestKind::Connect, Ok(Completion::Authenticated));
            }
            ProtocolEvent::AuthRejected(reason) => {
                error!("[PO WS] Session credential rejected: {}", reason);
                self.session.mark_auth_rejected(reason.clone());
                self.correlator
                    .fail_all(PocketError::AuthRejected(reason));
            }
            ProtocolEvent::BalanceUpdated(balance) => self.session.set_balance(balance),
            ProtocolEvent::OrderOpened(ack) => {
                debug!("[PO WS] Order acknowledged: {}", ack.id);
                self.correlator
                    .complete(RequestKind::Buy, Ok(Completion::OrderOpened(ack)));
            }
            ProtocolEvent::OrderRejected(reason) => {
                warn!("[PO WS] Order rejected: {}", reason);
                self.correlator
                    .complete(RequestKind::Buy, Err(PocketError::OrderRejected(reason)));
            }
            ProtocolEvent::DealsClosed(deals) => {
                debug!("[PO WS] {} deal(s) closed", deals.len());
                self.correlator.record_deals(deals);
            }
            ProtocolEvent::HistoryLoaded(batch) => {
                debug!("[PO WS] History batch with {} points", batch.points.len());
                self.correlator
                    .complete(RequestKind::FetchHistory, Ok(Completion::History(batch)));
            }
            ProtocolEvent::StreamTicks(ticks) => {
                for tick in ticks {
                    self.clock.observe(tick.timestamp);
                    self.market.record_tick(tick);
                }
            }
            ProtocolEvent::HistoryNew(snapshot) => {
                self.market.store_snapshot(snapshot.clone());
                self.correlator
                    .complete(RequestKind::ChangeSymbol, Ok(Completion::Snapshot(snapshot)));
            }
            ProtocolEvent::AssetsUpdated(assets) => self.market.update_assets(assets),
        }
    }

    /// Close a socket whose credential was refused; never reconnects
    fn reject_link(&self, generation: u64) {
        {
            let mut link = self.link.lock();
            if link.as_ref().map(|l| l.generation) == Some(generation) {
                *link = None;
            }
        }
        self.stop_heartbeat();
        self.session.mark_disconnected();
        self.session.advance(ConnectionState::Disconnected);
    }

    fn on_link_closed(&self, generation: u64) {
        let reconnect = {
            let mut link = self.link.lock();
            if link.as_ref().map(|l| l.generation) != Some(generation) {
                debug!("[PO WS] Stale connection {} closed", generation);
                return;
            }
            *link = None;

            let state = self.session.state();
            if state == ConnectionState::Connected {
                self.session.advance(ConnectionState::Reconnecting)
            } else {
                debug!("[PO WS] Connection {} closed while {}", generation, state);
                false
            }
        };

        self.stop_heartbeat();
        self.session.mark_disconnected();
        self.correlator.fail_all(PocketError::ConnectionClosed);

        if reconnect {
            warn!("[PO WS] Connection {} lost", generation);
            match self.supervisor.lock().as_ref() {
                Some(supervisor) => {
                    if supervisor.closures.send(generation).is_err() {
                        error!("[PO WS] Reconnect supervisor is gone");
                    }
                }
                None => error!("[PO WS] No reconnect supervisor running"),
            }
        }
    }
}
