//! Request correlation
//!
//! The venue echoes no request ids, so at most one request per
//! [`RequestKind`] is in flight. Registering a kind that is already pending
//! supersedes the older waiter. Settled deals are kept in an outcome book
//! that waiters watch instead of polling.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use pocket_core::{
    DealRecord, HistoryBatch, HistorySnapshot, OpenOrderAck, Order, OrderStatus, PocketError,
    PocketResult, RequestKind,
};

/// Settled deals remembered for late outcome queries
const MAX_SETTLED_DEALS: usize = 512;

/// Orders remembered until their outcome is collected
pub const MAX_TRACKED_ORDERS: usize = 512;

/// Successful completion of a correlated request
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Authenticated,
    OrderOpened(OpenOrderAck),
    History(HistoryBatch),
    Snapshot(HistorySnapshot),
}

impl Completion {
    fn describe(&self) -> &'static str {
        match self {
            Completion::Authenticated => "authentication",
            Completion::OrderOpened(_) => "order acknowledgement",
            Completion::History(_) => "history batch",
            Completion::Snapshot(_) => "history snapshot",
        }
    }

    pub fn into_order(self) -> PocketResult<OpenOrderAck> {
        match self {
            Completion::OrderOpened(ack) => Ok(ack),
            other => Err(PocketError::internal(format!(
                "expected order acknowledgement, got {}",
                other.describe()
            ))),
        }
    }

    pub fn into_history(self) -> PocketResult<HistoryBatch> {
        match self {
            Completion::History(batch) => Ok(batch),
            other => Err(PocketError::internal(format!(
                "expected history batch, got {}",
                other.describe()
            ))),
        }
    }

    pub fn into_snapshot(self) -> PocketResult<HistorySnapshot> {
        match self {
            Completion::Snapshot(snapshot) => Ok(snapshot),
            other => Err(PocketError::internal(format!(
                "expected history snapshot, got {}",
                other.describe()
            ))),
        }
    }
}

type Waiter = oneshot::Sender<PocketResult<Completion>>;

struct PendingEntry {
    id: u64,
    created_at: Instant,
    tx: Waiter,
}

type PendingMap = Arc<Mutex<HashMap<RequestKind, PendingEntry>>>;

/// Handle to one registered request
///
/// Dropping the handle (including on timeout) releases its slot unless a
/// newer request of the same kind already took it over.
pub struct PendingRequest {
    kind: RequestKind,
    id: u64,
    deadline: Instant,
    rx: Option<oneshot::Receiver<PocketResult<Completion>>>,
    pending: PendingMap,
}

impl PendingRequest {
    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for completion, failure or the deadline, whichever comes first
    pub async fn wait(mut self) -> PocketResult<Completion> {
        let Some(rx) = self.rx.take() else {
            return Err(PocketError::internal("pending request already awaited"));
        };

        match timeout_at(self.deadline, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without a verdict
            Ok(Err(_)) => Err(PocketError::ConnectionClosed),
            Err(_) => {
                debug!("[PO WS] {} request timed out", self.kind);
                Err(PocketError::RequestTimeout(self.kind))
            }
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        let mut pending = self.pending.lock();
        if pending.get(&self.kind).map(|e| e.id) == Some(self.id) {
            pending.remove(&self.kind);
        }
    }
}

#[derive(Default)]
struct OutcomeBook {
    deals: HashMap<String, DealRecord>,
    order: VecDeque<String>,
}

impl OutcomeBook {
    fn insert(&mut self, deal: DealRecord) {
        let id = deal.id.clone();
        if self.deals.insert(id.clone(), deal).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > MAX_SETTLED_DEALS {
            if let Some(oldest) = self.order.pop_front() {
                self.deals.remove(&oldest);
            }
        }
    }
}

/// Accepted orders, oldest evicted first once full
#[derive(Default)]
struct OrderBook {
    orders: HashMap<String, Order>,
    order: VecDeque<String>,
}

impl OrderBook {
    fn insert(&mut self, order: Order) {
        let id = order.id.clone();
        if self.orders.insert(id.clone(), order).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > MAX_TRACKED_ORDERS {
            let Some(oldest) = self.order.pop_front() else { break };
            if let Some(evicted) = self.orders.remove(&oldest) {
                if !evicted.status.is_terminal() {
                    warn!("[PO WS] Order {} evicted before its outcome was collected", oldest);
                }
            }
        }
    }

    fn remove(&mut self, order_id: &str) -> Option<Order> {
        let order = self.orders.remove(order_id)?;
        self.order.retain(|id| id != order_id);
        Some(order)
    }
}

/// Maps inbound completions onto registered requests
pub struct Correlator {
    pending: PendingMap,
    next_id: AtomicU64,
    outcomes: Mutex<OutcomeBook>,
    outcome_version: watch::Sender<u64>,
    orders: Mutex<OrderBook>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        let (outcome_version, _) = watch::channel(0);
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            outcomes: Mutex::new(OutcomeBook::default()),
            outcome_version,
            orders: Mutex::new(OrderBook::default()),
        }
    }

    // ========================================================================
    // Pending requests
    // ========================================================================

    /// Register a request of `kind`, superseding any older one
    pub fn register(&self, kind: RequestKind, timeout: Duration) -> PendingRequest {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let created_at = Instant::now();

        let previous = self
            .pending
            .lock()
            .insert(kind, PendingEntry { id, created_at, tx });

        if let Some(previous) = previous {
            debug!(
                "[PO WS] {} request superseded after {:?}",
                kind,
                previous.created_at.elapsed()
            );
            let _ = previous.tx.send(Err(PocketError::RequestSuperseded(kind)));
        }

        PendingRequest {
            kind,
            id,
            deadline: created_at + timeout,
            rx: Some(rx),
            pending: Arc::clone(&self.pending),
        }
    }

    /// Resolve the pending request of `kind`
    ///
    /// Returns `false` when nothing was waiting; the result is dropped.
    pub fn complete(&self, kind: RequestKind, result: PocketResult<Completion>) -> bool {
        let entry = self.pending.lock().remove(&kind);
        match entry {
            Some(entry) => {
                if entry.tx.send(result).is_err() {
                    debug!("[PO WS] {} waiter went away before completion", kind);
                }
                true
            }
            None => {
                debug!("[PO WS] Unsolicited {} completion dropped", kind);
                false
            }
        }
    }

    pub fn is_pending(&self, kind: RequestKind) -> bool {
        self.pending.lock().contains_key(&kind)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Fail every pending request, e.g. when the connection drops
    pub fn fail_all(&self, error: PocketError) {
        let drained: Vec<(RequestKind, PendingEntry)> = self.pending.lock().drain().collect();
        if !drained.is_empty() {
            warn!(
                "[PO WS] Failing {} pending request(s): {}",
                drained.len(),
                error
            );
        }
        for (_, entry) in drained {
            let _ = entry.tx.send(Err(error.clone()));
        }
    }

    // ========================================================================
    // Orders and outcomes
    // ========================================================================

    /// Remember an order the venue accepted
    pub fn track_order(&self, order: Order) {
        self.orders.lock().insert(order);
    }

    pub fn tracked_order(&self, order_id: &str) -> Option<Order> {
        self.orders.lock().orders.get(order_id).cloned()
    }

    pub fn tracked_count(&self) -> usize {
        self.orders.lock().orders.len()
    }

    /// Stop tracking an order and hand it back
    pub fn take_order(&self, order_id: &str) -> Option<Order> {
        self.orders.lock().remove(order_id)
    }

    /// Orders still waiting for settlement
    pub fn open_orders(&self) -> Vec<Order> {
        self.orders
            .lock()
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .cloned()
            .collect()
    }

    /// Record settled deals and wake every outcome waiter
    pub fn record_deals(&self, deals: Vec<DealRecord>) {
        if deals.is_empty() {
            return;
        }

        {
            let mut book = self.orders.lock();
            for deal in &deals {
                if let Some(order) = book.orders.get_mut(&deal.id) {
                    order.status = OrderStatus::from(deal.outcome());
                }
            }
        }

        {
            let mut book = self.outcomes.lock();
            for deal in deals {
                book.insert(deal);
            }
        }

        self.outcome_version.send_modify(|version| *version += 1);
    }

    /// Settled deal for `order_id`, if it has been pushed
    pub fn settled(&self, order_id: &str) -> Option<DealRecord> {
        self.outcomes.lock().deals.get(order_id).cloned()
    }

    /// Wait until the deal for `order_id` settles or `timeout` elapses
    pub async fn wait_outcome(&self, order_id: &str, timeout: Duration) -> Option<DealRecord> {
        let deadline = Instant::now() + timeout;
        let mut version = self.outcome_version.subscribe();

        loop {
            // Checked after subscribing so a push between the two is not lost
            if let Some(deal) = self.settled(order_id) {
                return Some(deal);
            }

            match timeout_at(deadline, version.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pocket_core::Direction;

    fn order(id: &str) -> Order {
        Order {
            id: id.to_string(),
            asset: "EURUSD_otc".to_string(),
            direction: Direction::Call,
            amount: 1.0,
            duration: 60,
            open_price: None,
            open_timestamp: 0,
            status: OrderStatus::Open,
        }
    }

    fn deal(id: &str, profit: f64) -> DealRecord {
        DealRecord {
            id: id.to_string(),
            asset: Some("EURUSD_otc".to_string()),
            profit: Some(profit),
            amount: Some(1.0),
            command: Some(0),
            open_price: None,
            close_price: None,
            close_timestamp: None,
        }
    }

    #[tokio::test]
    async fn test_complete_resolves_waiter() {
        let correlator = Correlator::new();
        let pending = correlator.register(RequestKind::Connect, Duration::from_secs(1));
        assert!(correlator.complete(RequestKind::Connect, Ok(Completion::Authenticated)));
        assert_eq!(pending.wait().await.unwrap(), Completion::Authenticated);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_newer_request_supersedes_older() {
        let correlator = Correlator::new();
        let first = correlator.register(RequestKind::FetchHistory, Duration::from_secs(5));
        let second = correlator.register(RequestKind::FetchHistory, Duration::from_secs(5));

        assert_eq!(
            first.wait().await.unwrap_err(),
            PocketError::RequestSuperseded(RequestKind::FetchHistory)
        );
        // Dropping the superseded handle must not release the newer slot
        assert!(correlator.is_pending(RequestKind::FetchHistory));

        let batch = HistoryBatch {
            asset: None,
            period: Some(60),
            points: Vec::new(),
        };
        correlator.complete(RequestKind::FetchHistory, Ok(Completion::History(batch.clone())));
        assert_eq!(second.wait().await.unwrap(), Completion::History(batch));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_slot() {
        let correlator = Correlator::new();
        let pending = correlator.register(RequestKind::Buy, Duration::from_secs(5));
        assert_eq!(
            pending.wait().await.unwrap_err(),
            PocketError::RequestTimeout(RequestKind::Buy)
        );
        assert!(!correlator.is_pending(RequestKind::Buy));
        assert!(!correlator.complete(RequestKind::Buy, Ok(Completion::Authenticated)));
    }

    #[tokio::test]
    async fn test_fail_all() {
        let correlator = Correlator::new();
        let buy = correlator.register(RequestKind::Buy, Duration::from_secs(5));
        let history = correlator.register(RequestKind::FetchHistory, Duration::from_secs(5));
        correlator.fail_all(PocketError::ConnectionClosed);
        assert_eq!(buy.wait().await.unwrap_err(), PocketError::ConnectionClosed);
        assert_eq!(history.wait().await.unwrap_err(), PocketError::ConnectionClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_outcome_wakes_on_push() {
        let correlator = Arc::new(Correlator::new());
        correlator.track_order(order("ord-1"));

        let pusher = Arc::clone(&correlator);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            pusher.record_deals(vec![deal("other", -1.0)]);
            tokio::time::sleep(Duration::from_secs(30)).await;
            pusher.record_deals(vec![deal("ord-1", 0.92)]);
        });

        let settled = correlator
            .wait_outcome("ord-1", Duration::from_secs(120))
            .await
            .unwrap();
        assert_eq!(settled.profit, Some(0.92));
        assert_eq!(
            correlator.tracked_order("ord-1").unwrap().status,
            OrderStatus::Won
        );
        assert!(correlator.open_orders().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_outcome_times_out() {
        let correlator = Correlator::new();
        assert!(correlator
            .wait_outcome("missing", Duration::from_secs(120))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_each_kind_has_its_own_slot() {
        let correlator = Correlator::new();
        let pending: Vec<PendingRequest> = RequestKind::ALL
            .iter()
            .map(|kind| correlator.register(*kind, Duration::from_secs(5)))
            .collect();
        assert_eq!(correlator.pending_count(), RequestKind::ALL.len());

        for kind in RequestKind::ALL {
            assert!(correlator.complete(kind, Ok(Completion::Authenticated)));
        }
        for request in pending {
            assert_eq!(request.wait().await.unwrap(), Completion::Authenticated);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_outcome_waits_take_no_slot() {
        let correlator = Arc::new(Correlator::new());
        correlator.track_order(order("ord-1"));
        correlator.track_order(order("ord-2"));

        let waits: Vec<_> = ["ord-1", "ord-2"]
            .into_iter()
            .map(|id| {
                let correlator = Arc::clone(&correlator);
                tokio::spawn(async move {
                    correlator.wait_outcome(id, Duration::from_secs(120)).await
                })
            })
            .collect();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(correlator.pending_count(), 0);

        correlator.record_deals(vec![deal("ord-2", -1.0), deal("ord-1", 0.8)]);
        let profits: Vec<Option<f64>> = futures_util::future::join_all(waits)
            .await
            .into_iter()
            .map(|settled| settled.unwrap().and_then(|deal| deal.profit))
            .collect();
        assert_eq!(profits, vec![Some(0.8), Some(-1.0)]);
    }

    #[test]
    fn test_tracked_orders_are_capped() {
        let correlator = Correlator::new();
        for i in 0..MAX_TRACKED_ORDERS + 10 {
            correlator.track_order(order(&format!("ord-{}", i)));
        }
        assert_eq!(correlator.tracked_count(), MAX_TRACKED_ORDERS);
        assert!(correlator.tracked_order("ord-9").is_none());
        assert!(correlator.tracked_order("ord-10").is_some());

        assert!(correlator.take_order("ord-10").is_some());
        correlator.track_order(order("late"));
        assert_eq!(correlator.tracked_count(), MAX_TRACKED_ORDERS);
        assert!(correlator.tracked_order("ord-11").is_some());
    }
}
