//! Correlated venue requests
//!
//! Each call registers with the correlator before its command goes out, so
//! a reply that arrives immediately still finds its waiter.

use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use pocket_core::{
    Direction, HistoryBatch, HistorySnapshot, Order, OrderSettlement, OrderStatus, PocketError,
    PocketResult, RequestKind,
};

use crate::protocol;
use crate::transport::Transport;

impl Transport {
    fn ensure_connected(&self) -> PocketResult<()> {
        if let Some(reason) = self.inner.session.auth_rejection() {
            return Err(PocketError::AuthRejected(reason));
        }
        if self.inner.session.state().is_connected() {
            Ok(())
        } else {
            Err(PocketError::ConnectionClosed)
        }
    }

    /// Place a binary option and wait for the venue's acknowledgement
    #[instrument(skip(self))]
    pub async fn open_order(
        &self,
        asset: &str,
        amount: f64,
        direction: Direction,
        duration: u32,
    ) -> PocketResult<Order> {
        self.ensure_connected()?;

        let pending = self
            .inner
            .correlator
            .register(RequestKind::Buy, self.inner.config.buy_timeout);
        self.send(protocol::open_order(
            asset,
            amount,
            direction,
            duration,
            self.inner.config.demo,
        ))
        .await?;

        let ack = pending.wait().await?.into_order()?;
        let order = Order {
            id: ack.id,
            asset: ack.asset.unwrap_or_else(|| asset.to_string()),
            direction,
            amount: ack.amount.unwrap_or(amount),
            duration,
            open_price: ack.open_price,
            open_timestamp: ack
                .open_timestamp
                .unwrap_or_else(|| self.inner.clock.server_now() as i64),
            status: OrderStatus::Open,
        };

        info!(
            "[PO WS] Order {} opened: {} {} {:.2} for {}s",
            order.id, order.asset, order.direction, order.amount, order.duration
        );
        self.inner.correlator.track_order(order.clone());
        Ok(order)
    }

    /// Request one page of history ending at `end_time`
    ///
    /// A batch labelled with a different asset was meant for another caller
    /// and is reported as a transient failure.
    #[instrument(skip(self))]
    pub async fn load_history(
        &self,
        asset: &str,
        period: u32,
        offset: u64,
        end_time: i64,
    ) -> PocketResult<HistoryBatch> {
        self.ensure_connected()?;

        let pending = self
            .inner
            .correlator
            .register(RequestKind::FetchHistory, self.inner.config.history_timeout);
        let index = protocol::history_index(end_time);
        self.send(protocol::load_history_period(
            asset, period, offset, end_time, index,
        ))
        .await?;

        let batch = pending.wait().await?.into_history()?;
        if let Some(received) = batch.asset.as_deref() {
            if received != asset {
                warn!(
                    "[PO WS] History for {} arrived while waiting for {}",
                    received, asset
                );
                return Err(PocketError::transient(format!(
                    "history batch for {} instead of {}",
                    received, asset
                )));
            }
        }

        debug!("[PO WS] {} history points for {}", batch.points.len(), asset);
        Ok(batch)
    }

    /// Subscribe the session to `asset` and return its history snapshot
    #[instrument(skip(self))]
    pub async fn change_symbol(&self, asset: &str, period: u32) -> PocketResult<HistorySnapshot> {
        self.ensure_connected()?;

        let pending = self
            .inner
            .correlator
            .register(RequestKind::ChangeSymbol, self.inner.config.change_symbol_timeout);
        self.send(protocol::change_symbol(asset, period)).await?;

        let snapshot = pending.wait().await?.into_snapshot()?;
        if snapshot.asset != asset {
            return Err(PocketError::transient(format!(
                "snapshot for {} instead of {}",
                snapshot.asset, asset
            )));
        }
        Ok(snapshot)
    }

    /// Wait for an order to settle, giving up after `timeout`
    ///
    /// The order stops being tracked either way and comes back in its
    /// terminal status. Unknown ids, and ids that do not settle in time,
    /// report `(None, Unknown)`.
    #[instrument(skip(self))]
    pub async fn check_outcome(&self, order_id: &str, timeout: Duration) -> OrderSettlement {
        let settled = self.inner.correlator.wait_outcome(order_id, timeout).await;
        let order = self.inner.correlator.take_order(order_id);

        match settled {
            Some(deal) => {
                let outcome = deal.outcome();
                info!(
                    "[PO WS] Order {} settled: {:?} (profit {:?})",
                    order_id, outcome, deal.profit
                );
                OrderSettlement {
                    profit: deal.profit,
                    outcome,
                    order: order.map(|mut order| {
                        order.status = OrderStatus::from(outcome);
                        order
                    }),
                }
            }
            None => {
                if order.is_some() {
                    warn!("[PO WS] Order {} did not settle within {:?}", order_id, timeout);
                }
                OrderSettlement::unknown(order)
            }
        }
    }
}
