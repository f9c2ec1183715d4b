//! In-memory broker used by replay, the demo and tests
//!
//! Market orders fill at the mark price. Limit and stop orders rest until a
//! bar trades through them and fill at their own price. OCO siblings are
//! cancelled on a fill, and every resting order is cancelled once the net
//! position returns to zero.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

use crate::trading_core::{Bar, Direction};

use super::broker::{BrokerAdapter, BrokerNotification, BrokerPosition, WorkingOrder};
use super::order::{OrderId, OrderKind, OrderRequest, OrderSide, OrderState};
use super::position::MarketPosition;

#[derive(Debug, Clone)]
struct RestingOrder {
    order_id: String,
    tag: Option<OrderId>,
    side: OrderSide,
    quantity: u32,
    kind: OrderKind,
    oco: Option<OrderId>,
}

impl RestingOrder {
    fn triggered_by(&self, bar: &Bar) -> Option<f64> {
        match (self.kind, self.side) {
            (OrderKind::Limit { price }, OrderSide::Buy) if bar.low <= price => Some(price),
            (OrderKind::Limit { price }, OrderSide::Sell) if bar.high >= price => Some(price),
            (OrderKind::Stop { price }, OrderSide::Buy) if bar.high >= price => Some(price),
            (OrderKind::Stop { price }, OrderSide::Sell) if bar.low <= price => Some(price),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    /// Signed contracts (positive = long)
    net: i64,
    avg_price: f64,
    mark: Option<f64>,
    resting: Vec<RestingOrder>,
    reject_next: u32,
    fail_cancels: bool,
    foreign_counter: u64,
}

impl SimState {
    fn apply_fill(&mut self, side: OrderSide, quantity: u32, price: f64) {
        let signed = match side {
            OrderSide::Buy => quantity as i64,
            OrderSide::Sell => -(quantity as i64),
        };
        let next = self.net + signed;

        if self.net == 0 || self.net.signum() == signed.signum() {
            let held = self.net.abs() as f64;
            self.avg_price = (self.avg_price * held + price * quantity as f64) / (held + quantity as f64);
        } else if next == 0 {
            self.avg_price = 0.0;
        } else if next.signum() != self.net.signum() {
            // Flipped through zero
            self.avg_price = price;
        }
        self.net = next;
    }

    fn position(&self) -> BrokerPosition {
        let position = match self.net.signum() {
            1 => MarketPosition::Long,
            -1 => MarketPosition::Short,
            _ => MarketPosition::Flat,
        };
        BrokerPosition {
            position,
            quantity: self.net.unsigned_abs() as u32,
        }
    }
}

pub struct SimulatedBroker {
    instrument: String,
    state: Mutex<SimState>,
    notify_tx: mpsc::UnboundedSender<BrokerNotification>,
    /// Notifications still to be lost in transit
    drop_next: AtomicU32,
}

impl SimulatedBroker {
    /// Create the broker and the receiver its notifications arrive on
    pub fn new(instrument: &str) -> (Self, mpsc::UnboundedReceiver<BrokerNotification>) {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let broker = Self {
            instrument: instrument.to_string(),
            state: Mutex::new(SimState::default()),
            notify_tx,
            drop_next: AtomicU32::new(0),
        };
        (broker, notify_rx)
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self, notification: BrokerNotification) {
        let dropped = self
            .drop_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if dropped {
            debug!("SIMULATION: Dropping {} for {}", notification.state, notification.tag);
            return;
        }
        let _ = self.notify_tx.send(notification);
    }

    /// Cancel everything resting once the position is flat
    fn sweep_if_flat(&self, state: &mut SimState) {
        if state.net != 0 {
            return;
        }
        for order in state.resting.drain(..) {
            debug!("SIMULATION: Flat, cancelling {}", order.order_id);
            if let Some(tag) = order.tag {
                self.notify(BrokerNotification::cancelled(tag));
            }
        }
    }

    /// Move the mark to the bar close and fill anything the bar traded through
    pub fn on_bar(&self, bar: &Bar) {
        let mut state = self.state();
        state.mark = Some(bar.close);

        let mut index = 0;
        while index < state.resting.len() {
            let Some(fill_price) = state.resting[index].triggered_by(bar) else {
                index += 1;
                continue;
            };

            let order = state.resting.remove(index);
            debug!(
                "SIMULATION: {} {} {} filled @ {:.2}",
                order.order_id, order.side, order.quantity, fill_price
            );
            state.apply_fill(order.side, order.quantity, fill_price);
            if let Some(tag) = order.tag {
                self.notify(BrokerNotification::filled(tag, fill_price, order.quantity));
            }

            if let Some(group) = order.oco {
                let (siblings, rest): (Vec<_>, Vec<_>) = state
                    .resting
                    .drain(..)
                    .partition(|other| other.oco == Some(group));
                state.resting = rest;
                for sibling in siblings {
                    if let Some(tag) = sibling.tag {
                        self.notify(BrokerNotification::cancelled(tag));
                    }
                }
            }

            self.sweep_if_flat(&mut state);
            // Removals above may shift anything; rescan from the start
            index = 0;
        }
    }

    pub fn set_mark(&self, price: f64) {
        self.state().mark = Some(price);
    }

    /// Reject the next `count` submissions
    pub fn reject_next_submissions(&self, count: u32) {
        self.state().reject_next = count;
    }

    /// Lose the next `count` order updates; the broker state still changes
    pub fn drop_next_notifications(&self, count: u32) {
        self.drop_next.store(count, Ordering::SeqCst);
    }

    /// Make cancel requests fail at the call boundary
    pub fn fail_cancels(&self, fail: bool) {
        self.state().fail_cancels = fail;
    }

    /// Position closed outside this engine; resting orders are left behind
    pub fn vanish_position(&self) {
        let mut state = self.state();
        state.net = 0;
        state.avg_price = 0.0;
    }

    /// Place an order this engine knows nothing about
    pub fn seed_working_order(&self, side: OrderSide, quantity: u32, kind: OrderKind) -> String {
        let mut state = self.state();
        state.foreign_counter += 1;
        let order_id = format!("EXT-{}", state.foreign_counter);
        state.resting.push(RestingOrder {
            order_id: order_id.clone(),
            tag: None,
            side,
            quantity,
            kind,
            oco: None,
        });
        order_id
    }

    /// Open a position directly at the broker
    pub fn seed_position(&self, direction: Direction, quantity: u32, price: f64) {
        self.state().apply_fill(OrderSide::entry(direction), quantity, price);
    }

    pub fn position(&self) -> BrokerPosition {
        self.state().position()
    }

    pub fn resting_count(&self) -> usize {
        self.state().resting.len()
    }
}

#[async_trait]
impl BrokerAdapter for SimulatedBroker {
    async fn submit_order(&self, request: &OrderRequest) -> Result<()> {
        let mut state = self.state();

        if state.reject_next > 0 {
            state.reject_next -= 1;
            debug!("SIMULATION: Rejecting {}", request.tag);
            self.notify(BrokerNotification::rejected(request.tag, "simulated rejection"));
            return Ok(());
        }

        match request.kind {
            OrderKind::Market => {
                let Some(mark) = state.mark else {
                    bail!("No mark price for market order {}", request.tag);
                };
                debug!(
                    "SIMULATION: Market {} {} @ {:.2}",
                    request.side, request.quantity, mark
                );
                state.apply_fill(request.side, request.quantity, mark);
                self.notify(BrokerNotification::filled(request.tag, mark, request.quantity));
                self.sweep_if_flat(&mut state);
            }
            OrderKind::Limit { price } | OrderKind::Stop { price } => {
                debug!(
                    "SIMULATION: Resting {} {} {} @ {:.2}",
                    request.tag, request.side, request.quantity, price
                );
                state.resting.push(RestingOrder {
                    order_id: request.tag.to_string(),
                    tag: Some(request.tag),
                    side: request.side,
                    quantity: request.quantity,
                    kind: request.kind,
                    oco: request.oco,
                });
                self.notify(BrokerNotification::working(request.tag));
            }
        }
        Ok(())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let mut state = self.state();
        if state.fail_cancels {
            bail!("Cancel rejected for {}", order_id);
        }

        debug!("SIMULATION: Cancel order {}", order_id);
        if let Some(index) = state.resting.iter().position(|o| o.order_id == order_id) {
            let order = state.resting.remove(index);
            if let Some(tag) = order.tag {
                self.notify(BrokerNotification::cancelled(tag));
            }
        }
        Ok(())
    }

    async fn exit_position(&self, direction: Direction, tag: OrderId) -> Result<()> {
        let mut state = self.state();
        let held = state.position();

        if held.position != MarketPosition::from(direction) {
            debug!("SIMULATION: Exit {} is a no-op ({})", direction, held.position);
            return Ok(());
        }

        let price = state.mark.unwrap_or(state.avg_price);
        debug!("SIMULATION: Exit {} {} @ {:.2}", direction, held.quantity, price);
        state.apply_fill(OrderSide::exit(direction), held.quantity, price);
        self.notify(BrokerNotification::filled(tag, price, held.quantity));
        self.sweep_if_flat(&mut state);
        Ok(())
    }

    async fn query_position(&self, instrument: &str) -> Result<BrokerPosition> {
        if instrument != self.instrument {
            return Ok(BrokerPosition::flat());
        }
        Ok(self.state().position())
    }

    async fn query_working_orders(&self, instrument: &str) -> Result<Vec<WorkingOrder>> {
        if instrument != self.instrument {
            return Ok(Vec::new());
        }
        Ok(self
            .state()
            .resting
            .iter()
            .map(|order| WorkingOrder {
                order_id: order.order_id.clone(),
                instrument: self.instrument.clone(),
                tag: order.tag,
                side: order.side,
                quantity: order.quantity,
                kind: order.kind,
                state: OrderState::Working,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn bar(index: u64, high: f64, low: f64, close: f64) -> Bar {
        Bar::live(index, Utc::now(), close, high, low, close)
    }

    #[tokio::test]
    async fn test_market_fill_at_mark() {
        let (broker, mut rx) = SimulatedBroker::new("NQ");

        // No mark yet
        assert!(broker.submit_order(&OrderRequest::market(OrderId(1), OrderSide::Buy, 1)).await.is_err());

        broker.set_mark(20000.0);
        broker.submit_order(&OrderRequest::market(OrderId(2), OrderSide::Buy, 1)).await.unwrap();

        let fill = rx.try_recv().unwrap();
        assert_eq!(fill, BrokerNotification::filled(OrderId(2), 20000.0, 1));
        assert_eq!(
            broker.query_position("NQ").await.unwrap(),
            BrokerPosition { position: MarketPosition::Long, quantity: 1 }
        );
        assert!(broker.query_position("ES").await.unwrap().is_flat());
    }

    #[tokio::test]
    async fn test_oco_and_flat_sweep() {
        let (broker, mut rx) = SimulatedBroker::new("NQ");
        broker.set_mark(20000.0);
        broker.submit_order(&OrderRequest::market(OrderId(1), OrderSide::Buy, 1)).await.unwrap();

        let stop = OrderRequest::stop(OrderId(2), OrderSide::Sell, 1, 19925.0).with_oco(OrderId(1));
        let target = OrderRequest::limit(OrderId(3), OrderSide::Sell, 1, 20125.0).with_oco(OrderId(1));
        let leg = OrderRequest::limit(OrderId(4), OrderSide::Buy, 1, 19000.0);
        for request in [&stop, &target, &leg] {
            broker.submit_order(request).await.unwrap();
        }
        while rx.try_recv().is_ok() {}
        assert_eq!(broker.resting_count(), 3);

        // Trades through the target only
        broker.on_bar(&bar(1, 20130.0, 20010.0, 20120.0));

        let mut seen = Vec::new();
        while let Ok(n) = rx.try_recv() {
            seen.push((n.tag, n.state));
        }
        assert_eq!(seen[0], (OrderId(3), OrderState::Filled));
        assert!(seen.contains(&(OrderId(2), OrderState::Cancelled)));
        assert!(seen.contains(&(OrderId(4), OrderState::Cancelled)));
        assert_eq!(broker.resting_count(), 0);
        assert!(broker.position().is_flat());
    }

    #[tokio::test]
    async fn test_exit_is_noop_in_wrong_direction() {
        let (broker, mut rx) = SimulatedBroker::new("NQ");
        broker.set_mark(100.0);
        broker.seed_position(Direction::Long, 2, 99.0);

        broker.exit_position(Direction::Short, OrderId(1)).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(broker.position().quantity, 2);

        broker.exit_position(Direction::Long, OrderId(2)).await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), BrokerNotification::filled(OrderId(2), 100.0, 2));
        assert!(broker.position().is_flat());

        // Second exit does nothing
        broker.exit_position(Direction::Long, OrderId(3)).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_test_hooks() {
        let (broker, mut rx) = SimulatedBroker::new("NQ");
        broker.set_mark(100.0);

        broker.reject_next_submissions(1);
        broker.submit_order(&OrderRequest::market(OrderId(1), OrderSide::Buy, 1)).await.unwrap();
        assert_eq!(rx.try_recv().unwrap().state, OrderState::Rejected);
        assert!(broker.position().is_flat());

        let foreign = broker.seed_working_order(OrderSide::Sell, 1, OrderKind::Limit { price: 120.0 });
        let working = broker.query_working_orders("NQ").await.unwrap();
        assert_eq!(working.len(), 1);
        assert_eq!(working[0].tag, None);

        broker.fail_cancels(true);
        assert!(broker.cancel_order(&foreign).await.is_err());
        broker.fail_cancels(false);
        broker.cancel_order(&foreign).await.unwrap();
        assert_eq!(broker.resting_count(), 0);

        // Lost fill: the position still changes
        broker.drop_next_notifications(1);
        broker.submit_order(&OrderRequest::market(OrderId(2), OrderSide::Buy, 1)).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(broker.position().quantity, 1);
        broker.submit_order(&OrderRequest::market(OrderId(3), OrderSide::Buy, 1)).await.unwrap();
        assert_eq!(rx.try_recv().unwrap().tag, OrderId(3));
    }
}
