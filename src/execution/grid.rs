//! Grid ladder of scaling limit orders
//!
//! One ladder per position, emitted when the primary fills. Legs sit at
//! `entry ∓ level * step` and are dropped from tracking once the position is
//! flat. Broker-side cancellation of resting legs follows from the exit.

use tracing::{debug, info};

use crate::trading_core::Direction;

use super::config::StrategyConfig;
use super::order::{OrderId, OrderIdAllocator, OrderRequest, OrderRole, OrderSide, OrderState};

/// One scaling order
#[derive(Debug, Clone, PartialEq)]
pub struct GridLeg {
    pub order_id: OrderId,
    /// 1-based distance from the entry in steps
    pub level: u32,
    pub price: f64,
    pub state: OrderState,
}

/// Ladder for the current position
#[derive(Debug, Clone)]
pub struct GridLadder {
    /// Distinguishes this ladder from every earlier one in the session
    pub sequence: u64,
    pub direction: Direction,
    pub base_price: f64,
    pub legs: Vec<GridLeg>,
}

impl GridLadder {
    pub fn working_legs(&self) -> usize {
        self.legs.iter().filter(|leg| !leg.state.is_terminal()).count()
    }

    pub fn filled_legs(&self) -> usize {
        self.legs
            .iter()
            .filter(|leg| leg.state == OrderState::Filled)
            .count()
    }
}

#[derive(Debug)]
pub struct GridChainManager {
    enabled: bool,
    step_ticks: f64,
    steps: u32,
    tick_size: f64,
    quantity: u32,
    next_sequence: u64,
    ladder: Option<GridLadder>,
}

impl GridChainManager {
    pub fn new(enabled: bool, step_ticks: f64, steps: u32, tick_size: f64, quantity: u32) -> Self {
        Self {
            enabled,
            step_ticks,
            steps,
            tick_size,
            quantity,
            next_sequence: 1,
            ladder: None,
        }
    }

    pub fn from_config(config: &StrategyConfig) -> Self {
        Self::new(
            config.use_grid_entry,
            config.grid_step_ticks,
            config.grid_steps,
            config.tick_size,
            config.quantity,
        )
    }

    /// Build the ladder for a freshly filled primary.
    ///
    /// Returns nothing when the grid is disabled, has no steps, or a zero
    /// step; levels that would price at or below zero are skipped.
    pub fn emit(
        &mut self,
        direction: Direction,
        entry_price: f64,
        ids: &mut OrderIdAllocator,
    ) -> Vec<(OrderRequest, OrderRole)> {
        if !self.enabled || self.steps == 0 || self.step_ticks <= 0.0 {
            return Vec::new();
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let step = self.step_ticks * self.tick_size;
        let side = OrderSide::entry(direction);
        let mut legs = Vec::with_capacity(self.steps as usize);
        let mut requests = Vec::with_capacity(self.steps as usize);

        for level in 1..=self.steps {
            let offset = level as f64 * step;
            let price = match direction {
                Direction::Long => entry_price - offset,
                Direction::Short => entry_price + offset,
            };
            if price <= 0.0 {
                debug!("Grid level {} skipped (price {:.2})", level, price);
                continue;
            }

            let order_id = ids.next_id();
            legs.push(GridLeg {
                order_id,
                level,
                price,
                state: OrderState::Submitted,
            });
            requests.push((
                OrderRequest::limit(order_id, side, self.quantity, price),
                OrderRole::GridLeg { ladder: sequence, level },
            ));
        }

        info!(
            "GRID #{}: {} {} legs from {:.2} every {:.2}",
            sequence,
            legs.len(),
            direction,
            entry_price,
            step
        );

        self.ladder = Some(GridLadder {
            sequence,
            direction,
            base_price: entry_price,
            legs,
        });
        requests
    }

    pub fn ladder(&self) -> Option<&GridLadder> {
        self.ladder.as_ref()
    }

    fn leg_mut(&mut self, order_id: OrderId) -> Option<&mut GridLeg> {
        self.ladder
            .as_mut()?
            .legs
            .iter_mut()
            .find(|leg| leg.order_id == order_id)
    }

    pub fn mark_working(&mut self, order_id: OrderId) {
        if let Some(leg) = self.leg_mut(order_id) {
            if !leg.state.is_terminal() {
                leg.state = OrderState::Working;
            }
        }
    }

    /// Returns false for legs that are unknown or already terminal
    pub fn mark_filled(&mut self, order_id: OrderId) -> bool {
        match self.leg_mut(order_id) {
            Some(leg) if !leg.state.is_terminal() => {
                leg.state = OrderState::Filled;
                true
            }
            _ => false,
        }
    }

    /// Remove a rejected or cancelled leg; the rest of the ladder stays
    pub fn drop_leg(&mut self, order_id: OrderId) -> Option<GridLeg> {
        let ladder = self.ladder.as_mut()?;
        let index = ladder.legs.iter().position(|leg| leg.order_id == order_id)?;
        Some(ladder.legs.remove(index))
    }

    /// Forget the ladder. Returns ids of legs that were still working, which
    /// the caller cancels at the broker.
    pub fn clear(&mut self) -> Vec<OrderId> {
        let Some(ladder) = self.ladder.take() else {
            return Vec::new();
        };
        debug!(
            "GRID #{} closed: {} filled, {} working",
            ladder.sequence,
            ladder.filled_legs(),
            ladder.working_legs()
        );
        ladder
            .legs
            .into_iter()
            .filter(|leg| !leg.state.is_terminal())
            .map(|leg| leg.order_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(steps: u32, step_ticks: f64) -> GridChainManager {
        GridChainManager::new(true, step_ticks, steps, 1.0, 1)
    }

    #[test]
    fn test_long_ladder_prices() {
        let mut grid = manager(2, 60.0);
        let mut ids = OrderIdAllocator::default();

        let requests = grid.emit(Direction::Long, 20000.0, &mut ids);
        let prices: Vec<_> = requests.iter().map(|(r, _)| r.kind.price().unwrap()).collect();
        assert_eq!(prices, vec![19940.0, 19880.0]);
        assert!(requests.iter().all(|(r, _)| r.side == OrderSide::Buy));
        assert_eq!(requests[1].1, OrderRole::GridLeg { ladder: 1, level: 2 });

        let ladder = grid.ladder().unwrap();
        assert_eq!(ladder.working_legs(), 2);
        assert_eq!(ladder.base_price, 20000.0);
    }

    #[test]
    fn test_short_ladder_scales_above() {
        let mut grid = GridChainManager::new(true, 60.0, 2, 0.25, 1);
        let mut ids = OrderIdAllocator::default();

        let requests = grid.emit(Direction::Short, 20000.0, &mut ids);
        let prices: Vec<_> = requests.iter().map(|(r, _)| r.kind.price().unwrap()).collect();
        assert_eq!(prices, vec![20015.0, 20030.0]);
        assert!(requests.iter().all(|(r, _)| r.side == OrderSide::Sell));
    }

    #[test]
    fn test_sequences_and_ids_never_repeat() {
        let mut grid = manager(2, 60.0);
        let mut ids = OrderIdAllocator::default();

        let first = grid.emit(Direction::Long, 20000.0, &mut ids);
        grid.clear();
        let second = grid.emit(Direction::Long, 20000.0, &mut ids);

        assert_eq!(grid.ladder().unwrap().sequence, 2);
        for (a, _) in &first {
            assert!(second.iter().all(|(b, _)| b.tag != a.tag));
        }
    }

    #[test]
    fn test_noop_configurations() {
        let mut ids = OrderIdAllocator::default();

        assert!(manager(0, 60.0).emit(Direction::Long, 20000.0, &mut ids).is_empty());
        assert!(manager(2, 0.0).emit(Direction::Long, 20000.0, &mut ids).is_empty());

        let mut disabled = GridChainManager::new(false, 60.0, 2, 1.0, 1);
        assert!(disabled.emit(Direction::Long, 20000.0, &mut ids).is_empty());
        assert!(disabled.ladder().is_none());

        // Second level would price at zero
        let requests = manager(2, 50.0).emit(Direction::Long, 100.0, &mut ids);
        assert_eq!(requests.len(), 1);
    }

    #[test]
    fn test_leg_tracking() {
        let mut grid = manager(2, 60.0);
        let mut ids = OrderIdAllocator::default();
        let requests = grid.emit(Direction::Long, 20000.0, &mut ids);
        let (first, second) = (requests[0].0.tag, requests[1].0.tag);

        grid.mark_working(first);
        assert_eq!(grid.ladder().unwrap().legs[0].state, OrderState::Working);
        assert!(grid.mark_filled(first));
        assert!(!grid.mark_filled(first));
        assert_eq!(grid.ladder().unwrap().working_legs(), 1);

        assert!(grid.drop_leg(second).is_some());
        assert_eq!(grid.ladder().unwrap().legs.len(), 1);
        assert_eq!(grid.ladder().unwrap().filled_legs(), 1);

        assert!(grid.clear().is_empty());
        assert!(grid.ladder().is_none());
    }

    #[test]
    fn test_clear_returns_working_legs() {
        let mut grid = manager(3, 60.0);
        let mut ids = OrderIdAllocator::default();
        let requests = grid.emit(Direction::Long, 20000.0, &mut ids);
        grid.mark_filled(requests[0].0.tag);

        let live = grid.clear();
        assert_eq!(live, vec![requests[1].0.tag, requests[2].0.tag]);
    }
}
