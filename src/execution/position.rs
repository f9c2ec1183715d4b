//! Position state and session counters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::trading_core::Direction;

/// Broker-style market position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MarketPosition {
    #[default]
    Flat,
    Long,
    Short,
}

impl MarketPosition {
    pub fn direction(&self) -> Option<Direction> {
        match self {
            Self::Flat => None,
            Self::Long => Some(Direction::Long),
            Self::Short => Some(Direction::Short),
        }
    }
}

impl From<Direction> for MarketPosition {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Long => Self::Long,
            Direction::Short => Self::Short,
        }
    }
}

impl std::fmt::Display for MarketPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Flat => write!(f, "FLAT"),
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Internal view of the open position
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionState {
    market_position: MarketPosition,
    quantity: u32,
    entry_price: Option<f64>,
    /// Primary stop price; every grid leg's stop derives from it
    risk_baseline: Option<f64>,
    opened_at: Option<DateTime<Utc>>,
}

impl PositionState {
    pub fn market_position(&self) -> MarketPosition {
        self.market_position
    }

    pub fn direction(&self) -> Option<Direction> {
        self.market_position.direction()
    }

    pub fn quantity(&self) -> u32 {
        self.quantity
    }

    /// Price of the primary fill
    pub fn entry_price(&self) -> Option<f64> {
        self.entry_price
    }

    pub fn risk_baseline(&self) -> Option<f64> {
        self.risk_baseline
    }

    pub fn opened_at(&self) -> Option<DateTime<Utc>> {
        self.opened_at
    }

    pub fn is_flat(&self) -> bool {
        self.market_position == MarketPosition::Flat
    }

    /// Primary entry filled
    pub fn open(&mut self, direction: Direction, quantity: u32, fill_price: f64) {
        self.market_position = direction.into();
        self.quantity = quantity;
        self.entry_price = Some(fill_price);
        self.opened_at = Some(Utc::now());
    }

    /// Grid leg filled
    pub fn add(&mut self, quantity: u32) {
        self.quantity += quantity;
    }

    /// Closing fill. Returns true when the position went flat.
    pub fn reduce(&mut self, quantity: u32) -> bool {
        self.quantity = self.quantity.saturating_sub(quantity);
        if self.quantity == 0 {
            self.reset();
            return true;
        }
        false
    }

    /// Take the broker's view as truth. The baseline is kept when the
    /// direction is unchanged.
    pub fn adopt(&mut self, direction: Direction, quantity: u32) {
        if self.direction() != Some(direction) {
            self.reset();
            self.opened_at = Some(Utc::now());
        }
        self.market_position = direction.into();
        self.quantity = quantity;
    }

    /// Set the risk baseline. Refuses to overwrite a live one.
    pub fn set_risk_baseline(&mut self, price: f64) -> bool {
        if self.risk_baseline.is_some() {
            return false;
        }
        self.risk_baseline = Some(price);
        true
    }

    /// Back to Flat, baseline cleared
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Counters for the session summary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub signals: u32,
    pub entries: u32,
    pub grid_orders: u32,
    pub grid_fills: u32,
    pub protective_attached: u32,
    pub exits: u32,
    pub ghost_corrections: u32,
    pub rejections: u32,
}

impl SessionStats {
    /// Get statistics summary
    pub fn summary(&self) -> String {
        format!(
            "Signals: {} | Entries: {} | Grid: {}/{} filled | Protective: {} | Exits: {} | Ghosts: {} | Rejects: {}",
            self.signals,
            self.entries,
            self.grid_fills,
            self.grid_orders,
            self.protective_attached,
            self.exits,
            self.ghost_corrections,
            self.rejections
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_tracking() {
        let mut position = PositionState::default();
        assert!(position.is_flat());

        position.open(Direction::Long, 1, 20000.0);
        position.add(1);
        assert_eq!(position.market_position(), MarketPosition::Long);
        assert_eq!(position.quantity(), 2);

        assert!(!position.reduce(1));
        assert!(position.reduce(1));
        assert!(position.is_flat());
        assert_eq!(position.entry_price(), None);
    }

    #[test]
    fn test_risk_baseline_is_set_once() {
        let mut position = PositionState::default();
        position.open(Direction::Short, 1, 20000.0);

        assert!(position.set_risk_baseline(20075.0));
        assert!(!position.set_risk_baseline(20100.0));
        assert_eq!(position.risk_baseline(), Some(20075.0));

        position.reset();
        assert_eq!(position.risk_baseline(), None);
        assert!(position.set_risk_baseline(20100.0));
    }

    #[test]
    fn test_adopt_keeps_baseline_for_same_direction() {
        let mut position = PositionState::default();
        position.open(Direction::Long, 2, 20000.0);
        position.set_risk_baseline(19925.0);

        position.adopt(Direction::Long, 1);
        assert_eq!(position.quantity(), 1);
        assert_eq!(position.risk_baseline(), Some(19925.0));

        position.adopt(Direction::Short, 1);
        assert_eq!(position.market_position(), MarketPosition::Short);
        assert_eq!(position.risk_baseline(), None);
    }
}
