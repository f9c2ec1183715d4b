//! Bar and trend-reference types consumed by the per-bar cycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed price bar delivered by the price feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Sequence index within the session (0-based)
    pub index: u64,
    /// Bars loaded before the session went live are never traded
    pub is_historical: bool,
}

impl Bar {
    /// Create a live bar
    pub fn live(index: u64, timestamp: DateTime<Utc>, open: f64, high: f64, low: f64, close: f64) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            index,
            is_historical: false,
        }
    }

    /// Create a historical (warm-up only) bar
    pub fn historical(index: u64, timestamp: DateTime<Utc>, open: f64, high: f64, low: f64, close: f64) -> Self {
        Self {
            is_historical: true,
            ..Self::live(index, timestamp, open, high, low, close)
        }
    }
}

/// Fast/slow trend baselines for the current bar
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendReference {
    pub fast: f64,
    pub slow: f64,
}

impl TrendReference {
    pub fn new(fast: f64, slow: f64) -> Self {
        Self { fast, slow }
    }
}
