//! Ejection signal generation
//!
//! A signal fires when the close separates from the fast trend reference by
//! at least the configured fraction:
//! - price above fast, distance >= trigger → LONG
//! - price below fast, distance >= trigger → SHORT
//!
//! The trend filter only lets LONG through in an uptrend (fast > slow) and
//! SHORT through in a downtrend (fast < slow). Nothing is carried between bars.

use serde::{Deserialize, Serialize};

use super::bars::TrendReference;

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Raw signal kind, before direction toggles and the trend filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    None,
    Long,
    Short,
}

impl SignalKind {
    pub fn direction(&self) -> Option<Direction> {
        match self {
            Self::None => None,
            Self::Long => Some(Direction::Long),
            Self::Short => Some(Direction::Short),
        }
    }
}

/// Trend state derived from the two references
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trend {
    Up,
    Down,
    Flat,
}

impl Trend {
    pub fn from_reference(trend: &TrendReference) -> Self {
        if trend.fast > trend.slow {
            Self::Up
        } else if trend.fast < trend.slow {
            Self::Down
        } else {
            Self::Flat
        }
    }
}

/// Per-bar signal evaluation result
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub kind: SignalKind,
    pub trigger_price: f64,
    pub bar_index: u64,
    /// None when the fast reference is zero (no distance defined)
    pub distance_ratio: Option<f64>,
    pub trend: Trend,
}

/// Configuration for the signal generator
#[derive(Debug, Clone, Copy)]
pub struct SignalConfig {
    /// Minimum |price - fast| / fast to fire (0.001 = 0.1%)
    pub ejection_trigger: f64,
    /// Require trend agreement before a signal can become an entry
    pub use_trend_filter: bool,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            ejection_trigger: 0.001,
            use_trend_filter: true,
        }
    }
}

/// Stateless ejection signal generator
#[derive(Debug, Clone)]
pub struct SignalGenerator {
    config: SignalConfig,
}

impl SignalGenerator {
    pub fn new(config: SignalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    /// Relative distance of price from the fast reference.
    ///
    /// Returns None if `fast` is zero or the ratio is not finite.
    pub fn distance_ratio(price: f64, fast: f64) -> Option<f64> {
        if fast == 0.0 {
            return None;
        }
        let ratio = (price - fast).abs() / fast;
        ratio.is_finite().then_some(ratio)
    }

    /// Evaluate the raw signal for a bar close
    pub fn evaluate(&self, price: f64, trend: &TrendReference, bar_index: u64) -> Signal {
        let distance_ratio = Self::distance_ratio(price, trend.fast);

        let kind = match distance_ratio {
            Some(ratio) if ratio >= self.config.ejection_trigger => {
                if price > trend.fast {
                    SignalKind::Long
                } else if price < trend.fast {
                    SignalKind::Short
                } else {
                    SignalKind::None
                }
            }
            _ => SignalKind::None,
        };

        Signal {
            kind,
            trigger_price: price,
            bar_index,
            distance_ratio,
            trend: Trend::from_reference(trend),
        }
    }

    /// Direction to enter for this signal, after the trend filter
    pub fn entry_direction(&self, signal: &Signal) -> Option<Direction> {
        let direction = signal.kind.direction()?;
        if !self.config.use_trend_filter {
            return Some(direction);
        }
        match (direction, signal.trend) {
            (Direction::Long, Trend::Up) | (Direction::Short, Trend::Down) => Some(direction),
            _ => None,
        }
    }
}
