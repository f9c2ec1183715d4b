//! Trading Core - broker-agnostic per-bar evaluation
//!
//! This module contains the pure strategy components:
//! - Bar and trend-reference inputs
//! - Ejection signal generation with trend filter
//! - Time-of-day trading window, hour filter and close-all rule
//! - SMA trend-reference provider for replay

pub mod bars;
pub mod signals;
pub mod trading_window;
pub mod trend;

// Re-export commonly used types
pub use bars::{Bar, TrendReference};
pub use signals::{Direction, Signal, SignalConfig, SignalGenerator, SignalKind, Trend};
pub use trading_window::{parse_excluded_hours, CloseAllMode, CloseAllRule, TradingWindow};
pub use trend::SmaTrend;
