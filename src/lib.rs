// Library crate - strategy core, execution state machine and replay harness

pub mod execution;
pub mod feed;
pub mod replay;
pub mod trading_core;

// Re-export commonly used types
pub use execution::{OrderLifecycleController, PositionReconciler, SessionRunner, StrategyConfig};
pub use trading_core::{Bar, Direction, SignalGenerator, TradingWindow, TrendReference};
