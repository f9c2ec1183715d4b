//! Strategy configuration

use anyhow::{Context, Result};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::trading_core::{
    parse_excluded_hours, CloseAllMode, CloseAllRule, SignalConfig, TradingWindow,
};

/// Configuration validation failures
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be a positive integer (got {value})")]
    InvalidPeriod { name: &'static str, value: usize },

    #[error("{name} must be positive (got {value})")]
    NonPositive { name: &'static str, value: f64 },

    #[error("ejection_trigger must be in (0, 1] (got {0})")]
    TriggerOutOfRange(f64),

    #[error("{name} must be within 0-23 (got {value})")]
    HourOutOfRange { name: &'static str, value: u32 },

    #[error("{name} must be within 0-59 (got {value})")]
    MinuteOutOfRange { name: &'static str, value: u32 },

    #[error("quantity must be at least 1")]
    ZeroQuantity,

    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),

    #[error("activation_delay_secs must be at most 86400 (got {0})")]
    ActivationDelayTooLong(u64),
}

/// One day
pub const MAX_ACTIVATION_DELAY_SECS: u64 = 86_400;

/// Immutable strategy configuration, loaded once per session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Instrument to trade (e.g., "NQ")
    pub instrument: String,

    /// Contracts per primary entry and per grid leg
    pub quantity: u32,

    /// Minimum price increment (NQ = 0.25)
    pub tick_size: f64,

    /// Timezone used for all time-of-day checks
    pub timezone: String,

    /// Fast trend reference period (bars)
    pub fast_period: usize,

    /// Slow trend reference period (bars)
    pub slow_period: usize,

    /// Take profit distance in ticks
    pub take_profit_ticks: f64,

    /// Stop loss distance in ticks
    pub stop_loss_ticks: f64,

    /// Minimum fractional distance from the fast reference (0.001 = 0.1%)
    pub ejection_trigger: f64,

    pub use_trend_filter: bool,
    pub allow_long: bool,
    pub allow_short: bool,

    /// Trading hours: start hour
    pub start_hour: u32,

    /// Trading hours: start minute
    pub start_minute: u32,

    /// Trading hours: end hour (inclusive, may be before start for overnight)
    pub end_hour: u32,

    /// Trading hours: end minute
    pub end_minute: u32,

    /// Scale in with limit orders after the primary fill
    pub use_grid_entry: bool,

    /// Grid spacing in ticks
    pub grid_step_ticks: f64,

    /// Number of grid legs
    pub grid_steps: u32,

    pub use_close_all_at_time: bool,
    pub close_all_hour: u32,
    pub close_all_minute: u32,
    pub close_all_mode: CloseAllMode,

    pub use_hour_filter: bool,

    /// Comma-separated hours (0-23) where no entries are taken
    pub excluded_hours: String,

    /// Seconds after session start before entries are allowed
    pub activation_delay_secs: u64,

    /// Timer-driven reconciliation cadence
    pub reconcile_interval_secs: u64,

    /// Reconcile against the broker before evaluating each bar
    pub reconcile_before_bar: bool,

    /// Reconcile passes an entry may stay unfilled before the broker
    /// position decides it
    pub entry_grace_passes: u32,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            instrument: "NQ".to_string(),
            quantity: 1,
            tick_size: 0.25,
            timezone: "America/New_York".to_string(),
            fast_period: 100,
            slow_period: 200,
            take_profit_ticks: 500.0,
            stop_loss_ticks: 300.0,
            ejection_trigger: 0.001, // 0.1%
            use_trend_filter: true,
            allow_long: true,
            allow_short: true,
            start_hour: 0,
            start_minute: 0,
            end_hour: 22,
            end_minute: 59,
            use_grid_entry: false,
            grid_step_ticks: 60.0,
            grid_steps: 1,
            use_close_all_at_time: false,
            close_all_hour: 22,
            close_all_minute: 0,
            close_all_mode: CloseAllMode::ExactMinute,
            use_hour_filter: false,
            excluded_hours: "1,2,3,9,11,14,20".to_string(),
            activation_delay_secs: 60,
            reconcile_interval_secs: 5,
            reconcile_before_bar: true,
            entry_grace_passes: 1,
        }
    }
}

impl StrategyConfig {
    /// Load from a JSON file; missing fields take defaults
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field against its valid range
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        for (name, value) in [("fast_period", self.fast_period), ("slow_period", self.slow_period)] {
            if value == 0 {
                return Err(ConfigError::InvalidPeriod { name, value });
            }
        }

        for (name, value) in [
            ("tick_size", self.tick_size),
            ("take_profit_ticks", self.take_profit_ticks),
            ("stop_loss_ticks", self.stop_loss_ticks),
        ] {
            if !(value > 0.0) {
                return Err(ConfigError::NonPositive { name, value });
            }
        }

        // Zero disables the grid, negative is nonsense
        if self.grid_step_ticks < 0.0 || self.grid_step_ticks.is_nan() {
            return Err(ConfigError::NonPositive {
                name: "grid_step_ticks",
                value: self.grid_step_ticks,
            });
        }

        if !(self.ejection_trigger > 0.0 && self.ejection_trigger <= 1.0) {
            return Err(ConfigError::TriggerOutOfRange(self.ejection_trigger));
        }

        if self.quantity == 0 {
            return Err(ConfigError::ZeroQuantity);
        }

        for (name, value) in [
            ("start_hour", self.start_hour),
            ("end_hour", self.end_hour),
            ("close_all_hour", self.close_all_hour),
        ] {
            if value > 23 {
                return Err(ConfigError::HourOutOfRange { name, value });
            }
        }

        for (name, value) in [
            ("start_minute", self.start_minute),
            ("end_minute", self.end_minute),
            ("close_all_minute", self.close_all_minute),
        ] {
            if value > 59 {
                return Err(ConfigError::MinuteOutOfRange { name, value });
            }
        }

        if self.activation_delay_secs > MAX_ACTIVATION_DELAY_SECS {
            return Err(ConfigError::ActivationDelayTooLong(self.activation_delay_secs));
        }

        self.tz()?;
        Ok(())
    }

    /// Parsed timezone
    pub fn tz(&self) -> std::result::Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::UnknownTimezone(self.timezone.clone()))
    }

    /// Bars required before the trend references are trusted
    pub fn warmup_bars(&self) -> u64 {
        self.fast_period.max(self.slow_period) as u64
    }

    pub fn signal_config(&self) -> SignalConfig {
        SignalConfig {
            ejection_trigger: self.ejection_trigger,
            use_trend_filter: self.use_trend_filter,
        }
    }

    /// Build the time-of-day gates
    pub fn trading_window(&self) -> TradingWindow {
        let mut window = TradingWindow::new(
            self.start_hour,
            self.start_minute,
            self.end_hour,
            self.end_minute,
        );
        if self.use_hour_filter {
            window = window.with_excluded_hours(parse_excluded_hours(&self.excluded_hours));
        }
        if self.use_close_all_at_time {
            window = window.with_close_all(CloseAllRule {
                hour: self.close_all_hour,
                minute: self.close_all_minute,
                mode: self.close_all_mode,
            });
        }
        window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StrategyConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.warmup_bars(), 200);
        assert_eq!(config.tz().unwrap(), chrono_tz::America::New_York);
    }

    #[test]
    fn test_range_validation() {
        let config = StrategyConfig {
            ejection_trigger: 0.0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::TriggerOutOfRange(0.0)));

        let config = StrategyConfig {
            end_hour: 24,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::HourOutOfRange { name: "end_hour", value: 24 })
        );

        let config = StrategyConfig {
            slow_period: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPeriod { .. })));

        let config = StrategyConfig {
            timezone: "Mars/Olympus".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::UnknownTimezone(_))));

        let config = StrategyConfig {
            activation_delay_secs: u64::MAX,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ActivationDelayTooLong(u64::MAX))
        );
        let config = StrategyConfig {
            activation_delay_secs: MAX_ACTIVATION_DELAY_SECS,
            ..Default::default()
        };
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_zero_grid_step_is_allowed() {
        let config = StrategyConfig {
            use_grid_entry: true,
            grid_step_ticks: 0.0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: StrategyConfig = serde_json::from_str(
            r#"{ "instrument": "MNQ", "use_grid_entry": true, "grid_steps": 3, "close_all_mode": "at_or_after" }"#,
        )
        .unwrap();

        assert_eq!(config.instrument, "MNQ");
        assert_eq!(config.grid_steps, 3);
        assert_eq!(config.close_all_mode, CloseAllMode::AtOrAfter);
        assert_eq!(config.fast_period, 100);
        assert_eq!(config.stop_loss_ticks, 300.0);
    }

    #[test]
    fn test_hour_filter_only_when_enabled() {
        let config = StrategyConfig::default();
        assert!(config.trading_window().excluded_hours().is_none());

        let config = StrategyConfig {
            use_hour_filter: true,
            excluded_hours: "9, 11, bogus".to_string(),
            ..Default::default()
        };
        let window = config.trading_window();
        let hours = window.excluded_hours().unwrap();
        assert!(hours.contains(&9) && hours.contains(&11));
        assert_eq!(hours.len(), 2);
    }
}
