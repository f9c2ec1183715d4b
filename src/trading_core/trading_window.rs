//! Time-of-day trading gates
//!
//! All checks work at minute granularity on the exchange-local time of day.

use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How the close-all time is matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseAllMode {
    /// Fire only on the configured hh:mm
    #[default]
    ExactMinute,
    /// Fire from the configured hh:mm until midnight
    AtOrAfter,
}

/// Close-all rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseAllRule {
    pub hour: u32,
    pub minute: u32,
    pub mode: CloseAllMode,
}

/// Trading window with optional hour exclusions and close-all time
#[derive(Debug, Clone)]
pub struct TradingWindow {
    start_minute_of_day: u32,
    end_minute_of_day: u32,
    excluded_hours: Option<BTreeSet<u32>>,
    close_all: Option<CloseAllRule>,
}

fn minute_of_day(time: NaiveTime) -> u32 {
    time.hour() * 60 + time.minute()
}

impl TradingWindow {
    /// Create a window from start/end hh:mm (both inclusive)
    pub fn new(start_hour: u32, start_minute: u32, end_hour: u32, end_minute: u32) -> Self {
        Self {
            start_minute_of_day: start_hour * 60 + start_minute,
            end_minute_of_day: end_hour * 60 + end_minute,
            excluded_hours: None,
            close_all: None,
        }
    }

    /// Enable the hour filter
    pub fn with_excluded_hours(mut self, hours: BTreeSet<u32>) -> Self {
        self.excluded_hours = Some(hours);
        self
    }

    /// Enable the close-all rule
    pub fn with_close_all(mut self, rule: CloseAllRule) -> Self {
        self.close_all = Some(rule);
        self
    }

    /// Window containment. `end < start` wraps midnight.
    pub fn contains(&self, time: NaiveTime) -> bool {
        let current = minute_of_day(time);
        let (start, end) = (self.start_minute_of_day, self.end_minute_of_day);

        if end < start {
            current >= start || current <= end
        } else {
            current >= start && current <= end
        }
    }

    /// Hour filter, independent of window containment
    pub fn is_hour_excluded(&self, time: NaiveTime) -> bool {
        self.excluded_hours
            .as_ref()
            .is_some_and(|hours| hours.contains(&time.hour()))
    }

    /// True when a new entry may be opened at this time
    pub fn allows_entry(&self, time: NaiveTime) -> bool {
        self.contains(time) && !self.is_hour_excluded(time)
    }

    /// True when the close-all rule fires at this time
    pub fn is_close_time(&self, time: NaiveTime) -> bool {
        let Some(rule) = self.close_all else {
            return false;
        };
        let current = minute_of_day(time);
        let close_at = rule.hour * 60 + rule.minute;
        match rule.mode {
            CloseAllMode::ExactMinute => current == close_at,
            CloseAllMode::AtOrAfter => current >= close_at,
        }
    }

    pub fn excluded_hours(&self) -> Option<&BTreeSet<u32>> {
        self.excluded_hours.as_ref()
    }
}

/// Parse a comma-separated hour list ("1,2,3,9").
///
/// Tokens that do not parse or fall outside 0-23 are dropped.
pub fn parse_excluded_hours(raw: &str) -> BTreeSet<u32> {
    raw.split(',')
        .filter_map(|token| token.trim().parse::<u32>().ok())
        .filter(|hour| *hour <= 23)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(hour: u32, minute: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, minute, 0).unwrap()
    }

    #[test]
    fn test_overnight_window() {
        let window = TradingWindow::new(22, 0, 2, 0);

        assert!(window.contains(t(23, 30)));
        assert!(window.contains(t(1, 0)));
        assert!(window.contains(t(22, 0)));
        assert!(window.contains(t(2, 0)));
        assert!(!window.contains(t(10, 0)));
        assert!(!window.contains(t(2, 1)));
    }

    #[test]
    fn test_day_window_inclusive() {
        let window = TradingWindow::new(9, 30, 11, 0);

        assert!(!window.contains(t(9, 29)));
        assert!(window.contains(t(9, 30)));
        assert!(window.contains(t(11, 0)));
        assert!(!window.contains(t(11, 1)));
    }

    #[test]
    fn test_excluded_hours_narrow_window() {
        let window = TradingWindow::new(0, 0, 22, 59)
            .with_excluded_hours(parse_excluded_hours("1,2,3,9,11,14,20"));

        assert!(window.allows_entry(t(10, 15)));
        assert!(!window.allows_entry(t(9, 15)));
        assert!(!window.allows_entry(t(14, 59)));
        // Outside the window regardless of the filter
        assert!(!window.allows_entry(t(23, 10)));
    }

    #[test]
    fn test_parse_excluded_hours_drops_bad_tokens() {
        let hours = parse_excluded_hours(" 1, x,24, 9 ,,-3,23");
        assert_eq!(hours.into_iter().collect::<Vec<_>>(), vec![1, 9, 23]);
        assert!(parse_excluded_hours("").is_empty());
    }

    #[test]
    fn test_close_all_modes() {
        let exact = TradingWindow::new(0, 0, 23, 59).with_close_all(CloseAllRule {
            hour: 22,
            minute: 0,
            mode: CloseAllMode::ExactMinute,
        });
        assert!(exact.is_close_time(t(22, 0)));
        assert!(!exact.is_close_time(t(22, 1)));
        assert!(!exact.is_close_time(t(21, 59)));

        let after = TradingWindow::new(0, 0, 23, 59).with_close_all(CloseAllRule {
            hour: 22,
            minute: 0,
            mode: CloseAllMode::AtOrAfter,
        });
        assert!(after.is_close_time(t(22, 1)));
        assert!(after.is_close_time(t(23, 59)));
        assert!(!after.is_close_time(t(21, 59)));

        // No rule configured
        assert!(!TradingWindow::new(0, 0, 23, 59).is_close_time(t(22, 0)));
    }
}
