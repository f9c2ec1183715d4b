//! Protective stop and target levels
//!
//! All offsets are in ticks. The primary stop becomes the position's risk
//! baseline; grid legs express their stop as a tick distance back to that
//! baseline so the whole position exits at one price.

use tracing::warn;

use crate::trading_core::Direction;

use super::config::StrategyConfig;

/// Absorbs float noise such as 239.99999999 ticks before truncation
const TICK_EPSILON: f64 = 1e-9;

/// Absolute protective prices for one filled order
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtectiveLevels {
    pub stop: f64,
    pub target: f64,
}

#[derive(Debug, Clone)]
pub struct RiskCalculator {
    tick_size: f64,
    stop_ticks: f64,
    target_ticks: f64,
}

impl RiskCalculator {
    pub fn new(tick_size: f64, stop_ticks: f64, target_ticks: f64) -> Self {
        Self {
            tick_size,
            stop_ticks,
            target_ticks,
        }
    }

    pub fn from_config(config: &StrategyConfig) -> Self {
        Self::new(config.tick_size, config.stop_loss_ticks, config.take_profit_ticks)
    }

    pub fn tick_size(&self) -> f64 {
        self.tick_size
    }

    /// Stop and target for the primary fill. The stop is the risk baseline.
    pub fn primary_levels(&self, direction: Direction, entry: f64) -> ProtectiveLevels {
        let stop_offset = self.stop_ticks * self.tick_size;
        let target_offset = self.target_ticks * self.tick_size;
        match direction {
            Direction::Long => ProtectiveLevels {
                stop: entry - stop_offset,
                target: entry + target_offset,
            },
            Direction::Short => ProtectiveLevels {
                stop: entry + stop_offset,
                target: entry - target_offset,
            },
        }
    }

    /// Whole ticks between a leg fill and the baseline, truncated toward zero.
    ///
    /// Truncation is kept deliberately; the resulting stop sits at most one
    /// tick inside the baseline.
    pub fn leg_stop_ticks(&self, direction: Direction, leg_fill: f64, baseline: f64) -> i64 {
        let distance = match direction {
            Direction::Long => (leg_fill - baseline) / self.tick_size,
            Direction::Short => (baseline - leg_fill) / self.tick_size,
        };
        (distance + TICK_EPSILON.copysign(distance)).trunc() as i64
    }

    /// Round onto the tick grid, toward the leg fill. A stop never moves
    /// past the baseline and a target never moves further away.
    fn snap_toward_fill(&self, price: f64, below_fill: bool) -> f64 {
        let ticks = price / self.tick_size;
        let snapped = if below_fill {
            (ticks - TICK_EPSILON).ceil()
        } else {
            (ticks + TICK_EPSILON).floor()
        };
        snapped * self.tick_size
    }

    /// Stop and target for a grid leg fill, both on the tick grid even when
    /// the fill is not
    pub fn leg_levels(&self, direction: Direction, leg_fill: f64, baseline: f64) -> ProtectiveLevels {
        let ticks = self.leg_stop_ticks(direction, leg_fill, baseline);
        let raw_target = self.primary_levels(direction, leg_fill).target;
        let target = self.snap_toward_fill(raw_target, direction == Direction::Short);

        if ticks <= 0 {
            warn!(
                "Grid leg filled at {:.2}, at or beyond risk baseline {:.2}; stop placed at baseline",
                leg_fill, baseline
            );
            return ProtectiveLevels { stop: baseline, target };
        }

        let offset = ticks as f64 * self.tick_size;
        let stop = match direction {
            Direction::Long => leg_fill - offset,
            Direction::Short => leg_fill + offset,
        };
        let stop = self.snap_toward_fill(stop, direction == Direction::Long);
        ProtectiveLevels { stop, target }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_levels() {
        let risk = RiskCalculator::new(0.25, 300.0, 500.0);

        let long = risk.primary_levels(Direction::Long, 20000.0);
        assert_eq!(long.stop, 19925.0);
        assert_eq!(long.target, 20125.0);

        let short = risk.primary_levels(Direction::Short, 20000.0);
        assert_eq!(short.stop, 20075.0);
        assert_eq!(short.target, 19875.0);
    }

    #[test]
    fn test_leg_stop_shares_baseline() {
        let risk = RiskCalculator::new(1.0, 300.0, 500.0);
        let baseline = risk.primary_levels(Direction::Long, 20000.0).stop;
        assert_eq!(baseline, 19700.0);

        for leg_fill in [19940.0, 19880.0] {
            let levels = risk.leg_levels(Direction::Long, leg_fill, baseline);
            assert_eq!(levels.stop, baseline);
            assert_eq!(levels.target, leg_fill + 500.0);
        }

        assert_eq!(risk.leg_stop_ticks(Direction::Long, 19940.0, baseline), 240);
    }

    #[test]
    fn test_leg_stop_truncates() {
        let risk = RiskCalculator::new(0.25, 300.0, 500.0);

        // 10.1 points = 40.4 ticks, truncated to 40
        assert_eq!(risk.leg_stop_ticks(Direction::Long, 100.1, 90.0), 40);
        assert_eq!(risk.leg_stop_ticks(Direction::Short, 89.9, 100.0), 40);
    }

    #[test]
    fn test_off_grid_leg_fill_snaps_to_ticks() {
        let risk = RiskCalculator::new(0.25, 300.0, 500.0);

        // 100.1 - 40 ticks = 90.1, rounded up toward the fill
        let long = risk.leg_levels(Direction::Long, 100.1, 90.0);
        assert_eq!(long.stop, 90.25);
        assert_eq!(long.target, 225.0);

        // 199.9 + 40 ticks = 209.9, rounded down toward the fill
        let short = risk.leg_levels(Direction::Short, 199.9, 210.0);
        assert_eq!(short.stop, 209.75);
        assert_eq!(short.target, 75.0);
    }

    #[test]
    fn test_all_legs_within_one_tick_of_baseline() {
        let risk = RiskCalculator::new(0.25, 300.0, 500.0);

        for direction in [Direction::Long, Direction::Short] {
            let baseline = risk.primary_levels(direction, 20000.0).stop;
            for step in 1..200 {
                // Odd offsets, including ones that do not land on the tick grid
                let offset = step as f64 * 0.37;
                let leg_fill = match direction {
                    Direction::Long => 20000.0 - offset,
                    Direction::Short => 20000.0 + offset,
                };
                let levels = risk.leg_levels(direction, leg_fill, baseline);
                assert!(
                    (levels.stop - baseline).abs() < risk.tick_size() + 1e-9,
                    "{direction} leg at {leg_fill}: stop {} vs baseline {baseline}",
                    levels.stop
                );
                let on_grid = (levels.stop / risk.tick_size()).round() * risk.tick_size();
                assert!((levels.stop - on_grid).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_leg_beyond_baseline_uses_baseline() {
        let risk = RiskCalculator::new(1.0, 300.0, 500.0);
        let levels = risk.leg_levels(Direction::Long, 19650.0, 19700.0);
        assert_eq!(levels.stop, 19700.0);
        assert_eq!(levels.target, 20150.0);
    }
}
