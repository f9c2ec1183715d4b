//! Rolling SMA trend-reference provider used by the replay and demo harness.
//! Live deployments feed their own fast/slow values.

use std::collections::VecDeque;

use super::bars::TrendReference;

/// Simple moving average over a fixed window
#[derive(Debug, Clone)]
struct RollingMean {
    period: usize,
    window: VecDeque<f64>,
    sum: f64,
}

impl RollingMean {
    fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            window: VecDeque::with_capacity(period.max(1)),
            sum: 0.0,
        }
    }

    fn push(&mut self, value: f64) -> f64 {
        self.window.push_back(value);
        self.sum += value;
        if self.window.len() > self.period {
            if let Some(old) = self.window.pop_front() {
                self.sum -= old;
            }
        }
        self.sum / self.window.len() as f64
    }
}

/// Fast/slow SMA pair over bar closes
#[derive(Debug, Clone)]
pub struct SmaTrend {
    fast: RollingMean,
    slow: RollingMean,
}

impl SmaTrend {
    pub fn new(fast_period: usize, slow_period: usize) -> Self {
        Self {
            fast: RollingMean::new(fast_period),
            slow: RollingMean::new(slow_period),
        }
    }

    /// Push a close and return the references for that bar.
    ///
    /// Values are partial averages until the windows fill; the controller's
    /// warm-up gate keeps them from being traded.
    pub fn update(&mut self, close: f64) -> TrendReference {
        TrendReference {
            fast: self.fast.push(close),
            slow: self.slow.push(close),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sma_pair() {
        let mut trend = SmaTrend::new(2, 4);

        trend.update(10.0);
        trend.update(20.0);
        let r = trend.update(30.0);
        assert_eq!(r.fast, 25.0);
        assert_eq!(r.slow, 20.0);

        let r = trend.update(40.0);
        let r2 = trend.update(50.0);
        assert_eq!(r.slow, 25.0);
        assert_eq!(r2.fast, 45.0);
        assert_eq!(r2.slow, 35.0);
    }
}
