//! Bar replay against the simulated broker

use anyhow::{bail, Result};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::execution::{
    BrokerPosition, EngineEvent, SessionRunner, SessionStats, SimulatedBroker, StrategyConfig,
};
use crate::trading_core::{Bar, SmaTrend};

/// Replay outcome
#[derive(Debug, Clone)]
pub struct ReplaySummary {
    pub session_id: Uuid,
    pub bars: usize,
    pub live_bars: usize,
    pub stats: SessionStats,
    pub reconcile_passes: u64,
    pub corrections: u64,
    /// Broker position left after shutdown
    pub final_position: BrokerPosition,
}

impl ReplaySummary {
    pub fn summary(&self) -> String {
        format!(
            "Bars: {} ({} live) | {} | Reconcile: {} passes, {} corrections | Final: {} x{}",
            self.bars,
            self.live_bars,
            self.stats.summary(),
            self.reconcile_passes,
            self.corrections,
            self.final_position.position,
            self.final_position.quantity
        )
    }
}

/// Drive a full session over `bars`.
///
/// Each bar first moves the simulated market (resting orders fill against
/// its range), then closes through the session loop with fresh SMA
/// references. The session arms at the first live bar.
pub async fn run_replay(config: StrategyConfig, bars: &[Bar]) -> Result<ReplaySummary> {
    let Some(first) = bars.first() else {
        bail!("No bars to replay");
    };

    let (broker, notifications) = SimulatedBroker::new(&config.instrument);
    let broker = Arc::new(broker);
    broker.set_mark(first.open);

    let mut trend = SmaTrend::new(config.fast_period, config.slow_period);
    let mut runner = SessionRunner::new(config, broker.clone(), notifications)?;

    let armed_from = bars
        .iter()
        .find(|bar| !bar.is_historical)
        .map(|bar| bar.timestamp)
        .unwrap_or(first.timestamp);
    runner.initialize(armed_from).await;

    info!("Replaying {} bars from {}", bars.len(), first.timestamp);

    for bar in bars {
        broker.on_bar(bar);
        runner.pump_notifications().await;

        let reference = trend.update(bar.close);
        runner
            .handle_event(EngineEvent::BarClosed {
                bar: bar.clone(),
                trend: reference,
            })
            .await;
    }

    let stats = runner.shutdown().await;

    Ok(ReplaySummary {
        session_id: runner.session_id(),
        bars: bars.len(),
        live_bars: bars.iter().filter(|bar| !bar.is_historical).count(),
        stats,
        reconcile_passes: runner.reconciler().passes(),
        corrections: runner.reconciler().corrections(),
        final_position: broker.position(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    use crate::feed::synthetic_bars;

    #[tokio::test]
    async fn test_replay_synthetic_session() {
        let config = StrategyConfig {
            timezone: "UTC".to_string(),
            fast_period: 10,
            slow_period: 20,
            activation_delay_secs: 0,
            use_trend_filter: false,
            use_grid_entry: true,
            grid_steps: 2,
            grid_step_ticks: 20.0,
            take_profit_ticks: 80.0,
            stop_loss_ticks: 60.0,
            ..Default::default()
        };
        let start = Utc.with_ymd_and_hms(2025, 3, 3, 10, 0, 0).unwrap();
        let bars = synthetic_bars(42, 400, 20000.0, start, 60);

        let summary = run_replay(config, &bars).await.unwrap();
        assert_eq!(summary.bars, 400);
        assert!(summary.stats.signals > 0);
        assert!(summary.stats.entries > 0);
        // Market entries always fill here, so every primary and leg fill is protected
        assert_eq!(
            summary.stats.protective_attached,
            summary.stats.entries + summary.stats.grid_fills
        );
        assert_eq!(summary.stats.ghost_corrections, 0);
    }

    #[tokio::test]
    async fn test_empty_replay_fails() {
        assert!(run_replay(StrategyConfig::default(), &[]).await.is_err());
    }
}
