//! Serialized per-instrument event loop
//!
//! One task owns the controller and the reconciler. Bars, broker
//! notifications, reconcile ticks and control requests are applied one at a
//! time, so no two transitions ever race. Reconciliation runs first whenever
//! it is due.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::trading_core::{Bar, TrendReference};

use super::broker::{BrokerAdapter, BrokerNotification};
use super::config::StrategyConfig;
use super::engine::OrderLifecycleController;
use super::order::{BrokerCommand, OrderKind};
use super::position::SessionStats;
use super::reconciler::{PositionReconciler, ReconcileReport};

/// Inputs to the session loop
#[derive(Debug, Clone)]
pub enum EngineEvent {
    BarClosed { bar: Bar, trend: TrendReference },
    Broker(BrokerNotification),
    Reconcile,
    ExitRequested { reason: String },
    Shutdown,
}

enum Wake {
    Tick,
    Notification(Option<BrokerNotification>),
    Event(Option<EngineEvent>),
}

pub struct SessionRunner<B: BrokerAdapter + ?Sized> {
    session_id: Uuid,
    controller: OrderLifecycleController,
    reconciler: PositionReconciler,
    broker: Arc<B>,
    notifications: mpsc::UnboundedReceiver<BrokerNotification>,
    reconcile_before_bar: bool,
    reconcile_interval: Duration,
    last_report: Option<ReconcileReport>,
}

impl<B: BrokerAdapter + ?Sized> SessionRunner<B> {
    pub fn new(
        config: StrategyConfig,
        broker: Arc<B>,
        notifications: mpsc::UnboundedReceiver<BrokerNotification>,
    ) -> Result<Self> {
        let reconciler =
            PositionReconciler::new(&config.instrument).with_entry_grace(config.entry_grace_passes);
        let reconcile_before_bar = config.reconcile_before_bar;
        let reconcile_interval = Duration::from_secs(config.reconcile_interval_secs.max(1));
        let controller = OrderLifecycleController::new(config)?;

        Ok(Self {
            session_id: Uuid::new_v4(),
            controller,
            reconciler,
            broker,
            notifications,
            reconcile_before_bar,
            reconcile_interval,
            last_report: None,
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn controller(&self) -> &OrderLifecycleController {
        &self.controller
    }

    pub fn reconciler(&self) -> &PositionReconciler {
        &self.reconciler
    }

    pub fn last_report(&self) -> Option<&ReconcileReport> {
        self.last_report.as_ref()
    }

    /// Startup: clear stale broker orders, converge on the broker position,
    /// then arm the controller
    pub async fn initialize(&mut self, now: DateTime<Utc>) {
        info!(
            "Session {} starting for {}",
            self.session_id,
            self.reconciler.instrument()
        );

        if let Err(e) = self
            .reconciler
            .cancel_working_orders(self.broker.as_ref(), "startup")
            .await
        {
            warn!("Startup order cleanup failed: {}", e);
        }
        self.reconcile().await;
        self.controller.initialize(now);
    }

    /// Apply one event. Returns false once the session should stop.
    pub async fn handle_event(&mut self, event: EngineEvent) -> bool {
        match event {
            EngineEvent::BarClosed { bar, trend } => {
                self.pump_notifications().await;
                if self.reconcile_before_bar && !bar.is_historical {
                    self.reconcile().await;
                }
                let commands = self.controller.on_bar(&bar, trend);
                self.dispatch(commands).await;
            }
            EngineEvent::Broker(notification) => {
                let commands = self.controller.on_notification(notification);
                self.dispatch(commands).await;
            }
            EngineEvent::Reconcile => {
                self.reconcile().await;
            }
            EngineEvent::ExitRequested { reason } => {
                let commands = self.controller.request_exit(&reason);
                self.dispatch(commands).await;
            }
            EngineEvent::Shutdown => return false,
        }
        true
    }

    /// Drain notifications that are already queued
    pub async fn pump_notifications(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(notification) = self.notifications.try_recv() {
            let commands = self.controller.on_notification(notification);
            self.dispatch(commands).await;
            handled += 1;
        }
        handled
    }

    /// One reconciliation pass; corrections are dispatched immediately.
    /// Updates already queued are applied first so the comparison sees them.
    pub async fn reconcile(&mut self) {
        self.pump_notifications().await;
        match self
            .reconciler
            .reconcile_with(&mut self.controller, self.broker.as_ref())
            .await
        {
            Ok(report) => {
                self.dispatch(report.commands.clone()).await;
                self.last_report = Some(report);
            }
            Err(e) => warn!("Reconciliation failed: {}", e),
        }
    }

    /// Fire-and-forget dispatch. A submission that fails at the call boundary
    /// is fed back as a rejection.
    async fn dispatch(&mut self, commands: Vec<BrokerCommand>) {
        let mut queue: VecDeque<BrokerCommand> = commands.into();

        while let Some(command) = queue.pop_front() {
            match command {
                BrokerCommand::Submit(request) => {
                    let direction = request.side.direction();
                    let submitted = match (request.kind, request.oco) {
                        (OrderKind::Market, None) => {
                            self.broker
                                .submit_market_order(direction, request.quantity, request.tag)
                                .await
                        }
                        (OrderKind::Limit { price }, None) => {
                            self.broker
                                .submit_limit_order(direction, request.quantity, price, request.tag)
                                .await
                        }
                        _ => self.broker.submit_order(&request).await,
                    };
                    if let Err(e) = submitted {
                        warn!("Submit {} failed: {}", request.tag, e);
                        let rejection = BrokerNotification::rejected(request.tag, e.to_string());
                        queue.extend(self.controller.on_notification(rejection));
                    }
                }
                BrokerCommand::Cancel { order_id } => {
                    if let Err(e) = self.broker.cancel_order(&order_id).await {
                        warn!("Cancel {} failed: {}", order_id, e);
                    }
                }
                BrokerCommand::Exit { tag, direction } => {
                    if let Err(e) = self.broker.exit_position(direction, tag).await {
                        warn!("Exit {} ({}) failed: {}", tag, direction, e);
                    }
                }
            }
        }
    }

    /// Run until `Shutdown` or the event channel closes
    pub async fn run(mut self, mut events: mpsc::Receiver<EngineEvent>) -> SessionStats {
        let mut ticker = interval(self.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut notifications_open = true;

        loop {
            let wake = tokio::select! {
                biased;
                _ = ticker.tick() => Wake::Tick,
                notification = self.notifications.recv(), if notifications_open => {
                    Wake::Notification(notification)
                }
                event = events.recv() => Wake::Event(event),
            };

            match wake {
                Wake::Tick => self.reconcile().await,
                Wake::Notification(Some(notification)) => {
                    let commands = self.controller.on_notification(notification);
                    self.dispatch(commands).await;
                }
                Wake::Notification(None) => {
                    warn!("Broker notification channel closed");
                    notifications_open = false;
                }
                Wake::Event(Some(event)) => {
                    if !self.handle_event(event).await {
                        break;
                    }
                }
                Wake::Event(None) => {
                    debug!("Event channel closed");
                    break;
                }
            }
        }

        self.shutdown().await
    }

    /// Cancel everything still working at the broker and return the counters
    pub async fn shutdown(&mut self) -> SessionStats {
        self.pump_notifications().await;

        if let Err(e) = self
            .reconciler
            .cancel_working_orders(self.broker.as_ref(), "shutdown")
            .await
        {
            warn!("Shutdown order cleanup failed: {}", e);
        }
        self.pump_notifications().await;

        let stats = self.controller.shutdown();
        info!(
            "Session {} finished | {} reconcile passes, {} corrections",
            self.session_id,
            self.reconciler.passes(),
            self.reconciler.corrections()
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    use crate::execution::simulated::SimulatedBroker;

    fn config() -> StrategyConfig {
        StrategyConfig {
            timezone: "UTC".to_string(),
            fast_period: 2,
            slow_period: 3,
            tick_size: 1.0,
            activation_delay_secs: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let (broker, notifications) = SimulatedBroker::new("NQ");
        let broker = Arc::new(broker);
        broker.set_mark(20030.0);

        let mut runner = SessionRunner::new(config(), broker.clone(), notifications).unwrap();
        let start = Utc.with_ymd_and_hms(2025, 3, 3, 10, 0, 0).unwrap();
        runner.initialize(start).await;

        let (tx, rx) = mpsc::channel(16);
        for index in 0..6 {
            let time = start + TimeDelta::minutes(index as i64);
            tx.send(EngineEvent::BarClosed {
                bar: Bar::live(index, time, 20030.0, 20030.0, 20030.0, 20030.0),
                trend: TrendReference::new(20000.0, 19990.0),
            })
            .await
            .unwrap();
        }
        tx.send(EngineEvent::Shutdown).await.unwrap();

        let stats = runner.run(rx).await;
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.protective_attached, 1);
        assert_eq!(broker.resting_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_submission_becomes_rejection() {
        // No mark price, so the market entry fails at the call boundary
        let (broker, notifications) = SimulatedBroker::new("NQ");
        let broker = Arc::new(broker);

        let mut runner = SessionRunner::new(config(), broker.clone(), notifications).unwrap();
        let start = Utc.with_ymd_and_hms(2025, 3, 3, 10, 0, 0).unwrap();
        runner.initialize(start).await;

        runner
            .handle_event(EngineEvent::BarClosed {
                bar: Bar::live(5, start, 20030.0, 20030.0, 20030.0, 20030.0),
                trend: TrendReference::new(20000.0, 19990.0),
            })
            .await;

        assert_eq!(runner.controller().state(), crate::execution::LifecycleState::Flat);
        assert_eq!(runner.controller().stats().rejections, 1);
    }
}
