//! Order lifecycle controller - the per-instrument trading state machine
//!
//! `Flat → EntryPending → PositionOpen → ExitPending → Flat`
//!
//! The controller never performs I/O. Every operation returns the broker
//! commands to dispatch; outcomes come back through `on_notification`.
//! Grid legs live inside `PositionOpen` as ladder state, not as top-level
//! states.

use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::trading_core::{
    Bar, Direction, Signal, SignalGenerator, SignalKind, TradingWindow, TrendReference,
};

use super::broker::BrokerNotification;
use super::config::StrategyConfig;
use super::grid::GridChainManager;
use super::order::{
    BrokerCommand, OrderId, OrderIdAllocator, OrderRecord, OrderRequest, OrderRole, OrderSide,
    OrderState,
};
use super::position::{PositionState, SessionStats};
use super::risk::{ProtectiveLevels, RiskCalculator};

/// Top-level lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Flat,
    EntryPending { direction: Direction, order: OrderId },
    PositionOpen { direction: Direction },
    ExitPending { direction: Direction },
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Flat => write!(f, "FLAT"),
            Self::EntryPending { direction, order } => write!(f, "ENTRY_PENDING({} {})", direction, order),
            Self::PositionOpen { direction } => write!(f, "POSITION_OPEN({})", direction),
            Self::ExitPending { direction } => write!(f, "EXIT_PENDING({})", direction),
        }
    }
}

/// Telemetry emitted by the controller. Observational only.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Raw signal, reported before the trend filter
    SignalDetected { signal: Signal },
    EntrySubmitted {
        order_id: OrderId,
        direction: Direction,
        price: f64,
    },
    GridLevelPlaced {
        order_id: OrderId,
        ladder: u64,
        level: u32,
        price: f64,
    },
    PositionOpened {
        direction: Direction,
        quantity: u32,
        entry_price: f64,
        risk_baseline: f64,
    },
    ProtectionAttached {
        parent: OrderId,
        stop: f64,
        target: f64,
    },
    LegFilled {
        order_id: OrderId,
        fill_price: f64,
        stop: f64,
    },
    ExitRequested { reason: String },
    PositionFlat { reason: String },
    GhostCorrected { reason: String },
    OrderRejected {
        order_id: OrderId,
        role: OrderRole,
        reason: Option<String>,
    },
}

pub struct OrderLifecycleController {
    config: StrategyConfig,
    tz: Tz,
    window: TradingWindow,
    signals: SignalGenerator,
    risk: RiskCalculator,
    grid: GridChainManager,
    ids: OrderIdAllocator,
    /// Non-terminal orders plus anything not yet fully processed
    orders: BTreeMap<OrderId, OrderRecord>,
    state: LifecycleState,
    position: PositionState,
    armed_at: Option<DateTime<Utc>>,
    last_bar_index: Option<u64>,
    last_close: Option<f64>,
    /// Close of the bar that submitted the pending entry
    entry_reference: Option<f64>,
    stats: SessionStats,
    event_tx: broadcast::Sender<ExecutionEvent>,
}

impl OrderLifecycleController {
    /// Create a controller from a validated configuration
    pub fn new(config: StrategyConfig) -> Result<Self> {
        config.validate()?;
        let tz = config.tz()?;
        let (event_tx, _) = broadcast::channel(1000);

        Ok(Self {
            tz,
            window: config.trading_window(),
            signals: SignalGenerator::new(config.signal_config()),
            risk: RiskCalculator::from_config(&config),
            grid: GridChainManager::from_config(&config),
            ids: OrderIdAllocator::default(),
            orders: BTreeMap::new(),
            state: LifecycleState::Flat,
            position: PositionState::default(),
            armed_at: None,
            last_bar_index: None,
            last_close: None,
            entry_reference: None,
            stats: SessionStats::default(),
            event_tx,
            config,
        })
    }

    /// Arm the session. Entries are allowed once the activation delay has
    /// passed, measured against bar time.
    pub fn initialize(&mut self, now: DateTime<Utc>) {
        let armed_at = now + TimeDelta::seconds(self.config.activation_delay_secs as i64);
        info!(
            "Session initialized for {} | entries from {}",
            self.config.instrument, armed_at
        );
        self.armed_at = Some(armed_at);
    }

    /// Subscribe to telemetry
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: ExecutionEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn position(&self) -> &PositionState {
        &self.position
    }

    pub fn grid(&self) -> &GridChainManager {
        &self.grid
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn order(&self, id: OrderId) -> Option<&OrderRecord> {
        self.orders.get(&id)
    }

    /// Tracked orders that have not reached a terminal state
    pub fn working_orders(&self) -> impl Iterator<Item = &OrderRecord> {
        self.orders.values().filter(|record| !record.is_terminal())
    }

    fn is_armed(&self, time: DateTime<Utc>) -> bool {
        self.armed_at.is_some_and(|armed_at| time >= armed_at)
    }

    fn track(&mut self, request: &OrderRequest, role: OrderRole) {
        self.orders
            .insert(request.tag, OrderRecord::submitted(request, role));
    }

    /// Per-bar cycle
    pub fn on_bar(&mut self, bar: &Bar, trend: TrendReference) -> Vec<BrokerCommand> {
        if bar.is_historical {
            return Vec::new();
        }
        if self.last_bar_index.is_some_and(|last| bar.index <= last) {
            debug!("Bar {} already processed", bar.index);
            return Vec::new();
        }
        self.last_bar_index = Some(bar.index);
        self.last_close = Some(bar.close);

        if bar.index < self.config.warmup_bars() {
            return Vec::new();
        }

        let signal = self.signals.evaluate(bar.close, &trend, bar.index);
        if signal.kind != SignalKind::None {
            self.stats.signals += 1;
            debug!(
                "Signal {:?} @ {:.2} | ratio {:?} | trend {:?}",
                signal.kind, signal.trigger_price, signal.distance_ratio, signal.trend
            );
            self.emit(ExecutionEvent::SignalDetected { signal });
        }

        let local = bar.timestamp.with_timezone(&self.tz).time();

        // Close-all preempts everything else on this bar
        if self.window.is_close_time(local) {
            return self.request_exit("close-all time");
        }

        if !self.is_armed(bar.timestamp) {
            debug!("Bar {}: waiting for activation", bar.index);
            return Vec::new();
        }

        if !self.window.allows_entry(local) {
            return Vec::new();
        }

        // EntryPending blocks exactly like an open position
        if self.state != LifecycleState::Flat || !self.position.is_flat() {
            return Vec::new();
        }

        let Some(direction) = self.signals.entry_direction(&signal) else {
            return Vec::new();
        };

        let allowed = match direction {
            Direction::Long => self.config.allow_long,
            Direction::Short => self.config.allow_short,
        };
        if !allowed {
            debug!("{} entries disabled", direction);
            return Vec::new();
        }

        self.submit_entry(direction, bar)
    }

    fn submit_entry(&mut self, direction: Direction, bar: &Bar) -> Vec<BrokerCommand> {
        let order_id = self.ids.next_id();
        let request = OrderRequest::market(order_id, OrderSide::entry(direction), self.config.quantity);
        self.track(&request, OrderRole::Primary);
        self.state = LifecycleState::EntryPending { direction, order: order_id };
        self.entry_reference = Some(bar.close);
        self.stats.entries += 1;

        info!(
            "ENTRY: {} x{} @ {:.2} (market) | bar {} | {}",
            direction, self.config.quantity, bar.close, bar.index, order_id
        );
        self.emit(ExecutionEvent::EntrySubmitted {
            order_id,
            direction,
            price: bar.close,
        });

        vec![BrokerCommand::Submit(request)]
    }

    /// Apply a broker order update. Re-delivered and unknown updates are ignored.
    pub fn on_notification(&mut self, notification: BrokerNotification) -> Vec<BrokerCommand> {
        let tag = notification.tag;
        let (role, order_price, order_quantity) = match self.orders.get(&tag) {
            None => {
                debug!("Ignoring {} for untracked order {}", notification.state, tag);
                return Vec::new();
            }
            Some(record) if record.is_terminal() => {
                debug!("Ignoring {} for {} (already {})", notification.state, tag, record.state);
                return Vec::new();
            }
            Some(record) => (record.role, record.kind.price(), record.quantity),
        };

        let commands = match notification.state {
            OrderState::Submitted => Vec::new(),
            OrderState::Working => {
                if let Some(record) = self.orders.get_mut(&tag) {
                    record.update_state(OrderState::Working);
                }
                if matches!(role, OrderRole::GridLeg { .. }) {
                    self.grid.mark_working(tag);
                }
                Vec::new()
            }
            OrderState::Filled => {
                let quantity = notification.quantity.unwrap_or(order_quantity);
                let Some(price) = notification.fill_price.or(order_price).or(self.last_close) else {
                    error!("Fill for {} carries no price; leaving it to reconciliation", tag);
                    return Vec::new();
                };
                if let Some(record) = self.orders.get_mut(&tag) {
                    record.record_fill(price);
                }
                self.on_fill(tag, role, quantity, price)
            }
            OrderState::Cancelled | OrderState::Rejected => {
                if let Some(record) = self.orders.get_mut(&tag) {
                    record.update_state(notification.state);
                }
                self.on_order_closed(tag, role, &notification)
            }
        };

        self.orders.retain(|_, record| !record.is_terminal());
        commands
    }

    fn on_fill(&mut self, tag: OrderId, role: OrderRole, quantity: u32, price: f64) -> Vec<BrokerCommand> {
        match role {
            OrderRole::Primary => self.on_primary_fill(tag, quantity, price),
            OrderRole::GridLeg { .. } => self.on_leg_fill(tag, quantity, price),
            OrderRole::ProtectiveStop { parent } | OrderRole::ProtectiveTarget { parent } => {
                self.on_protective_fill(tag, role, parent, quantity, price)
            }
            OrderRole::Exit => {
                info!("EXIT FILLED: {} x{} @ {:.2}", tag, quantity, price);
                self.stats.exits += 1;
                if self.position.reduce(quantity) {
                    return self.finish_flat("exit filled");
                }
                Vec::new()
            }
        }
    }

    fn on_primary_fill(&mut self, tag: OrderId, quantity: u32, price: f64) -> Vec<BrokerCommand> {
        match self.state {
            LifecycleState::EntryPending { direction, order } if order == tag => {
                let levels = self.risk.primary_levels(direction, price);
                self.position.open(direction, quantity, price);
                self.position.set_risk_baseline(levels.stop);
                self.state = LifecycleState::PositionOpen { direction };
                self.entry_reference = None;

                info!(
                    "FILLED: {} x{} @ {:.2} | Stop: {:.2} | Target: {:.2}",
                    direction, quantity, price, levels.stop, levels.target
                );
                self.emit(ExecutionEvent::PositionOpened {
                    direction,
                    quantity,
                    entry_price: price,
                    risk_baseline: levels.stop,
                });

                let mut commands = self.protect(tag, direction, quantity, levels);

                for (request, role) in self.grid.emit(direction, price, &mut self.ids) {
                    if let (OrderRole::GridLeg { ladder, level }, Some(leg_price)) = (role, request.kind.price()) {
                        self.emit(ExecutionEvent::GridLevelPlaced {
                            order_id: request.tag,
                            ladder,
                            level,
                            price: leg_price,
                        });
                    }
                    self.track(&request, role);
                    self.stats.grid_orders += 1;
                    commands.push(BrokerCommand::Submit(request));
                }
                commands
            }
            LifecycleState::ExitPending { direction } => {
                warn!("Primary {} filled @ {:.2} while exiting; re-issuing exit", tag, price);
                self.position.open(direction, quantity, price);
                self.exit_commands()
            }
            state => {
                warn!("Unexpected primary fill {} @ {:.2} in {}", tag, price, state);
                Vec::new()
            }
        }
    }

    fn on_leg_fill(&mut self, tag: OrderId, quantity: u32, price: f64) -> Vec<BrokerCommand> {
        if let LifecycleState::ExitPending { .. } = self.state {
            warn!("Grid leg {} filled @ {:.2} while exiting; re-issuing exit", tag, price);
            self.position.add(quantity);
            return self.exit_commands();
        }

        let LifecycleState::PositionOpen { direction } = self.state else {
            warn!("Unexpected grid fill {} @ {:.2} in {}", tag, price, self.state);
            return Vec::new();
        };
        if !self.grid.mark_filled(tag) {
            warn!("Fill for untracked grid leg {}", tag);
            return Vec::new();
        }
        let Some(baseline) = self.position.risk_baseline() else {
            error!("Grid leg {} filled with no risk baseline; position unprotected", tag);
            return Vec::new();
        };

        self.position.add(quantity);
        self.stats.grid_fills += 1;

        let levels = self.risk.leg_levels(direction, price, baseline);
        info!(
            "GRID FILL: {} x{} @ {:.2} | Stop: {:.2} (baseline {:.2}) | Target: {:.2} | Position: {}",
            direction,
            quantity,
            price,
            levels.stop,
            baseline,
            levels.target,
            self.position.quantity()
        );
        self.emit(ExecutionEvent::LegFilled {
            order_id: tag,
            fill_price: price,
            stop: levels.stop,
        });

        self.protect(tag, direction, quantity, levels)
    }

    fn on_protective_fill(
        &mut self,
        tag: OrderId,
        role: OrderRole,
        parent: OrderId,
        quantity: u32,
        price: f64,
    ) -> Vec<BrokerCommand> {
        let kind = if matches!(role, OrderRole::ProtectiveStop { .. }) { "STOP" } else { "TARGET" };
        info!("{} HIT: {} x{} @ {:.2} (for {})", kind, tag, quantity, price, parent);
        self.stats.exits += 1;

        let mut commands = Vec::new();
        let siblings: Vec<OrderId> = self
            .orders
            .values()
            .filter(|record| record.id != tag && !record.is_terminal())
            .filter(|record| match record.role {
                OrderRole::ProtectiveStop { parent: p } | OrderRole::ProtectiveTarget { parent: p } => p == parent,
                _ => false,
            })
            .map(|record| record.id)
            .collect();
        for sibling in siblings {
            // OCO at the broker; the explicit cancel covers adapters without it
            if let Some(record) = self.orders.get_mut(&sibling) {
                record.update_state(OrderState::Cancelled);
            }
            commands.push(BrokerCommand::Cancel {
                order_id: sibling.to_string(),
            });
        }

        if self.position.reduce(quantity) {
            commands.extend(self.finish_flat("protective order filled"));
        }
        commands
    }

    fn on_order_closed(
        &mut self,
        tag: OrderId,
        role: OrderRole,
        notification: &BrokerNotification,
    ) -> Vec<BrokerCommand> {
        let rejected = notification.state == OrderState::Rejected;
        if rejected {
            self.stats.rejections += 1;
            self.emit(ExecutionEvent::OrderRejected {
                order_id: tag,
                role,
                reason: notification.reason.clone(),
            });
        }

        match role {
            OrderRole::Primary => match self.state {
                LifecycleState::EntryPending { direction, order } if order == tag => {
                    warn!(
                        "Primary {} {} {}: {} - back to FLAT",
                        direction,
                        tag,
                        notification.state,
                        notification.reason.as_deref().unwrap_or("no reason given")
                    );
                    self.state = LifecycleState::Flat;
                    self.entry_reference = None;
                    Vec::new()
                }
                LifecycleState::ExitPending { .. } if self.position.is_flat() => {
                    self.finish_flat("entry never filled")
                }
                _ => Vec::new(),
            },
            OrderRole::GridLeg { ladder, level } => {
                if self.grid.drop_leg(tag).is_some() {
                    if rejected {
                        warn!(
                            "Grid leg {} (#{} level {}) rejected: {}",
                            tag,
                            ladder,
                            level,
                            notification.reason.as_deref().unwrap_or("no reason given")
                        );
                    } else {
                        debug!("Grid leg {} cancelled", tag);
                    }
                }
                Vec::new()
            }
            OrderRole::ProtectiveStop { parent } | OrderRole::ProtectiveTarget { parent } => {
                if rejected {
                    error!(
                        "Protective {} for {} rejected: {} - exposure left unprotected",
                        tag,
                        parent,
                        notification.reason.as_deref().unwrap_or("no reason given")
                    );
                }
                Vec::new()
            }
            OrderRole::Exit => {
                if rejected {
                    warn!("Exit {} rejected; reconciliation will retry", tag);
                }
                Vec::new()
            }
        }
    }

    /// Stop and target for a filled primary or leg, OCO-grouped on the parent
    fn protect(
        &mut self,
        parent: OrderId,
        direction: Direction,
        quantity: u32,
        levels: ProtectiveLevels,
    ) -> Vec<BrokerCommand> {
        let side = OrderSide::exit(direction);
        let stop = OrderRequest::stop(self.ids.next_id(), side, quantity, levels.stop).with_oco(parent);
        let target = OrderRequest::limit(self.ids.next_id(), side, quantity, levels.target).with_oco(parent);

        self.track(&stop, OrderRole::ProtectiveStop { parent });
        self.track(&target, OrderRole::ProtectiveTarget { parent });
        self.stats.protective_attached += 1;
        self.emit(ExecutionEvent::ProtectionAttached {
            parent,
            stop: levels.stop,
            target: levels.target,
        });

        vec![BrokerCommand::Submit(stop), BrokerCommand::Submit(target)]
    }

    /// Market exits for both directions. Exiting a side the broker does not
    /// hold is a no-op there.
    fn exit_commands(&mut self) -> Vec<BrokerCommand> {
        let quantity = self.position.quantity().max(self.config.quantity);
        [Direction::Long, Direction::Short]
            .into_iter()
            .map(|direction| {
                let tag = self.ids.next_id();
                let request = OrderRequest::market(tag, OrderSide::exit(direction), quantity);
                self.track(&request, OrderRole::Exit);
                BrokerCommand::Exit { tag, direction }
            })
            .collect()
    }

    /// Back to Flat. Cancels any tracked resting order that is still live.
    fn finish_flat(&mut self, reason: &str) -> Vec<BrokerCommand> {
        let mut live: BTreeSet<OrderId> = self.grid.clear().into_iter().collect();
        live.extend(
            self.orders
                .values()
                .filter(|record| !record.is_terminal() && record.kind.price().is_some())
                .map(|record| record.id),
        );
        let commands = live
            .into_iter()
            .map(|id| BrokerCommand::Cancel {
                order_id: id.to_string(),
            })
            .collect();

        self.orders.clear();
        self.position.reset();
        self.state = LifecycleState::Flat;
        self.entry_reference = None;

        info!("FLAT: {}", reason);
        self.emit(ExecutionEvent::PositionFlat {
            reason: reason.to_string(),
        });
        commands
    }

    /// Manual or close-all exit. Repeated calls are no-ops.
    pub fn request_exit(&mut self, reason: &str) -> Vec<BrokerCommand> {
        let direction = match self.state {
            LifecycleState::EntryPending { direction, .. } | LifecycleState::PositionOpen { direction } => direction,
            LifecycleState::Flat | LifecycleState::ExitPending { .. } => return Vec::new(),
        };

        info!(
            "EXIT REQUESTED ({}): {} x{}",
            reason,
            direction,
            self.position.quantity()
        );
        self.state = LifecycleState::ExitPending { direction };
        self.emit(ExecutionEvent::ExitRequested {
            reason: reason.to_string(),
        });

        // Resting legs would only add to what is being closed
        let mut commands: Vec<BrokerCommand> = self
            .grid
            .clear()
            .into_iter()
            .map(|id| BrokerCommand::Cancel {
                order_id: id.to_string(),
            })
            .collect();
        commands.extend(self.exit_commands());
        commands
    }

    /// Re-send exits while the broker still holds the position
    pub fn retry_exit(&mut self) -> Vec<BrokerCommand> {
        if !matches!(self.state, LifecycleState::ExitPending { .. }) {
            return Vec::new();
        }
        warn!("Broker still holds a position while exiting; re-issuing exit");
        self.exit_commands()
    }

    /// Ghost correction: exit both directions and reset to Flat.
    /// A no-op when already flat.
    pub fn force_flat(&mut self, reason: &str) -> Vec<BrokerCommand> {
        if self.state == LifecycleState::Flat && self.position.is_flat() {
            return Vec::new();
        }

        warn!("GHOST POSITION: {} | was {} x{} - forcing flat", reason, self.state, self.position.quantity());
        self.stats.ghost_corrections += 1;
        self.emit(ExecutionEvent::GhostCorrected {
            reason: reason.to_string(),
        });

        let mut commands = self.exit_commands();
        commands.extend(self.finish_flat(reason));
        commands
    }

    /// Broker reports flat while an exit is pending
    pub fn confirm_flat(&mut self) -> Vec<BrokerCommand> {
        match self.state {
            LifecycleState::ExitPending { .. } => self.finish_flat("broker confirmed flat"),
            _ => Vec::new(),
        }
    }

    /// The broker holds the pending entry's position but its fill never
    /// arrived. Treat the primary as filled at the submitting bar's close and
    /// attach protection.
    pub fn recover_entry_fill(&mut self, quantity: u32) -> Vec<BrokerCommand> {
        let LifecycleState::EntryPending { direction, order } = self.state else {
            return Vec::new();
        };
        let Some(price) = self.entry_reference.or(self.last_close) else {
            error!("No reference price for {}; exiting instead", order);
            return self.request_exit("entry fill lost");
        };

        warn!(
            "MISSED FILL: {} {} held at broker x{} - assuming fill @ {:.2}",
            direction, order, quantity, price
        );
        if let Some(record) = self.orders.get_mut(&order) {
            record.record_fill(price);
        }
        let commands = self.on_primary_fill(order, quantity, price);
        self.orders.retain(|_, record| !record.is_terminal());
        commands
    }

    /// The pending entry never reached the broker's position. Drop it and
    /// return to Flat; a fill that still arrives is left to reconciliation.
    pub fn abandon_entry(&mut self) -> Vec<BrokerCommand> {
        let LifecycleState::EntryPending { direction, order } = self.state else {
            return Vec::new();
        };

        warn!("STALE ENTRY: {} {} never filled - back to FLAT", direction, order);
        self.orders.remove(&order);
        self.state = LifecycleState::Flat;
        self.entry_reference = None;
        vec![BrokerCommand::Cancel {
            order_id: order.to_string(),
        }]
    }

    /// Take the broker's position as truth
    pub fn adopt_broker_position(&mut self, direction: Direction, quantity: u32) {
        warn!(
            "Adopting broker position {} x{} (was {} x{})",
            direction,
            quantity,
            self.position.market_position(),
            self.position.quantity()
        );
        self.position.adopt(direction, quantity);
        if self.state == LifecycleState::Flat {
            self.state = LifecycleState::PositionOpen { direction };
        }
    }

    /// Stop taking entries and return the session counters
    pub fn shutdown(&mut self) -> SessionStats {
        self.armed_at = None;
        info!("Session summary: {}", self.stats.summary());
        if !self.position.is_flat() {
            warn!(
                "Shutting down with open position {} x{}",
                self.position.market_position(),
                self.position.quantity()
            );
        }
        self.stats.clone()
    }
}
