//! Position reconciliation against the broker
//!
//! The broker is the single source of truth. Each pass compares the
//! controller's position with the broker's and converges the controller:
//! - internal open, broker flat → ghost, force flat
//! - exit pending, broker flat → confirm flat
//! - internal flat, broker holding → adopt and exit
//! - same direction, different size → adopt the broker size
//! - opposite directions → force flat
//!
//! An entry still pending gets `entry_grace_passes` passes for its fill to
//! arrive. After that the broker decides: holding the entry's direction means
//! the fill was lost, flat means the entry never executed.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::broker::{BrokerAdapter, BrokerPosition, WorkingOrder};
use super::engine::{LifecycleState, OrderLifecycleController};
use super::order::{BrokerCommand, OrderId};
use super::position::MarketPosition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileFinding {
    InSync,
    GhostPosition,
    EntryFillRecovered,
    EntryAbandoned,
    ExitConfirmed,
    ExitRetried,
    OrphanPosition,
    QuantityMismatch,
    DirectionMismatch,
}

impl std::fmt::Display for ReconcileFinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InSync => write!(f, "IN_SYNC"),
            Self::GhostPosition => write!(f, "GHOST_POSITION"),
            Self::EntryFillRecovered => write!(f, "ENTRY_FILL_RECOVERED"),
            Self::EntryAbandoned => write!(f, "ENTRY_ABANDONED"),
            Self::ExitConfirmed => write!(f, "EXIT_CONFIRMED"),
            Self::ExitRetried => write!(f, "EXIT_RETRIED"),
            Self::OrphanPosition => write!(f, "ORPHAN_POSITION"),
            Self::QuantityMismatch => write!(f, "QUANTITY_MISMATCH"),
            Self::DirectionMismatch => write!(f, "DIRECTION_MISMATCH"),
        }
    }
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub timestamp: DateTime<Utc>,
    pub finding: ReconcileFinding,
    pub internal: MarketPosition,
    pub internal_quantity: u32,
    pub broker: BrokerPosition,
    /// Corrective commands to dispatch before anything else this cycle
    pub commands: Vec<BrokerCommand>,
}

#[derive(Debug)]
pub struct PositionReconciler {
    instrument: String,
    passes: u64,
    corrections: u64,
    entry_grace_passes: u32,
    /// Pending entry and how many passes have seen it
    pending_entry: Option<(OrderId, u32)>,
}

impl PositionReconciler {
    pub fn new(instrument: &str) -> Self {
        Self {
            instrument: instrument.to_string(),
            passes: 0,
            corrections: 0,
            entry_grace_passes: 1,
            pending_entry: None,
        }
    }

    pub fn with_entry_grace(mut self, passes: u32) -> Self {
        self.entry_grace_passes = passes;
        self
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn passes(&self) -> u64 {
        self.passes
    }

    pub fn corrections(&self) -> u64 {
        self.corrections
    }

    /// Converge the controller to the broker's position
    pub fn reconcile(
        &mut self,
        controller: &mut OrderLifecycleController,
        broker: &BrokerPosition,
    ) -> ReconcileReport {
        self.passes += 1;

        let internal = controller.position().market_position();
        let internal_quantity = controller.position().quantity();
        let broker_direction = if broker.is_flat() {
            None
        } else {
            broker.position.direction()
        };

        let state = controller.state();
        if !matches!(state, LifecycleState::EntryPending { .. }) {
            self.pending_entry = None;
        }

        let (finding, commands) = match state {
            LifecycleState::EntryPending { direction, order } => {
                let seen = match self.pending_entry {
                    Some((id, seen)) if id == order => seen + 1,
                    _ => 1,
                };
                self.pending_entry = Some((order, seen));

                if seen <= self.entry_grace_passes {
                    (ReconcileFinding::InSync, Vec::new())
                } else {
                    self.pending_entry = None;
                    match broker_direction {
                        None => (ReconcileFinding::EntryAbandoned, controller.abandon_entry()),
                        Some(held) if held == direction => (
                            ReconcileFinding::EntryFillRecovered,
                            controller.recover_entry_fill(broker.quantity),
                        ),
                        Some(held) => {
                            warn!("Entry {} pending {}, broker holds {}", order, direction, held);
                            (
                                ReconcileFinding::DirectionMismatch,
                                controller.force_flat("broker holds the opposite direction"),
                            )
                        }
                    }
                }
            }
            LifecycleState::ExitPending { .. } => match broker_direction {
                None => (ReconcileFinding::ExitConfirmed, controller.confirm_flat()),
                Some(_) => (ReconcileFinding::ExitRetried, controller.retry_exit()),
            },
            LifecycleState::Flat | LifecycleState::PositionOpen { .. } => {
                match (internal.direction(), broker_direction) {
                    (None, None) => (ReconcileFinding::InSync, Vec::new()),
                    (Some(_), None) => {
                        warn!(
                            "Position closed at broker while tracking {} x{}",
                            internal, internal_quantity
                        );
                        (
                            ReconcileFinding::GhostPosition,
                            controller.force_flat("broker reports no position"),
                        )
                    }
                    (None, Some(direction)) => {
                        warn!(
                            "Unexpected position found: {} x{} - adopting and exiting",
                            direction, broker.quantity
                        );
                        controller.adopt_broker_position(direction, broker.quantity);
                        (
                            ReconcileFinding::OrphanPosition,
                            controller.request_exit("untracked broker position"),
                        )
                    }
                    (Some(ours), Some(theirs)) if ours == theirs => {
                        if internal_quantity == broker.quantity {
                            (ReconcileFinding::InSync, Vec::new())
                        } else {
                            warn!(
                                "Position mismatch: broker has {} contracts, we track {}",
                                broker.quantity, internal_quantity
                            );
                            controller.adopt_broker_position(theirs, broker.quantity);
                            (ReconcileFinding::QuantityMismatch, Vec::new())
                        }
                    }
                    (Some(ours), Some(theirs)) => {
                        warn!("Direction mismatch: we track {}, broker holds {}", ours, theirs);
                        (
                            ReconcileFinding::DirectionMismatch,
                            controller.force_flat("broker holds the opposite direction"),
                        )
                    }
                }
            }
        };

        if finding == ReconcileFinding::InSync {
            debug!("Reconcile #{}: in sync ({} x{})", self.passes, internal, internal_quantity);
        } else {
            self.corrections += 1;
            info!(
                "Reconcile #{}: {} | internal {} x{} | broker {} x{} | {} commands",
                self.passes,
                finding,
                internal,
                internal_quantity,
                broker.position,
                broker.quantity,
                commands.len()
            );
        }

        ReconcileReport {
            timestamp: Utc::now(),
            finding,
            internal,
            internal_quantity,
            broker: *broker,
            commands,
        }
    }

    /// Broker order ids to cancel during startup or shutdown cleanup
    pub fn cleanup_orders(&self, orders: &[WorkingOrder]) -> Vec<String> {
        orders
            .iter()
            .filter(|order| order.instrument == self.instrument && !order.state.is_terminal())
            .map(|order| order.order_id.clone())
            .collect()
    }

    /// Query the broker and reconcile
    pub async fn reconcile_with<B>(
        &mut self,
        controller: &mut OrderLifecycleController,
        broker: &B,
    ) -> Result<ReconcileReport>
    where
        B: BrokerAdapter + ?Sized,
    {
        let position = broker.query_position(&self.instrument).await?;
        Ok(self.reconcile(controller, &position))
    }

    /// Cancel every working order for the instrument, tracked or not.
    ///
    /// Failed cancels are logged and left for the next pass. Returns the
    /// number of orders cancelled.
    pub async fn cancel_working_orders<B>(&self, broker: &B, phase: &str) -> Result<usize>
    where
        B: BrokerAdapter + ?Sized,
    {
        let orders = broker.query_working_orders(&self.instrument).await?;
        let targets = self.cleanup_orders(&orders);
        if targets.is_empty() {
            debug!("No working orders at {}", phase);
            return Ok(0);
        }

        info!("Cancelling {} working orders at {}...", targets.len(), phase);
        let mut cancelled = 0;
        for order_id in &targets {
            match broker.cancel_order(order_id).await {
                Ok(()) => cancelled += 1,
                Err(e) => warn!("Failed to cancel {} at {}: {}", order_id, phase, e),
            }
        }

        if cancelled < targets.len() {
            warn!("Cancelled {}/{} working orders at {}", cancelled, targets.len(), phase);
        }
        Ok(cancelled)
    }
}
