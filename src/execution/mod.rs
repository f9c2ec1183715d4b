//! Execution module - order lifecycle, risk and broker reconciliation
//!
//! The controller is a pure state machine; the session loop owns it and
//! dispatches its commands through a `BrokerAdapter`.

mod broker;
mod config;
mod engine;
mod grid;
mod order;
mod position;
mod reconciler;
mod risk;
mod session;
mod simulated;

pub use broker::{BrokerAdapter, BrokerNotification, BrokerPosition, WorkingOrder};
pub use config::{ConfigError, StrategyConfig};
pub use engine::{ExecutionEvent, LifecycleState, OrderLifecycleController};
pub use grid::{GridChainManager, GridLadder, GridLeg};
pub use order::{
    BrokerCommand, OrderId, OrderIdAllocator, OrderKind, OrderRecord, OrderRequest, OrderRole,
    OrderSide, OrderState,
};
pub use position::{MarketPosition, PositionState, SessionStats};
pub use reconciler::{PositionReconciler, ReconcileFinding, ReconcileReport};
pub use risk::{ProtectiveLevels, RiskCalculator};
pub use session::{EngineEvent, SessionRunner};
pub use simulated::SimulatedBroker;
