//! Order types, roles and the per-order state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::trading_core::Direction;

/// Client-side order tag, unique and increasing within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderId(pub u64);

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EJ-{}", self.0)
    }
}

impl std::str::FromStr for OrderId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim_start_matches("EJ-").parse().map(OrderId)
    }
}

/// Hands out order tags. Never reused within a session.
#[derive(Debug, Default)]
pub struct OrderIdAllocator {
    last: u64,
}

impl OrderIdAllocator {
    pub fn next_id(&mut self) -> OrderId {
        self.last += 1;
        OrderId(self.last)
    }
}

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Side that opens a position in `direction`
    pub fn entry(direction: Direction) -> Self {
        match direction {
            Direction::Long => Self::Buy,
            Direction::Short => Self::Sell,
        }
    }

    /// Side that closes a position in `direction`
    pub fn exit(direction: Direction) -> Self {
        Self::entry(direction).opposite()
    }

    /// Direction this side opens
    pub fn direction(&self) -> Direction {
        match self {
            Self::Buy => Direction::Long,
            Self::Sell => Direction::Short,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type with its price, if any
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit { price: f64 },
    Stop { price: f64 },
}

impl OrderKind {
    pub fn price(&self) -> Option<f64> {
        match self {
            Self::Market => None,
            Self::Limit { price } | Self::Stop { price } => Some(*price),
        }
    }
}

/// What an order is for. Dispatch on fills goes through this, never the tag text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderRole {
    /// Market entry that opens the position
    Primary,
    /// Scaling limit order from ladder `ladder`, level `level` (1-based)
    GridLeg { ladder: u64, level: u32 },
    /// Stop attached to a filled primary or grid leg
    ProtectiveStop { parent: OrderId },
    /// Target attached to a filled primary or grid leg
    ProtectiveTarget { parent: OrderId },
    /// Unconditional market exit
    Exit,
}

impl std::fmt::Display for OrderRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "PRIMARY"),
            Self::GridLeg { ladder, level } => write!(f, "GRID_{}_{}", ladder, level),
            Self::ProtectiveStop { parent } => write!(f, "STOP[{}]", parent),
            Self::ProtectiveTarget { parent } => write!(f, "TARGET[{}]", parent),
            Self::Exit => write!(f, "EXIT"),
        }
    }
}

/// Order state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    /// Sent to the broker, not yet acknowledged
    Submitted,
    /// Acknowledged and resting
    Working,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Submitted => write!(f, "SUBMITTED"),
            Self::Working => write!(f, "WORKING"),
            Self::Filled => write!(f, "FILLED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// Order as handed to the broker adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub tag: OrderId,
    pub side: OrderSide,
    pub quantity: u32,
    pub kind: OrderKind,
    /// One-cancels-other group; protective pairs share their parent's id
    pub oco: Option<OrderId>,
}

impl OrderRequest {
    /// Create a new market order
    pub fn market(tag: OrderId, side: OrderSide, quantity: u32) -> Self {
        Self {
            tag,
            side,
            quantity,
            kind: OrderKind::Market,
            oco: None,
        }
    }

    /// Create a new limit order
    pub fn limit(tag: OrderId, side: OrderSide, quantity: u32, price: f64) -> Self {
        Self {
            tag,
            side,
            quantity,
            kind: OrderKind::Limit { price },
            oco: None,
        }
    }

    /// Create a new stop order
    pub fn stop(tag: OrderId, side: OrderSide, quantity: u32, price: f64) -> Self {
        Self {
            tag,
            side,
            quantity,
            kind: OrderKind::Stop { price },
            oco: None,
        }
    }

    pub fn with_oco(mut self, group: OrderId) -> Self {
        self.oco = Some(group);
        self
    }
}

/// Tracked order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: OrderId,
    pub role: OrderRole,
    pub side: OrderSide,
    pub quantity: u32,
    pub kind: OrderKind,
    pub state: OrderState,

    /// Average fill price
    pub fill_price: Option<f64>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderRecord {
    /// Record for a request about to be submitted
    pub fn submitted(request: &OrderRequest, role: OrderRole) -> Self {
        let now = Utc::now();
        Self {
            id: request.tag,
            role,
            side: request.side,
            quantity: request.quantity,
            kind: request.kind,
            state: OrderState::Submitted,
            fill_price: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if order is in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Update order state
    pub fn update_state(&mut self, state: OrderState) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    /// Record a complete fill
    pub fn record_fill(&mut self, fill_price: f64) {
        self.fill_price = Some(fill_price);
        self.update_state(OrderState::Filled);
    }
}

/// Instruction for the broker adapter produced by the controller
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerCommand {
    Submit(OrderRequest),
    Cancel { order_id: String },
    /// Close whatever the broker holds in `direction`; no-op when it holds nothing
    Exit { tag: OrderId, direction: Direction },
}
