//! Broker/account adapter boundary
//!
//! The controller never talks to a broker directly; the session dispatches
//! its commands through this trait and feeds `BrokerNotification`s back in.

use async_trait::async_trait;
use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::trading_core::Direction;

use super::order::{OrderId, OrderKind, OrderRequest, OrderSide, OrderState};
use super::position::MarketPosition;

/// Authoritative position as reported by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub position: MarketPosition,
    pub quantity: u32,
}

impl BrokerPosition {
    pub fn flat() -> Self {
        Self::default()
    }

    pub fn is_flat(&self) -> bool {
        self.position == MarketPosition::Flat || self.quantity == 0
    }
}

/// Broker-side order that has not reached a terminal state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingOrder {
    pub order_id: String,
    pub instrument: String,
    /// Present when the order was placed by this engine
    pub tag: Option<OrderId>,
    pub side: OrderSide,
    pub quantity: u32,
    pub kind: OrderKind,
    pub state: OrderState,
}

/// Inbound order update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerNotification {
    pub tag: OrderId,
    pub state: OrderState,
    pub fill_price: Option<f64>,
    pub quantity: Option<u32>,
    pub reason: Option<String>,
}

impl BrokerNotification {
    pub fn working(tag: OrderId) -> Self {
        Self {
            tag,
            state: OrderState::Working,
            fill_price: None,
            quantity: None,
            reason: None,
        }
    }

    pub fn filled(tag: OrderId, fill_price: f64, quantity: u32) -> Self {
        Self {
            tag,
            state: OrderState::Filled,
            fill_price: Some(fill_price),
            quantity: Some(quantity),
            reason: None,
        }
    }

    pub fn cancelled(tag: OrderId) -> Self {
        Self {
            tag,
            state: OrderState::Cancelled,
            fill_price: None,
            quantity: None,
            reason: None,
        }
    }

    pub fn rejected(tag: OrderId, reason: impl Into<String>) -> Self {
        Self {
            tag,
            state: OrderState::Rejected,
            fill_price: None,
            quantity: None,
            reason: Some(reason.into()),
        }
    }
}

#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Submit an order; the outcome arrives later as a notification
    async fn submit_order(&self, request: &OrderRequest) -> Result<()>;

    async fn submit_market_order(&self, direction: Direction, quantity: u32, tag: OrderId) -> Result<()> {
        let request = OrderRequest::market(tag, OrderSide::entry(direction), quantity);
        self.submit_order(&request).await
    }

    async fn submit_limit_order(
        &self,
        direction: Direction,
        quantity: u32,
        price: f64,
        tag: OrderId,
    ) -> Result<()> {
        let request = OrderRequest::limit(tag, OrderSide::entry(direction), quantity, price);
        self.submit_order(&request).await
    }

    /// Cancel by broker order id
    async fn cancel_order(&self, order_id: &str) -> Result<()>;

    /// Close the position in `direction` at market. A no-op when the broker
    /// holds nothing in that direction.
    async fn exit_position(&self, direction: Direction, tag: OrderId) -> Result<()>;

    async fn query_position(&self, instrument: &str) -> Result<BrokerPosition>;

    async fn query_working_orders(&self, instrument: &str) -> Result<Vec<WorkingOrder>>;
}
