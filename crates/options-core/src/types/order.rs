//! Order types for exit execution.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::position::Position;

/// Side of the order (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Current status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Order submitted to the broker, fill not yet confirmed.
    Pending,
    /// Order partially filled.
    PartiallyFilled,
    /// Order fully filled.
    Filled,
    /// Order rejected by the broker.
    Rejected,
}

/// Market order that flattens a position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitOrder {
    pub id: Uuid,
    pub position_id: Uuid,
    pub segment: String,
    pub instrument_id: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    /// Last trusted price, used as the simulated fill price.
    pub reference_price: Decimal,
    pub simulated: bool,
    pub created_at: DateTime<Utc>,
}

impl ExitOrder {
    /// Build the closing order for a position.
    pub fn for_position(position: &Position, reference_price: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            position_id: position.id,
            segment: position.instrument.segment.clone(),
            instrument_id: position.instrument.instrument_id.clone(),
            side: position.side.exit_order_side(),
            quantity: position.quantity,
            reference_price,
            simulated: position.simulated,
            created_at: Utc::now(),
        }
    }
}

/// Broker acknowledgement of an exit order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderConfirmation {
    pub order_id: Uuid,
    pub broker_order_ref: Option<String>,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub average_price: Option<Decimal>,
    pub executed_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl OrderConfirmation {
    pub fn filled(
        order_id: Uuid,
        broker_order_ref: Option<String>,
        quantity: Decimal,
        price: Decimal,
    ) -> Self {
        Self {
            order_id,
            broker_order_ref,
            status: OrderStatus::Filled,
            filled_quantity: quantity,
            average_price: Some(price),
            executed_at: Utc::now(),
            error: None,
        }
    }

    pub fn rejected(order_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            order_id,
            broker_order_ref: None,
            status: OrderStatus::Rejected,
            filled_quantity: Decimal::ZERO,
            average_price: None,
            executed_at: Utc::now(),
            error: Some(error.into()),
        }
    }

    /// Accepted by the broker. Pending market orders count: they fill.
    pub fn is_success(&self) -> bool {
        matches!(
            self.status,
            OrderStatus::Filled | OrderStatus::PartiallyFilled | OrderStatus::Pending
        )
    }
}

/// Request to move a broker-side stop order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopModification {
    pub broker_order_ref: String,
    pub instrument_id: String,
    pub stop_price: Decimal,
}
