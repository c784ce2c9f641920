//! Order intake: reserve stock, then publish the order event.
//!
//! Reservation and publish are separate steps. A publish failure after a
//! committed reservation leaves a `Pending` order with reserved stock; it is
//! logged and surfaced to the caller as a retryable broker error.

use std::sync::Arc;
use validator::Validate;
use crate::domain::aggregates::Order;
use crate::domain::value_objects::OrderId;
use crate::publisher::OrderPublisher;
use crate::store::{InventoryStore, ReservationRequest};
use crate::PipelineError;

#[derive(Clone)]
pub struct OrderIntake {
    inventory: Arc<dyn InventoryStore>,
    publisher: OrderPublisher,
    currency: String,
}

impl OrderIntake {
    pub fn new(inventory: Arc<dyn InventoryStore>, publisher: OrderPublisher, currency: impl Into<String>) -> Self {
        Self { inventory, publisher, currency: currency.into() }
    }

    pub async fn place(&self, request: ReservationRequest) -> Result<Order, PipelineError> {
        request.validate().map_err(|e| PipelineError::Validation(e.to_string()))?;
        let order_id = OrderId::generate();
        let order = match self.inventory.reserve(order_id.clone(), request, &self.currency).await {
            Ok(order) => order,
            Err(e) => {
                tracing::warn!(order_id = %order_id, error = %e, "Reservation rejected");
                return Err(e.into());
            }
        };
        tracing::info!(order_id = %order.id(), total = %order.total().amount(), "Stock reserved");

        if let Err(e) = self.publisher.publish_order(&order).await {
            tracing::error!(order_id = %order.id(), error = %e, "Order reserved but not published; left Pending");
            return Err(e);
        }
        Ok(order)
    }
}
