//! Wire schemas carried inside the encrypted envelope.
//!
//! Every consumer decodes through [`OrderEvent::decode`] or
//! [`StatusUpdate::decode`]; a payload that parses but breaks an invariant is
//! rejected here instead of leaking partial data downstream.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::Validate;
use crate::domain::aggregates::{Customer, Order, OrderStatus};
use crate::domain::value_objects::{OrderId, ProductCode, Quantity};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct OrderEvent {
    pub order_id: OrderId,
    pub timestamp: DateTime<Utc>,
    #[validate]
    pub customer: Customer,
    #[validate]
    pub items: Vec<OrderEventItem>,
    pub total_amount: Decimal,
    pub currency: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct OrderEventItem {
    pub product_code: ProductCode,
    #[validate(length(min = 1))]
    pub name: String,
    pub quantity: Quantity,
    pub unit_price: Decimal,
    pub line_total: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("payload violates schema: {0}")]
    Invalid(String),
}

impl OrderEvent {
    pub fn from_order(order: &Order, timestamp: DateTime<Utc>) -> Self {
        Self {
            order_id: order.id().clone(),
            timestamp,
            customer: order.customer().clone(),
            items: order.items().iter().map(|i| OrderEventItem {
                product_code: i.product_code.clone(),
                name: i.name.clone(),
                quantity: i.quantity,
                unit_price: i.unit_price,
                line_total: i.line_total,
            }).collect(),
            total_amount: order.total().amount(),
            currency: order.total().currency().to_string(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        serde_json::to_vec(self).map_err(|e| PayloadError::Malformed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        let event: Self = serde_json::from_slice(bytes).map_err(|e| PayloadError::Malformed(e.to_string()))?;
        event.check()?;
        Ok(event)
    }

    fn check(&self) -> Result<(), PayloadError> {
        self.validate().map_err(|e| PayloadError::Invalid(e.to_string()))?;
        if self.order_id.as_str().is_empty() { return Err(PayloadError::Invalid("empty orderId".into())); }
        if self.items.is_empty() { return Err(PayloadError::Invalid("order has no items".into())); }
        for item in &self.items {
            if item.unit_price * Decimal::from(item.quantity.value()) != item.line_total {
                return Err(PayloadError::Invalid(format!("line total mismatch for {}", item.product_code)));
            }
        }
        let sum: Decimal = self.items.iter().map(|i| i.line_total).sum();
        if sum != self.total_amount {
            return Err(PayloadError::Invalid(format!("total {} does not match line sum {sum}", self.total_amount)));
        }
        Ok(())
    }

    /// Human-readable item list used as the CRM deal description.
    pub fn item_summary(&self) -> String {
        self.items.iter().map(|i| format!("{}x {}", i.quantity, i.name)).collect::<Vec<_>>().join(", ")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind { Created, Success, Cancelled }

/// Feedback message published to the response queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub status: StatusKind,
    pub order_id: OrderId,
    pub external_record_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn new(status: StatusKind, order_id: OrderId, external_record_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self { status, order_id, external_record_id: external_record_id.into(), message: message.into(), timestamp: Utc::now() }
    }

    pub fn target_status(&self) -> OrderStatus {
        match self.status {
            StatusKind::Created => OrderStatus::Processing,
            StatusKind::Success => OrderStatus::Completed,
            StatusKind::Cancelled => OrderStatus::Cancelled,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        serde_json::to_vec(self).map_err(|e| PayloadError::Malformed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        let update: Self = serde_json::from_slice(bytes).map_err(|e| PayloadError::Malformed(e.to_string()))?;
        if update.order_id.as_str().is_empty() { return Err(PayloadError::Invalid("empty orderId".into())); }
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event_json(total: &str) -> serde_json::Value {
        json!({
            "orderId": "0190f3c2-ord",
            "timestamp": "2026-01-19T10:00:00Z",
            "customer": {
                "firstName": "Pierre", "lastName": "Martin", "email": "pierre@example.com",
                "street": "Rue Haute", "houseNumber": "12", "postalCode": "1000"
            },
            "items": [
                { "productCode": "A", "name": "Alpha", "quantity": 2, "unitPrice": "10.0", "lineTotal": "20.0" },
                { "productCode": "B", "name": "Beta", "quantity": 1, "unitPrice": "5.0", "lineTotal": "5.0" }
            ],
            "totalAmount": total,
            "currency": "EUR"
        })
    }

    #[test]
    fn test_decode_accepts_consistent_event() {
        let bytes = serde_json::to_vec(&event_json("25.0")).unwrap();
        let event = OrderEvent::decode(&bytes).unwrap();
        assert_eq!(event.items.len(), 2);
        assert_eq!(event.total_amount, Decimal::new(25, 0));
        assert_eq!(event.item_summary(), "2x Alpha, 1x Beta");
    }

    #[test]
    fn test_decode_rejects_tampered_total() {
        let bytes = serde_json::to_vec(&event_json("24.0")).unwrap();
        assert!(matches!(OrderEvent::decode(&bytes), Err(PayloadError::Invalid(_))));
    }

    #[test]
    fn test_decode_rejects_missing_fields_and_bad_email() {
        let mut value = event_json("25.0");
        value.as_object_mut().unwrap().remove("customer");
        assert!(matches!(OrderEvent::decode(&serde_json::to_vec(&value).unwrap()), Err(PayloadError::Malformed(_))));

        let mut value = event_json("25.0");
        value["customer"]["email"] = json!("not-an-email");
        assert!(matches!(OrderEvent::decode(&serde_json::to_vec(&value).unwrap()), Err(PayloadError::Invalid(_))));

        let mut value = event_json("0");
        value["items"] = json!([]);
        assert!(matches!(OrderEvent::decode(&serde_json::to_vec(&value).unwrap()), Err(PayloadError::Invalid(_))));
    }

    #[test]
    fn test_status_update_wire_shape() {
        let update = StatusUpdate::new(StatusKind::Created, OrderId::new("o-1"), "006A", "deal created");
        let value: serde_json::Value = serde_json::from_slice(&update.encode().unwrap()).unwrap();
        assert_eq!(value["status"], "created");
        assert_eq!(value["orderId"], "o-1");
        assert_eq!(value["externalRecordId"], "006A");
        assert_eq!(update.target_status(), OrderStatus::Processing);
        assert!(StatusUpdate::decode(br#"{"status":"shipped"}"#).is_err());
    }
}
