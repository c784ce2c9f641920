//! Order Aggregate
//!
//! Created by the inventory reservation, afterwards mutated only through
//! [`Order::apply_status`]. Status moves forward only:
//! `Pending -> Processing -> {Completed | Failed | Cancelled}`, and any step
//! may be skipped when updates arrive out of order.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;
use crate::domain::aggregates::product::Product;
use crate::domain::value_objects::{Money, OrderId, ProductCode, Quantity};

#[derive(Clone, Debug, PartialEq)]
pub struct Order {
    id: OrderId,
    customer: Customer,
    items: Vec<LineItem>,
    total: Money,
    status: OrderStatus,
    external_record_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Line item with catalog-authoritative price. Client prices never reach this type.
#[derive(Clone, Debug, PartialEq)]
pub struct LineItem {
    pub product_id: Uuid,
    pub product_code: ProductCode,
    pub name: String,
    pub quantity: Quantity,
    pub unit_price: Decimal,
    pub line_total: Decimal,
}

impl LineItem {
    pub fn from_product(product: &Product, quantity: Quantity) -> Self {
        Self {
            product_id: product.id(),
            product_code: product.code().clone(),
            name: product.name().to_string(),
            quantity,
            unit_price: product.unit_price(),
            line_total: product.unit_price() * Decimal::from(quantity.value()),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    #[validate(length(min = 1, max = 100))]
    pub first_name: String,
    #[validate(length(min = 1, max = 100))]
    pub last_name: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1, max = 120))]
    pub street: String,
    #[validate(length(max = 20))]
    #[serde(default)]
    pub house_number: String,
    #[validate(length(min = 1, max = 20))]
    pub postal_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[validate(length(equal = 2))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vat_number: Option<String>,
}

impl Customer {
    pub fn full_name(&self) -> String { format!("{} {}", self.first_name, self.last_name) }

    pub fn street_line(&self) -> String {
        if self.house_number.is_empty() { self.street.clone() } else { format!("{} {}", self.street, self.house_number) }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus { #[default] Pending, Processing, Completed, Failed, Cancelled }

/// Result of asking a status to move to another one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Applied,
    Unchanged,
    Rejected,
}

impl OrderStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Processing => "Processing",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(Self::Pending),
            "Processing" => Some(Self::Processing),
            "Completed" => Some(Self::Completed),
            "Failed" => Some(Self::Failed),
            "Cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub const fn is_terminal(&self) -> bool { matches!(self, Self::Completed | Self::Failed | Self::Cancelled) }

    const fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Processing => 1,
            Self::Completed | Self::Failed | Self::Cancelled => 2,
        }
    }

    pub fn transition(&self, target: OrderStatus) -> Transition {
        if *self == target { return Transition::Unchanged; }
        if self.is_terminal() || target.rank() <= self.rank() { return Transition::Rejected; }
        Transition::Applied
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

impl Order {
    /// Builds a new `Pending` order; the total is always recomputed from the line totals.
    pub fn place(id: OrderId, customer: Customer, items: Vec<LineItem>, currency: &str) -> Result<Self, OrderError> {
        if items.is_empty() { return Err(OrderError::NoItems); }
        let total = items.iter().fold(Money::zero(currency), |acc, i| Money::new(acc.amount() + i.line_total, currency));
        let now = Utc::now();
        Ok(Self {
            id, customer, items, total, status: OrderStatus::Pending, external_record_id: None,
            created_at: now, updated_at: now,
        })
    }

    /// Rehydrates a persisted order without re-running intake rules.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: OrderId, customer: Customer, items: Vec<LineItem>, total: Money, status: OrderStatus,
        external_record_id: Option<String>, created_at: DateTime<Utc>, updated_at: DateTime<Utc>,
    ) -> Self {
        Self { id, customer, items, total, status, external_record_id, created_at, updated_at }
    }

    pub fn id(&self) -> &OrderId { &self.id }
    pub fn customer(&self) -> &Customer { &self.customer }
    pub fn items(&self) -> &[LineItem] { &self.items }
    pub fn total(&self) -> &Money { &self.total }
    pub fn status(&self) -> OrderStatus { self.status }
    pub fn external_record_id(&self) -> Option<&str> { self.external_record_id.as_deref() }
    pub fn created_at(&self) -> DateTime<Utc> { self.created_at }
    pub fn updated_at(&self) -> DateTime<Utc> { self.updated_at }

    pub fn apply_status(&mut self, target: OrderStatus, external_record_id: Option<&str>) -> Transition {
        let outcome = self.status.transition(target);
        if outcome == Transition::Applied {
            self.status = target;
            if let Some(ext) = external_record_id { self.external_record_id = Some(ext.to_string()); }
            self.touch();
        }
        outcome
    }

    fn touch(&mut self) { self.updated_at = Utc::now(); }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderError {
    #[error("order has no items")]
    NoItems,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customer() -> Customer {
        Customer {
            first_name: "Marie".into(), last_name: "Dubois".into(), email: "marie@example.com".into(),
            street: "Nijverheidskaai".into(), house_number: "170".into(), postal_code: "1070".into(),
            city: Some("Anderlecht".into()), country: None, vat_number: None,
        }
    }

    fn item(code: &str, qty: u32, price: Decimal) -> LineItem {
        let product = Product::create(ProductCode::new(code).unwrap(), code, price, 100);
        LineItem::from_product(&product, Quantity::new(qty).unwrap())
    }

    #[test]
    fn test_total_is_sum_of_line_totals() {
        let order = Order::place(
            OrderId::generate(), customer(),
            vec![item("A", 2, Decimal::new(100, 1)), item("B", 1, Decimal::new(50, 1))], "EUR",
        ).unwrap();
        assert_eq!(order.total().amount(), Decimal::new(25, 0));
        assert_eq!(order.status(), OrderStatus::Pending);
        assert_eq!(Order::place(OrderId::generate(), customer(), vec![], "EUR"), Err(OrderError::NoItems));
    }

    #[test]
    fn test_status_is_monotonic() {
        let mut order = Order::place(OrderId::generate(), customer(), vec![item("A", 1, Decimal::ONE)], "EUR").unwrap();
        assert_eq!(order.apply_status(OrderStatus::Processing, Some("006XX")), Transition::Applied);
        assert_eq!(order.external_record_id(), Some("006XX"));
        assert_eq!(order.apply_status(OrderStatus::Processing, None), Transition::Unchanged);
        assert_eq!(order.apply_status(OrderStatus::Pending, None), Transition::Rejected);
        assert_eq!(order.apply_status(OrderStatus::Completed, None), Transition::Applied);
        assert_eq!(order.apply_status(OrderStatus::Processing, None), Transition::Rejected);
        assert_eq!(order.apply_status(OrderStatus::Cancelled, None), Transition::Rejected);
        assert_eq!(order.status(), OrderStatus::Completed);
    }

    #[test]
    fn test_pending_may_skip_to_terminal() {
        assert_eq!(OrderStatus::Pending.transition(OrderStatus::Completed), Transition::Applied);
        assert_eq!(OrderStatus::Pending.transition(OrderStatus::Cancelled), Transition::Applied);
        assert_eq!(OrderStatus::Cancelled.transition(OrderStatus::Completed), Transition::Rejected);
    }

    #[test]
    fn test_status_round_trips_through_storage_name() {
        for s in [OrderStatus::Pending, OrderStatus::Processing, OrderStatus::Completed, OrderStatus::Failed, OrderStatus::Cancelled] {
            assert_eq!(OrderStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(OrderStatus::parse("Shipped"), None);
    }
}
