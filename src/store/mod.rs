//! Persistence seams.
//!
//! Each concern is a trait with a Postgres implementation ([`PgStore`]) and an
//! in-process one ([`InMemoryStore`]) that keeps the same transactional
//! guarantees for tests and local runs.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;
use validator::Validate;
use crate::domain::aggregates::{Customer, LineItem, Order, OrderStatus, Product, ProductError};
use crate::domain::value_objects::{OrderId, ProductCode, Quantity};

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("insufficient stock for product {product}: {available} available, {requested} requested")]
    InsufficientStock { product: String, available: u32, requested: u32 },
    #[error("unknown product {0}")]
    UnknownProduct(String),
    #[error("invalid order: {0}")]
    InvalidOrder(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self { Self::Database(e.to_string()) }
}

// =============================================================================
// Reservation
// =============================================================================

/// A product is addressed either by catalog id or by its external code.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProductRef {
    Id(Uuid),
    Code(ProductCode),
}

impl std::fmt::Display for ProductRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Code(code) => write!(f, "{code}"),
        }
    }
}

/// Client-supplied prices are not part of this type and therefore never trusted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestedItem {
    pub product_id: ProductRef,
    pub quantity: Quantity,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ReservationRequest {
    #[validate(length(min = 1, max = 100))]
    pub items: Vec<RequestedItem>,
    #[validate]
    pub customer: Customer,
}

/// Applies every requested quantity to `catalog` in request order.
///
/// `catalog` must hold the locked rows for all referenced products. On error the
/// caller discards the map, so no partial decrement escapes.
pub(crate) fn reserve_items(
    catalog: &mut HashMap<Uuid, Product>,
    items: &[RequestedItem],
) -> Result<Vec<LineItem>, StoreError> {
    let mut lines = Vec::with_capacity(items.len());
    for item in items {
        let id = match &item.product_id {
            ProductRef::Id(id) => catalog.contains_key(id).then_some(*id),
            ProductRef::Code(code) => catalog.values().find(|p| p.code() == code).map(Product::id),
        }
        .ok_or_else(|| StoreError::UnknownProduct(item.product_id.to_string()))?;
        let product = catalog.get_mut(&id).ok_or_else(|| StoreError::UnknownProduct(id.to_string()))?;
        product.reserve(item.quantity).map_err(|e| match e {
            ProductError::InsufficientStock { available, requested } => StoreError::InsufficientStock {
                product: product.code().to_string(),
                available,
                requested,
            },
        })?;
        lines.push(LineItem::from_product(product, item.quantity));
    }
    Ok(lines)
}

#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Atomically reserves every item and inserts a `Pending` order, or changes nothing.
    async fn reserve(&self, order_id: OrderId, request: ReservationRequest, currency: &str) -> Result<Order, StoreError>;
    async fn find_product(&self, product: &ProductRef) -> Result<Option<Product>, StoreError>;
}

// =============================================================================
// Order status
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusChange {
    pub order_id: OrderId,
    pub target: OrderStatus,
    pub external_record_id: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Unchanged,
    Rejected { current: OrderStatus },
    NotFound,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn get(&self, id: &OrderId) -> Result<Option<Order>, StoreError>;
    /// Runs the monotonic transition check and the write under one row lock.
    async fn apply_status(&self, change: &StatusChange) -> Result<ApplyOutcome, StoreError>;
}

// =============================================================================
// Backups
// =============================================================================

/// Placeholder correlation id for envelopes that could not be decoded.
pub const UNKNOWN_CORRELATION: &str = "UNKNOWN";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupRecord {
    pub id: Uuid,
    pub correlation_id: String,
    pub raw_envelope: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl BackupRecord {
    pub fn new(correlation_id: impl Into<String>, raw_envelope: Vec<u8>, received_at: DateTime<Utc>) -> Self {
        Self { id: Uuid::new_v4(), correlation_id: correlation_id.into(), raw_envelope, received_at }
    }
}

#[async_trait]
pub trait BackupStore: Send + Sync {
    async fn insert(&self, record: &BackupRecord) -> Result<(), StoreError>;
    /// Deletes records received before `cutoff`; returns how many were removed.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

// =============================================================================
// CRM quarantine
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuarantineStatus { Pending, Replayed }

impl QuarantineStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Replayed => "replayed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "replayed" => Some(Self::Replayed),
            _ => None,
        }
    }
}

/// A CRM message that failed from both the primary and the dead-letter queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarantineEntry {
    pub id: Uuid,
    pub order_id: Option<String>,
    #[serde(skip)]
    pub raw_envelope: Vec<u8>,
    pub reason: String,
    pub status: QuarantineStatus,
    pub created_at: DateTime<Utc>,
    pub replayed_at: Option<DateTime<Utc>>,
}

impl QuarantineEntry {
    pub fn new(order_id: Option<String>, raw_envelope: Vec<u8>, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            raw_envelope,
            reason: reason.into(),
            status: QuarantineStatus::Pending,
            created_at: Utc::now(),
            replayed_at: None,
        }
    }
}

#[async_trait]
pub trait QuarantineStore: Send + Sync {
    async fn quarantine(&self, entry: &QuarantineEntry) -> Result<(), StoreError>;
    async fn list_pending(&self) -> Result<Vec<QuarantineEntry>, StoreError>;
    async fn get(&self, id: Uuid) -> Result<Option<QuarantineEntry>, StoreError>;
    /// Returns `false` when the entry does not exist or was already replayed.
    async fn mark_replayed(&self, id: Uuid) -> Result<bool, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn catalog() -> (HashMap<Uuid, Product>, Uuid) {
        let a = Product::create(ProductCode::new("A").unwrap(), "Alpha", Decimal::new(10, 0), 5);
        let b = Product::create(ProductCode::new("B").unwrap(), "Beta", Decimal::new(5, 0), 1);
        let a_id = a.id();
        (HashMap::from([(a.id(), a), (b.id(), b)]), a_id)
    }

    fn item(product: ProductRef, qty: u32) -> RequestedItem {
        RequestedItem { product_id: product, quantity: Quantity::new(qty).unwrap() }
    }

    #[test]
    fn test_reserve_items_resolves_by_id_and_code() {
        let (mut catalog, a_id) = catalog();
        let lines = reserve_items(&mut catalog, &[
            item(ProductRef::Id(a_id), 2),
            item(ProductRef::Code(ProductCode::new("B").unwrap()), 1),
        ]).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].line_total, Decimal::new(20, 0));
        assert_eq!(catalog[&a_id].stock(), 3);
    }

    #[test]
    fn test_reserve_items_counts_repeated_products() {
        let (mut catalog, a_id) = catalog();
        let err = reserve_items(&mut catalog, &[item(ProductRef::Id(a_id), 3), item(ProductRef::Id(a_id), 3)]).unwrap_err();
        assert!(matches!(err, StoreError::InsufficientStock { ref product, available: 2, requested: 3 } if product == "A"));
    }

    #[test]
    fn test_product_ref_parses_uuid_or_code() {
        let id = Uuid::new_v4();
        assert_eq!(serde_json::from_value::<ProductRef>(serde_json::json!(id)).unwrap(), ProductRef::Id(id));
        assert_eq!(
            serde_json::from_value::<ProductRef>(serde_json::json!("SKU-9")).unwrap(),
            ProductRef::Code(ProductCode::new("SKU-9").unwrap())
        );
        assert_eq!(serde_json::from_value::<ProductRef>(serde_json::json!(42)).ok(), None);
    }
}
