//! Single-mutex store: every operation holds the lock for its whole duration,
//! which gives the same all-or-nothing behaviour as a database transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;
use crate::domain::aggregates::{Order, Product, Transition};
use crate::domain::value_objects::OrderId;
use super::*;

#[derive(Default)]
struct State {
    products: HashMap<Uuid, Product>,
    orders: HashMap<OrderId, Order>,
    backups: Vec<BackupRecord>,
    quarantine: Vec<QuarantineEntry>,
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self { Self::default() }

    pub fn with_products(products: impl IntoIterator<Item = Product>) -> Self {
        let state = State { products: products.into_iter().map(|p| (p.id(), p)).collect(), ..State::default() };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    pub async fn backups(&self) -> Vec<BackupRecord> { self.state.lock().await.backups.clone() }
}

#[async_trait]
impl InventoryStore for InMemoryStore {
    async fn reserve(&self, order_id: OrderId, request: ReservationRequest, currency: &str) -> Result<Order, StoreError> {
        let mut state = self.state.lock().await;
        let mut working = state.products.clone();
        let lines = reserve_items(&mut working, &request.items)?;
        let order = Order::place(order_id, request.customer, lines, currency)
            .map_err(|e| StoreError::InvalidOrder(e.to_string()))?;
        state.products = working;
        state.orders.insert(order.id().clone(), order.clone());
        Ok(order)
    }

    async fn find_product(&self, product: &ProductRef) -> Result<Option<Product>, StoreError> {
        let state = self.state.lock().await;
        Ok(match product {
            ProductRef::Id(id) => state.products.get(id).cloned(),
            ProductRef::Code(code) => state.products.values().find(|p| p.code() == code).cloned(),
        })
    }
}

#[async_trait]
impl OrderStore for InMemoryStore {
    async fn get(&self, id: &OrderId) -> Result<Option<Order>, StoreError> {
        Ok(self.state.lock().await.orders.get(id).cloned())
    }

    async fn apply_status(&self, change: &StatusChange) -> Result<ApplyOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let Some(order) = state.orders.get_mut(&change.order_id) else { return Ok(ApplyOutcome::NotFound) };
        Ok(match order.apply_status(change.target, change.external_record_id.as_deref()) {
            Transition::Applied => ApplyOutcome::Applied,
            Transition::Unchanged => ApplyOutcome::Unchanged,
            Transition::Rejected => ApplyOutcome::Rejected { current: order.status() },
        })
    }
}

#[async_trait]
impl BackupStore for InMemoryStore {
    async fn insert(&self, record: &BackupRecord) -> Result<(), StoreError> {
        self.state.lock().await.backups.push(record.clone());
        Ok(())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.backups.len();
        state.backups.retain(|b| b.received_at >= cutoff);
        Ok((before - state.backups.len()) as u64)
    }
}

#[async_trait]
impl QuarantineStore for InMemoryStore {
    async fn quarantine(&self, entry: &QuarantineEntry) -> Result<(), StoreError> {
        self.state.lock().await.quarantine.push(entry.clone());
        Ok(())
    }

    async fn list_pending(&self) -> Result<Vec<QuarantineEntry>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.quarantine.iter().filter(|e| e.status == QuarantineStatus::Pending).cloned().collect())
    }

    async fn get(&self, id: Uuid) -> Result<Option<QuarantineEntry>, StoreError> {
        Ok(self.state.lock().await.quarantine.iter().find(|e| e.id == id).cloned())
    }

    async fn mark_replayed(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.quarantine.iter_mut().find(|e| e.id == id && e.status == QuarantineStatus::Pending) {
            Some(entry) => {
                entry.status = QuarantineStatus::Replayed;
                entry.replayed_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::{Customer, OrderStatus};
    use crate::domain::value_objects::{ProductCode, Quantity};
    use rust_decimal::Decimal;

    fn store() -> InMemoryStore {
        InMemoryStore::with_products([
            Product::create(ProductCode::new("A").unwrap(), "Alpha", Decimal::new(100, 1), 10),
            Product::create(ProductCode::new("B").unwrap(), "Beta", Decimal::new(50, 1), 2),
        ])
    }

    fn request(items: &[(&str, u32)]) -> ReservationRequest {
        ReservationRequest {
            items: items.iter().map(|(code, qty)| RequestedItem {
                product_id: ProductRef::Code(ProductCode::new(*code).unwrap()),
                quantity: Quantity::new(*qty).unwrap(),
            }).collect(),
            customer: Customer { first_name: "Jan".into(), last_name: "Peeters".into(), email: "jan@example.com".into(), ..Customer::default() },
        }
    }

    async fn stock(store: &InMemoryStore, code: &str) -> u32 {
        store.find_product(&ProductRef::Code(ProductCode::new(code).unwrap())).await.unwrap().unwrap().stock()
    }

    #[tokio::test]
    async fn test_failed_item_rolls_back_earlier_items() {
        let store = store();
        let err = store.reserve(OrderId::generate(), request(&[("A", 4), ("B", 3)]), "EUR").await.unwrap_err();
        assert!(matches!(err, StoreError::InsufficientStock { ref product, .. } if product == "B"));
        assert_eq!(stock(&store, "A").await, 10);
        assert_eq!(stock(&store, "B").await, 2);
    }

    #[tokio::test]
    async fn test_reserve_persists_pending_order() {
        let store = store();
        let id = OrderId::generate();
        let order = store.reserve(id.clone(), request(&[("A", 2), ("B", 1)]), "EUR").await.unwrap();
        assert_eq!(order.total().amount(), Decimal::new(25, 0));
        assert_eq!(stock(&store, "A").await, 8);
        let stored = OrderStore::get(&store, &id).await.unwrap().unwrap();
        assert_eq!(stored.status(), OrderStatus::Pending);
    }

    #[tokio::test]
    async fn test_apply_status_outcomes() {
        let store = store();
        let id = OrderId::generate();
        store.reserve(id.clone(), request(&[("A", 1)]), "EUR").await.unwrap();
        let change = |target| StatusChange { order_id: id.clone(), target, external_record_id: Some("006X".into()) };
        assert_eq!(store.apply_status(&change(OrderStatus::Completed)).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(
            store.apply_status(&change(OrderStatus::Processing)).await.unwrap(),
            ApplyOutcome::Rejected { current: OrderStatus::Completed }
        );
        let missing = StatusChange { order_id: OrderId::new("nope"), target: OrderStatus::Processing, external_record_id: None };
        assert_eq!(store.apply_status(&missing).await.unwrap(), ApplyOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_quarantine_replay_is_single_shot() {
        let store = InMemoryStore::new();
        let entry = QuarantineEntry::new(Some("o-1".into()), b"sealed".to_vec(), "crm down");
        store.quarantine(&entry).await.unwrap();
        assert_eq!(store.list_pending().await.unwrap().len(), 1);
        assert!(store.mark_replayed(entry.id).await.unwrap());
        assert!(!store.mark_replayed(entry.id).await.unwrap());
        assert!(store.list_pending().await.unwrap().is_empty());
    }
}
