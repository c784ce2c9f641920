//! Postgres-backed stores.
//!
//! Reservation locks every referenced product row with `SELECT ... FOR UPDATE`
//! in id order, applies the decrements in memory through the `Product`
//! aggregate, then writes stock, order and items before committing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;
use crate::domain::aggregates::{Customer, LineItem, Order, OrderStatus, Product, Transition};
use crate::domain::value_objects::{Money, OrderId, ProductCode, Quantity};
use super::*;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self { Self { pool } }
}

#[derive(sqlx::FromRow)]
struct ProductRow { id: Uuid, code: String, name: String, unit_price: Decimal, stock: i32 }

impl TryFrom<ProductRow> for Product {
    type Error = StoreError;
    fn try_from(row: ProductRow) -> Result<Self, StoreError> {
        let code = ProductCode::new(row.code).map_err(|e| StoreError::Database(format!("product {}: {e}", row.id)))?;
        let stock = u32::try_from(row.stock).map_err(|_| StoreError::Database(format!("product {} has negative stock", row.id)))?;
        Ok(Product::new(row.id, code, row.name, row.unit_price, stock))
    }
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: String, customer: Json<Customer>, total: Decimal, currency: String, status: String,
    external_record_id: Option<String>, created_at: DateTime<Utc>, updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct OrderItemRow { product_id: Uuid, product_code: String, name: String, quantity: i32, unit_price: Decimal, line_total: Decimal }

impl TryFrom<OrderItemRow> for LineItem {
    type Error = StoreError;
    fn try_from(row: OrderItemRow) -> Result<Self, StoreError> {
        let corrupt = |what: &str| StoreError::Database(format!("order item for {}: {what}", row.product_code));
        Ok(LineItem {
            product_id: row.product_id,
            product_code: ProductCode::new(row.product_code.clone()).map_err(|e| corrupt(&e.to_string()))?,
            name: row.name,
            quantity: u32::try_from(row.quantity).ok().and_then(|q| Quantity::new(q).ok()).ok_or_else(|| corrupt("bad quantity"))?,
            unit_price: row.unit_price,
            line_total: row.line_total,
        })
    }
}

fn parse_status(raw: &str) -> Result<OrderStatus, StoreError> {
    OrderStatus::parse(raw).ok_or_else(|| StoreError::Database(format!("unknown order status '{raw}'")))
}

fn to_i32(value: u32) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::Database(format!("{value} exceeds column range")))
}

// =============================================================================
// Inventory
// =============================================================================

#[async_trait]
impl InventoryStore for PgStore {
    async fn reserve(&self, order_id: OrderId, request: ReservationRequest, currency: &str) -> Result<Order, StoreError> {
        let mut ids = Vec::new();
        let mut codes = Vec::new();
        for item in &request.items {
            match &item.product_id {
                ProductRef::Id(id) => ids.push(*id),
                ProductRef::Code(code) => codes.push(code.as_str().to_string()),
            }
        }

        let mut tx = self.pool.begin().await?;
        let rows: Vec<ProductRow> = sqlx::query_as(
            "SELECT id, code, name, unit_price, stock FROM products WHERE id = ANY($1) OR code = ANY($2) ORDER BY id FOR UPDATE",
        )
        .bind(&ids).bind(&codes)
        .fetch_all(&mut *tx).await?;

        let mut catalog = rows.into_iter().map(|r| Product::try_from(r).map(|p| (p.id(), p))).collect::<Result<HashMap<_, _>, _>>()?;
        let before: HashMap<Uuid, u32> = catalog.iter().map(|(id, p)| (*id, p.stock())).collect();
        // Returning early drops `tx`, which rolls back the row locks.
        let lines = reserve_items(&mut catalog, &request.items)?;
        let order = Order::place(order_id, request.customer, lines, currency).map_err(|e| StoreError::InvalidOrder(e.to_string()))?;

        for product in catalog.values().filter(|p| before.get(&p.id()) != Some(&p.stock())) {
            sqlx::query("UPDATE products SET stock = $2, updated_at = NOW() WHERE id = $1")
                .bind(product.id()).bind(to_i32(product.stock())?)
                .execute(&mut *tx).await?;
        }

        sqlx::query("INSERT INTO orders (id, customer, total, currency, status, created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7)")
            .bind(order.id().as_str()).bind(Json(order.customer())).bind(order.total().amount()).bind(order.total().currency())
            .bind(order.status().as_str()).bind(order.created_at()).bind(order.updated_at())
            .execute(&mut *tx).await?;
        for (position, item) in order.items().iter().enumerate() {
            sqlx::query("INSERT INTO order_items (order_id, position, product_id, product_code, name, quantity, unit_price, line_total) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)")
                .bind(order.id().as_str()).bind(to_i32(position as u32)?).bind(item.product_id).bind(item.product_code.as_str())
                .bind(&item.name).bind(to_i32(item.quantity.value())?).bind(item.unit_price).bind(item.line_total)
                .execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(order)
    }

    async fn find_product(&self, product: &ProductRef) -> Result<Option<Product>, StoreError> {
        let row: Option<ProductRow> = match product {
            ProductRef::Id(id) => sqlx::query_as("SELECT id, code, name, unit_price, stock FROM products WHERE id = $1")
                .bind(id).fetch_optional(&self.pool).await?,
            ProductRef::Code(code) => sqlx::query_as("SELECT id, code, name, unit_price, stock FROM products WHERE code = $1")
                .bind(code.as_str()).fetch_optional(&self.pool).await?,
        };
        row.map(Product::try_from).transpose()
    }
}

// =============================================================================
// Orders
// =============================================================================

#[async_trait]
impl OrderStore for PgStore {
    async fn get(&self, id: &OrderId) -> Result<Option<Order>, StoreError> {
        let Some(row) = sqlx::query_as::<_, OrderRow>(
            "SELECT id, customer, total, currency, status, external_record_id, created_at, updated_at FROM orders WHERE id = $1",
        )
        .bind(id.as_str()).fetch_optional(&self.pool).await? else { return Ok(None) };

        let items = sqlx::query_as::<_, OrderItemRow>(
            "SELECT product_id, product_code, name, quantity, unit_price, line_total FROM order_items WHERE order_id = $1 ORDER BY position",
        )
        .bind(id.as_str()).fetch_all(&self.pool).await?
        .into_iter().map(LineItem::try_from).collect::<Result<Vec<_>, _>>()?;

        Ok(Some(Order::restore(
            OrderId::new(row.id), row.customer.0, items, Money::new(row.total, &row.currency),
            parse_status(&row.status)?, row.external_record_id, row.created_at, row.updated_at,
        )))
    }

    async fn apply_status(&self, change: &StatusChange) -> Result<ApplyOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let current: Option<(String,)> = sqlx::query_as("SELECT status FROM orders WHERE id = $1 FOR UPDATE")
            .bind(change.order_id.as_str()).fetch_optional(&mut *tx).await?;
        let Some((current,)) = current else { return Ok(ApplyOutcome::NotFound) };
        let current = parse_status(&current)?;

        let outcome = match current.transition(change.target) {
            Transition::Applied => {
                sqlx::query("UPDATE orders SET status = $2, external_record_id = COALESCE($3, external_record_id), updated_at = NOW() WHERE id = $1")
                    .bind(change.order_id.as_str()).bind(change.target.as_str()).bind(change.external_record_id.as_deref())
                    .execute(&mut *tx).await?;
                ApplyOutcome::Applied
            }
            Transition::Unchanged => ApplyOutcome::Unchanged,
            Transition::Rejected => ApplyOutcome::Rejected { current },
        };
        tx.commit().await?;
        Ok(outcome)
    }
}

// =============================================================================
// Backups
// =============================================================================

#[async_trait]
impl BackupStore for PgStore {
    async fn insert(&self, record: &BackupRecord) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO order_backups (id, correlation_id, raw_envelope, received_at) VALUES ($1, $2, $3, $4)")
            .bind(record.id).bind(&record.correlation_id).bind(&record.raw_envelope).bind(record.received_at)
            .execute(&self.pool).await?;
        Ok(())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM order_backups WHERE received_at < $1").bind(cutoff).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

// =============================================================================
// Quarantine
// =============================================================================

#[derive(sqlx::FromRow)]
struct QuarantineRow {
    id: Uuid, order_id: Option<String>, raw_envelope: Vec<u8>, reason: String, status: String,
    created_at: DateTime<Utc>, replayed_at: Option<DateTime<Utc>>,
}

impl TryFrom<QuarantineRow> for QuarantineEntry {
    type Error = StoreError;
    fn try_from(row: QuarantineRow) -> Result<Self, StoreError> {
        let status = QuarantineStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Database(format!("unknown quarantine status '{}'", row.status)))?;
        Ok(QuarantineEntry {
            id: row.id, order_id: row.order_id, raw_envelope: row.raw_envelope, reason: row.reason,
            status, created_at: row.created_at, replayed_at: row.replayed_at,
        })
    }
}

const QUARANTINE_COLUMNS: &str = "id, order_id, raw_envelope, reason, status, created_at, replayed_at";

#[async_trait]
impl QuarantineStore for PgStore {
    async fn quarantine(&self, entry: &QuarantineEntry) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO crm_quarantine (id, order_id, raw_envelope, reason, status, created_at) VALUES ($1, $2, $3, $4, $5, $6)")
            .bind(entry.id).bind(&entry.order_id).bind(&entry.raw_envelope).bind(&entry.reason)
            .bind(entry.status.as_str()).bind(entry.created_at)
            .execute(&self.pool).await?;
        Ok(())
    }

    async fn list_pending(&self) -> Result<Vec<QuarantineEntry>, StoreError> {
        let sql = format!("SELECT {QUARANTINE_COLUMNS} FROM crm_quarantine WHERE status = 'pending' ORDER BY created_at");
        sqlx::query_as::<_, QuarantineRow>(&sql).fetch_all(&self.pool).await?
            .into_iter().map(QuarantineEntry::try_from).collect()
    }

    async fn get(&self, id: Uuid) -> Result<Option<QuarantineEntry>, StoreError> {
        let sql = format!("SELECT {QUARANTINE_COLUMNS} FROM crm_quarantine WHERE id = $1");
        sqlx::query_as::<_, QuarantineRow>(&sql).bind(id).fetch_optional(&self.pool).await?
            .map(QuarantineEntry::try_from).transpose()
    }

    async fn mark_replayed(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE crm_quarantine SET status = 'replayed', replayed_at = NOW() WHERE id = $1 AND status = 'pending'")
            .bind(id).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }
}
