//! Product Aggregate
//!
//! Only the inventory reservation path mutates `stock`.

use rust_decimal::Decimal;
use uuid::Uuid;
use crate::domain::value_objects::{ProductCode, Quantity};

#[derive(Clone, Debug, PartialEq)]
pub struct Product {
    id: Uuid,
    code: ProductCode,
    name: String,
    unit_price: Decimal,
    stock: u32,
}

impl Product {
    pub fn new(id: Uuid, code: ProductCode, name: impl Into<String>, unit_price: Decimal, stock: u32) -> Self {
        Self { id, code, name: name.into(), unit_price, stock }
    }

    pub fn create(code: ProductCode, name: impl Into<String>, unit_price: Decimal, stock: u32) -> Self {
        Self::new(Uuid::new_v4(), code, name, unit_price, stock)
    }

    pub fn id(&self) -> Uuid { self.id }
    pub fn code(&self) -> &ProductCode { &self.code }
    pub fn name(&self) -> &str { &self.name }
    pub fn unit_price(&self) -> Decimal { self.unit_price }
    pub fn stock(&self) -> u32 { self.stock }

    /// Decrements stock by exactly `qty` or leaves it untouched.
    pub fn reserve(&mut self, qty: Quantity) -> Result<(), ProductError> {
        let remaining = self.stock.checked_sub(qty.value()).ok_or(ProductError::InsufficientStock {
            available: self.stock,
            requested: qty.value(),
        })?;
        self.stock = remaining;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProductError {
    #[error("insufficient stock: {available} available, {requested} requested")]
    InsufficientStock { available: u32, requested: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widget(stock: u32) -> Product {
        Product::create(ProductCode::new("W-1").unwrap(), "Widget", Decimal::new(10, 0), stock)
    }

    #[test]
    fn test_reserve_decrements_exactly() {
        let mut p = widget(5);
        p.reserve(Quantity::new(3).unwrap()).unwrap();
        assert_eq!(p.stock(), 2);
        p.reserve(Quantity::new(2).unwrap()).unwrap();
        assert_eq!(p.stock(), 0);
    }

    #[test]
    fn test_reserve_rejects_without_partial_decrement() {
        let mut p = widget(2);
        let err = p.reserve(Quantity::new(3).unwrap()).unwrap_err();
        assert_eq!(err, ProductError::InsufficientStock { available: 2, requested: 3 });
        assert_eq!(p.stock(), 2);
    }
}
