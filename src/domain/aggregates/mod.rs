//! Aggregates module
pub mod product;
pub mod order;

pub use product::{Product, ProductError};
pub use order::{Customer, LineItem, Order, OrderError, OrderStatus, Transition};
