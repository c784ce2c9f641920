//! Order Relay
//!
//! Order intake with atomic stock reservation, encrypted fan-out of the
//! resulting order event, and asynchronous status reconciliation.
//!
//! ## Pipeline
//! - Intake reserves stock and publishes one sealed `OrderEvent`
//! - The fanout exchange copies it to the backup, ERP and CRM queues
//! - The backup consumer persists the raw envelope for retention
//! - The ERP consumer writes IDoc-style documents
//! - The CRM consumer creates contact, deal and line items, then reports back
//! - The poller reports won deals; the reconciler folds reports into order status

pub mod api;
pub mod broker;
pub mod codec;
pub mod config;
pub mod consumers;
pub mod crm;
pub mod domain;
pub mod erp;
pub mod intake;
pub mod publisher;
pub mod retry;
pub mod store;

use thiserror::Error;
use crate::broker::BrokerError;
use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::crm::CrmError;
use crate::domain::events::PayloadError;
use crate::store::StoreError;

// =============================================================================
// Error Types
// =============================================================================

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("insufficient stock for product {product}: {available} available, {requested} requested")]
    InsufficientStock { product: String, available: u32, requested: u32 },

    #[error(transparent)]
    Decryption(#[from] CodecError),

    #[error(transparent)]
    ExternalSystem(#[from] CrmError),

    #[error(transparent)]
    BrokerConnectivity(#[from] BrokerError),

    #[error("mapping error: {0}")]
    Mapping(String),

    #[error(transparent)]
    InvalidPayload(#[from] PayloadError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InsufficientStock { product, available, requested } => {
                Self::InsufficientStock { product, available, requested }
            }
            StoreError::UnknownProduct(product) => Self::Validation(format!("unknown product {product}")),
            StoreError::InvalidOrder(reason) => Self::Validation(reason),
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Database(reason) => Self::Storage(reason),
        }
    }
}

impl PipelineError {
    /// Whether the same call may succeed later without any change to its input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BrokerConnectivity(_) | Self::Storage(_) | Self::ExternalSystem(_))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_keep_their_meaning() {
        let err: PipelineError = StoreError::InsufficientStock { product: "A".into(), available: 2, requested: 3 }.into();
        assert!(matches!(err, PipelineError::InsufficientStock { ref product, available: 2, requested: 3 } if product == "A"));
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("product A"));

        let err: PipelineError = StoreError::Database("connection reset".into()).into();
        assert!(err.is_retryable());
        assert!(matches!(PipelineError::from(StoreError::UnknownProduct("Z".into())), PipelineError::Validation(_)));
    }

    #[test]
    fn test_broker_errors_are_retryable() {
        let err: PipelineError = BrokerError::Unavailable("connection refused".into()).into();
        assert!(err.is_retryable());
    }
}
