//! Folds status updates from the response queue into the local order record.

use async_trait::async_trait;
use std::sync::Arc;
use crate::broker::Delivery;
use crate::codec::EnvelopeCodec;
use crate::domain::events::StatusUpdate;
use crate::store::{ApplyOutcome, OrderStore, StatusChange};
use crate::PipelineError;
use super::{Disposition, MessageHandler};

pub struct StatusReconciler {
    orders: Arc<dyn OrderStore>,
    codec: EnvelopeCodec,
    max_attempts: u32,
}

impl StatusReconciler {
    pub fn new(orders: Arc<dyn OrderStore>, codec: EnvelopeCodec, max_attempts: u32) -> Self {
        Self { orders, codec, max_attempts: max_attempts.max(1) }
    }

    fn decode(&self, payload: &[u8]) -> Result<StatusUpdate, PipelineError> {
        Ok(StatusUpdate::decode(&self.codec.decrypt(payload)?)?)
    }
}

#[async_trait]
impl MessageHandler for StatusReconciler {
    fn name(&self) -> &'static str { "status-reconciler" }

    async fn handle(&self, delivery: &Delivery) -> Disposition {
        let update = match self.decode(delivery.payload()) {
            Ok(update) => update,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring undecodable status update");
                return Disposition::Ack;
            }
        };
        let change = StatusChange {
            order_id: update.order_id.clone(),
            target: update.target_status(),
            external_record_id: Some(update.external_record_id.clone()).filter(|id| !id.is_empty()),
        };

        match self.orders.apply_status(&change).await {
            Ok(ApplyOutcome::Applied) => {
                tracing::info!(order_id = %change.order_id, status = %change.target, "Order status updated");
                Disposition::Ack
            }
            Ok(ApplyOutcome::Unchanged) => {
                tracing::debug!(order_id = %change.order_id, status = %change.target, "Status already applied");
                Disposition::Ack
            }
            Ok(ApplyOutcome::Rejected { current }) => {
                tracing::info!(order_id = %change.order_id, current = %current, requested = %change.target, "Ignoring backwards status transition");
                Disposition::Ack
            }
            Ok(ApplyOutcome::NotFound) => {
                tracing::warn!(order_id = %change.order_id, "Status update for unknown order");
                Disposition::Ack
            }
            Err(e) if delivery.attempt() < self.max_attempts => {
                tracing::warn!(order_id = %change.order_id, attempt = delivery.attempt(), error = %e, "Status write failed; requeueing");
                Disposition::Requeue
            }
            Err(e) => {
                tracing::error!(order_id = %change.order_id, error = %e, "Status write failed permanently");
                Disposition::Reject
            }
        }
    }
}
