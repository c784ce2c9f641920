//! Producers: the order event onto the fanout exchange, status updates onto
//! the response queue. Both seal their payload with the shared envelope codec.

use chrono::Utc;
use std::sync::Arc;
use crate::broker::{Broker, QueueName, Target};
use crate::codec::EnvelopeCodec;
use crate::domain::aggregates::Order;
use crate::domain::events::{OrderEvent, StatusUpdate};
use crate::PipelineError;

#[derive(Clone)]
pub struct OrderPublisher {
    broker: Arc<dyn Broker>,
    codec: EnvelopeCodec,
}

impl OrderPublisher {
    pub fn new(broker: Arc<dyn Broker>, codec: EnvelopeCodec) -> Self { Self { broker, codec } }

    /// Publishes exactly one persistent message for `order`.
    pub async fn publish_order(&self, order: &Order) -> Result<OrderEvent, PipelineError> {
        let event = OrderEvent::from_order(order, Utc::now());
        let sealed = self.codec.encrypt(&event.encode()?)?;
        self.broker.publish(Target::Exchange, sealed).await?;
        tracing::info!(order_id = %event.order_id, items = event.items.len(), total = %event.total_amount, "Order event published");
        Ok(event)
    }

    /// Re-publishes an already sealed envelope straight to `queue`.
    pub async fn republish_raw(&self, queue: QueueName, sealed: Vec<u8>) -> Result<(), PipelineError> {
        self.broker.publish(Target::Queue(queue), sealed).await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct StatusReporter {
    broker: Arc<dyn Broker>,
    codec: EnvelopeCodec,
}

impl StatusReporter {
    pub fn new(broker: Arc<dyn Broker>, codec: EnvelopeCodec) -> Self { Self { broker, codec } }

    pub async fn report(&self, update: &StatusUpdate) -> Result<(), PipelineError> {
        let sealed = self.codec.encrypt(&update.encode()?)?;
        self.broker.publish(Target::Queue(QueueName::Response), sealed).await?;
        tracing::info!(order_id = %update.order_id, status = ?update.status, external_record_id = %update.external_record_id, "Status update published");
        Ok(())
    }
}
