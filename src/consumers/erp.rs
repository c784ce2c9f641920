//! ERP export consumer. Export is best effort: every delivery is acknowledged,
//! failures are logged and never block the shared exchange.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use crate::broker::Delivery;
use crate::codec::EnvelopeCodec;
use crate::domain::events::OrderEvent;
use crate::erp::{DocumentSink, IdocMapper};
use crate::PipelineError;
use super::{Disposition, MessageHandler};

pub struct ErpExportConsumer {
    codec: EnvelopeCodec,
    mapper: IdocMapper,
    sink: Arc<dyn DocumentSink>,
}

impl ErpExportConsumer {
    pub fn new(codec: EnvelopeCodec, mapper: IdocMapper, sink: Arc<dyn DocumentSink>) -> Self {
        Self { codec, mapper, sink }
    }

    fn decode(&self, payload: &[u8]) -> Result<OrderEvent, PipelineError> {
        Ok(OrderEvent::decode(&self.codec.decrypt(payload)?)?)
    }
}

#[async_trait]
impl MessageHandler for ErpExportConsumer {
    fn name(&self) -> &'static str { "erp-export" }

    async fn handle(&self, delivery: &Delivery) -> Disposition {
        let event = match self.decode(delivery.payload()) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "ERP export skipped undecodable message");
                return Disposition::Ack;
            }
        };

        for document in self.mapper.map(&event, Utc::now()) {
            match self.sink.write(&document).await {
                Ok(()) => tracing::info!(order_id = %event.order_id, file = %document.file_name, "IDoc written"),
                Err(e) => tracing::error!(order_id = %event.order_id, error = %e, "IDoc export failed"),
            }
        }
        Disposition::Ack
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Acker, BrokerError, QueueName};
    use crate::erp::InMemorySink;

    struct NoopAcker;

    #[async_trait]
    impl Acker for NoopAcker {
        async fn settle(&mut self, _disposition: Disposition) -> Result<(), BrokerError> { Ok(()) }
    }

    #[tokio::test]
    async fn test_garbage_is_acknowledged_without_output() {
        let sink = InMemorySink::new();
        let consumer = ErpExportConsumer::new(EnvelopeCodec::from_passphrase("k"), IdocMapper::new("BE"), Arc::new(sink.clone()));
        let delivery = Delivery::new(b"not sealed".to_vec(), QueueName::Erp, 1, Box::new(NoopAcker));
        assert_eq!(consumer.handle(&delivery).await, Disposition::Ack);
        assert!(sink.documents().await.is_empty());
    }

    #[tokio::test]
    async fn test_sealed_event_yields_both_documents() {
        let codec = EnvelopeCodec::from_passphrase("k");
        let event: OrderEvent = serde_json::from_value(serde_json::json!({
            "orderId": "o-7",
            "timestamp": "2026-03-02T08:30:00Z",
            "customer": { "firstName": "Jan", "lastName": "Peeters", "email": "jan@example.com",
                          "street": "Kerkstraat", "houseNumber": "1", "postalCode": "2000" },
            "items": [{ "productCode": "A", "name": "Alpha", "quantity": 1, "unitPrice": "4.50", "lineTotal": "4.50" }],
            "totalAmount": "4.50",
            "currency": "EUR"
        }))
        .unwrap();
        let sink = InMemorySink::new();
        let consumer = ErpExportConsumer::new(codec.clone(), IdocMapper::new("BE"), Arc::new(sink.clone()));
        let sealed = codec.encrypt(&event.encode().unwrap()).unwrap();

        let delivery = Delivery::new(sealed, QueueName::Erp, 1, Box::new(NoopAcker));
        assert_eq!(consumer.handle(&delivery).await, Disposition::Ack);
        let names: Vec<String> = sink.documents().await.into_iter().map(|d| d.file_name).collect();
        assert_eq!(names.len(), 2);
        assert!(names[0].starts_with("ORDERS_o-7_"));
        assert!(names[1].starts_with("DEBMAS_o-7_"));
    }
}
