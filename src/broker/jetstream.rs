//! NATS JetStream transport.
//!
//! The exchange is an interest-retention stream; each bound queue is a durable
//! pull consumer on it, so every queue sees every published message. Queues
//! that are addressed directly (CRM dead-letter, response) get their own
//! work-queue stream. Message TTL is checked at delivery against the
//! `Relay-Enqueued-At` header; expired and rejected messages are republished
//! to the dead-letter stream and terminated on the source.

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, PullConsumer},
    stream::{RetentionPolicy, StorageType},
    AckKind, Context,
};
use async_nats::HeaderMap;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use crate::retry::{retry_with_backoff, RetryError, RetryPolicy};
use super::*;

const ENQUEUED_AT: &str = "Relay-Enqueued-At";

fn stream_name(subject: &str) -> String { subject.replace('.', "_").to_uppercase() }
fn durable_name(queue: QueueName) -> String { queue.as_str().replace('.', "_") }

pub struct JetStreamBroker {
    client: async_nats::Client,
    js: Context,
    topology: RwLock<Option<Topology>>,
}

impl JetStreamBroker {
    pub fn new(client: async_nats::Client) -> Self {
        let js = jetstream::new(client.clone());
        Self { client, js, topology: RwLock::new(None) }
    }

    fn ensure_connected(&self) -> Result<(), BrokerError> {
        match self.client.connection_state() {
            async_nats::connection::State::Connected => Ok(()),
            state => Err(BrokerError::Unavailable(format!("nats connection is {state:?}"))),
        }
    }

    async fn spec(&self, queue: QueueName) -> Result<QueueSpec, BrokerError> {
        self.topology.read().await.as_ref().and_then(|t| t.queue(queue).cloned())
            .ok_or_else(|| BrokerError::Topology(format!("queue {queue} not declared")))
    }
}

/// Connects to NATS, retrying with exponential backoff until `cancel` fires.
pub async fn connect_with_backoff(
    url: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<JetStreamBroker, RetryError<BrokerError>> {
    retry_with_backoff(policy, cancel, "broker connect", move || async move {
        let client = async_nats::connect(url).await.map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        tracing::info!(url, "Connected to NATS");
        Ok(JetStreamBroker::new(client))
    })
    .await
}

async fn publish_persistent(js: &Context, subject: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
    let mut headers = HeaderMap::new();
    headers.insert(ENQUEUED_AT, Utc::now().timestamp_millis().to_string().as_str());
    js.publish_with_headers(subject.to_string(), headers, payload.into())
        .await
        .map_err(|e| BrokerError::Publish(e.to_string()))?
        .await
        .map_err(|e| BrokerError::Publish(e.to_string()))?;
    Ok(())
}

async fn ensure_consumer(stream: &jetstream::stream::Stream, queue: QueueName) -> Result<(), BrokerError> {
    let durable = durable_name(queue);
    stream
        .get_or_create_consumer(&durable, pull::Config {
            durable_name: Some(durable.clone()),
            ack_policy: AckPolicy::Explicit,
            ..Default::default()
        })
        .await
        .map_err(|e| BrokerError::Topology(format!("consumer {durable}: {e}")))?;
    Ok(())
}

fn expired(message: &jetstream::Message, spec: &QueueSpec) -> bool {
    let Some(ttl) = spec.message_ttl else { return false };
    let enqueued_at = message.headers.as_ref()
        .and_then(|h| h.get(ENQUEUED_AT))
        .and_then(|v| v.as_str().parse::<i64>().ok());
    match enqueued_at {
        Some(at) => Utc::now().timestamp_millis().saturating_sub(at) >= ttl.as_millis() as i64,
        None => false,
    }
}

struct JetStreamAcker {
    js: Context,
    dead_letter: Option<QueueName>,
    message: Option<jetstream::Message>,
}

#[async_trait]
impl Acker for JetStreamAcker {
    async fn settle(&mut self, disposition: Disposition) -> Result<(), BrokerError> {
        let message = self.message.take().ok_or_else(|| BrokerError::Settle("delivery already settled".into()))?;
        let result = match disposition {
            Disposition::Ack => message.ack().await,
            Disposition::Requeue => message.ack_with(AckKind::Nak(None)).await,
            Disposition::Reject => {
                if let Some(target) = self.dead_letter {
                    publish_persistent(&self.js, target.as_str(), message.payload.to_vec()).await?;
                }
                message.ack_with(AckKind::Term).await
            }
        };
        result.map_err(|e| BrokerError::Settle(e.to_string()))
    }
}

#[async_trait]
impl Broker for JetStreamBroker {
    async fn declare(&self, topology: &Topology) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        let exchange = self.js
            .get_or_create_stream(jetstream::stream::Config {
                name: stream_name(topology.exchange),
                subjects: vec![topology.exchange.to_string()],
                retention: RetentionPolicy::Interest,
                storage: StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Topology(format!("exchange {}: {e}", topology.exchange)))?;

        for spec in &topology.queues {
            if spec.bound {
                ensure_consumer(&exchange, spec.name).await?;
            } else {
                let stream = self.js
                    .get_or_create_stream(jetstream::stream::Config {
                        name: stream_name(spec.name.as_str()),
                        subjects: vec![spec.name.as_str().to_string()],
                        retention: RetentionPolicy::WorkQueue,
                        storage: StorageType::File,
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| BrokerError::Topology(format!("queue {}: {e}", spec.name)))?;
                ensure_consumer(&stream, spec.name).await?;
            }
        }
        *self.topology.write().await = Some(topology.clone());
        tracing::info!(exchange = topology.exchange, queues = topology.queues.len(), "Topology declared");
        Ok(())
    }

    async fn publish(&self, target: Target, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        let subject = match target {
            Target::Exchange => Topology::EXCHANGE,
            Target::Queue(queue) => queue.as_str(),
        };
        publish_persistent(&self.js, subject, payload).await
    }

    async fn consume(&self, queue: QueueName) -> Result<DeliveryStream, BrokerError> {
        self.ensure_connected()?;
        let spec = self.spec(queue).await?;
        let source = if spec.bound { stream_name(Topology::EXCHANGE) } else { stream_name(queue.as_str()) };
        let consumer: PullConsumer = self.js
            .get_stream(&source).await
            .map_err(|e| BrokerError::Consume(e.to_string()))?
            .get_consumer(&durable_name(queue)).await
            .map_err(|e| BrokerError::Consume(e.to_string()))?;
        let messages = consumer.messages().await.map_err(|e| BrokerError::Consume(e.to_string()))?;

        let js = self.js.clone();
        let stream = messages.filter_map(move |next| {
            let js = js.clone();
            let spec = spec.clone();
            async move {
                let message = match next {
                    Ok(message) => message,
                    Err(e) => return Some(Err(BrokerError::Consume(e.to_string()))),
                };
                if expired(&message, &spec) {
                    let mut acker = JetStreamAcker { js, dead_letter: spec.dead_letter, message: Some(message) };
                    if let Err(e) = acker.settle(Disposition::Reject).await {
                        tracing::warn!(queue = %spec.name, error = %e, "Failed to dead-letter expired message");
                    }
                    return None;
                }
                let attempt = message.info().map(|info| info.delivered).unwrap_or(1);
                let payload = message.payload.to_vec();
                let acker = JetStreamAcker { js, dead_letter: spec.dead_letter, message: Some(message) };
                Some(Ok(Delivery::new(payload, spec.name, u32::try_from(attempt).unwrap_or(u32::MAX), Box::new(acker))))
            }
        });
        Ok(Box::pin(stream))
    }
}
