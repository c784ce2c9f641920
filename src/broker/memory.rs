//! In-process broker with the same topology semantics as the JetStream one:
//! fanout copies, competing consumers per queue, requeue, reject to the
//! dead-letter target, TTL expiry checked at delivery, and attempt counting.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use super::*;

struct Envelope {
    payload: Vec<u8>,
    deliveries: u32,
    enqueued_at: Instant,
}

impl Envelope {
    fn fresh(payload: Vec<u8>) -> Self { Self { payload, deliveries: 0, enqueued_at: Instant::now() } }

    fn expired(&self, spec: &QueueSpec) -> bool {
        spec.message_ttl.is_some_and(|ttl| self.enqueued_at.elapsed() >= ttl)
    }
}

struct Queue {
    spec: QueueSpec,
    tx: mpsc::UnboundedSender<Envelope>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Envelope>>>,
}

struct Inner {
    queues: RwLock<HashMap<QueueName, Queue>>,
    available: AtomicBool,
}

#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self { Self::new() }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self { inner: Arc::new(Inner { queues: RwLock::new(HashMap::new()), available: AtomicBool::new(true) }) }
    }

    /// Simulates losing (`false`) or regaining (`true`) the broker connection.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Removes and returns every message currently waiting in `queue`.
    pub async fn drain(&self, queue: QueueName) -> Vec<Vec<u8>> {
        let rx = match self.inner.queues.read().await.get(&queue) {
            Some(q) => q.rx.clone(),
            None => return Vec::new(),
        };
        let mut rx = rx.lock().await;
        let mut drained = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            drained.push(envelope.payload);
        }
        drained
    }

    fn ensure_available(&self) -> Result<(), BrokerError> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("in-memory broker marked unavailable".into()))
        }
    }
}

impl Inner {
    async fn enqueue(&self, name: QueueName, envelope: Envelope) -> Result<(), BrokerError> {
        let queues = self.queues.read().await;
        let queue = queues.get(&name).ok_or_else(|| BrokerError::Topology(format!("queue {name} not declared")))?;
        queue.tx.send(envelope).map_err(|_| BrokerError::Unavailable(format!("queue {name} closed")))
    }

    async fn dead_letter(&self, spec: &QueueSpec, payload: Vec<u8>) -> Result<(), BrokerError> {
        match spec.dead_letter {
            Some(target) => {
                tracing::debug!(queue = %spec.name, dead_letter = %target, "Dead-lettering message");
                self.enqueue(target, Envelope::fresh(payload)).await
            }
            None => {
                tracing::debug!(queue = %spec.name, "Dropping rejected message");
                Ok(())
            }
        }
    }
}

struct MemoryAcker {
    inner: Arc<Inner>,
    spec: QueueSpec,
    envelope: Option<Envelope>,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn settle(&mut self, disposition: Disposition) -> Result<(), BrokerError> {
        let envelope = self.envelope.take().ok_or_else(|| BrokerError::Settle("delivery already settled".into()))?;
        match disposition {
            Disposition::Ack => Ok(()),
            Disposition::Requeue => self.inner.enqueue(self.spec.name, envelope).await,
            Disposition::Reject => self.inner.dead_letter(&self.spec, envelope.payload).await,
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare(&self, topology: &Topology) -> Result<(), BrokerError> {
        self.ensure_available()?;
        let mut queues = self.inner.queues.write().await;
        for spec in &topology.queues {
            if let Some(existing) = queues.get(&spec.name) {
                if existing.spec != *spec {
                    return Err(BrokerError::Topology(format!("queue {} redeclared with different arguments", spec.name)));
                }
                continue;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            queues.insert(spec.name, Queue { spec: spec.clone(), tx, rx: Arc::new(Mutex::new(rx)) });
        }
        Ok(())
    }

    async fn publish(&self, target: Target, payload: Vec<u8>) -> Result<(), BrokerError> {
        self.ensure_available()?;
        match target {
            Target::Exchange => {
                let bound: Vec<QueueName> =
                    self.inner.queues.read().await.values().filter(|q| q.spec.bound).map(|q| q.spec.name).collect();
                for name in bound {
                    self.inner.enqueue(name, Envelope::fresh(payload.clone())).await?;
                }
                Ok(())
            }
            Target::Queue(name) => self.inner.enqueue(name, Envelope::fresh(payload)).await,
        }
    }

    async fn consume(&self, queue: QueueName) -> Result<DeliveryStream, BrokerError> {
        self.ensure_available()?;
        let (spec, rx) = {
            let queues = self.inner.queues.read().await;
            let q = queues.get(&queue).ok_or_else(|| BrokerError::Topology(format!("queue {queue} not declared")))?;
            (q.spec.clone(), q.rx.clone())
        };
        let inner = self.inner.clone();
        let stream = futures::stream::unfold((inner, spec, rx), |(inner, spec, rx)| async move {
            loop {
                let next = rx.lock().await.recv().await;
                let mut envelope = next?;
                if envelope.expired(&spec) {
                    if let Err(e) = inner.dead_letter(&spec, envelope.payload).await {
                        tracing::warn!(queue = %spec.name, error = %e, "Failed to dead-letter expired message");
                    }
                    continue;
                }
                envelope.deliveries += 1;
                let delivery = Delivery::new(
                    envelope.payload.clone(),
                    spec.name,
                    envelope.deliveries,
                    Box::new(MemoryAcker { inner: inner.clone(), spec: spec.clone(), envelope: Some(envelope) }),
                );
                return Some((Ok(delivery), (inner, spec, rx)));
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn broker() -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker.declare(&Topology::standard(Duration::from_secs(60))).await.unwrap();
        broker
    }

    #[tokio::test]
    async fn test_fanout_copies_to_bound_queues_only() {
        let broker = broker().await;
        broker.publish(Target::Exchange, b"m".to_vec()).await.unwrap();
        for queue in [QueueName::Backup, QueueName::Erp, QueueName::Crm] {
            assert_eq!(broker.drain(queue).await, vec![b"m".to_vec()]);
        }
        assert!(broker.drain(QueueName::CrmDeadLetter).await.is_empty());
        assert!(broker.drain(QueueName::Response).await.is_empty());
    }

    #[tokio::test]
    async fn test_redeclare_is_idempotent() {
        let broker = broker().await;
        broker.publish(Target::Queue(QueueName::Response), b"s".to_vec()).await.unwrap();
        broker.declare(&Topology::standard(Duration::from_secs(60))).await.unwrap();
        assert_eq!(broker.drain(QueueName::Response).await.len(), 1);
        assert!(broker.declare(&Topology::standard(Duration::from_secs(5))).await.is_err());
    }

    #[tokio::test]
    async fn test_requeue_counts_attempts_and_reject_dead_letters() {
        let broker = broker().await;
        broker.publish(Target::Exchange, b"m".to_vec()).await.unwrap();
        let mut stream = broker.consume(QueueName::Crm).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.attempt(), 1);
        first.settle(Disposition::Requeue).await.unwrap();

        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.attempt(), 2);
        second.settle(Disposition::Reject).await.unwrap();
        assert_eq!(broker.drain(QueueName::CrmDeadLetter).await, vec![b"m".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_crm_message_moves_to_dead_letter() {
        let broker = broker().await;
        broker.publish(Target::Exchange, b"late".to_vec()).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        broker.publish(Target::Exchange, b"fresh".to_vec()).await.unwrap();

        let mut stream = broker.consume(QueueName::Crm).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.payload(), b"fresh");
        assert_eq!(broker.drain(QueueName::CrmDeadLetter).await, vec![b"late".to_vec()]);
    }

    #[tokio::test]
    async fn test_unavailable_broker_refuses_publish() {
        let broker = broker().await;
        broker.set_available(false);
        assert!(matches!(broker.publish(Target::Exchange, vec![1]).await, Err(BrokerError::Unavailable(_))));
        broker.set_available(true);
        assert!(broker.publish(Target::Exchange, vec![1]).await.is_ok());
    }
}
