//! Message broker abstraction and the fixed order-distribution topology.
//!
//! One fanout exchange feeds the backup, ERP and CRM queues. The CRM queue
//! dead-letters (on reject or TTL expiry) into its own queue, and the response
//! queue is addressed directly by consumers reporting status back.

pub mod jetstream;
pub mod memory;

pub use jetstream::{connect_with_backoff, JetStreamBroker};
pub use memory::InMemoryBroker;

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("topology error: {0}")]
    Topology(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("consume failed: {0}")]
    Consume(String),
    #[error("acknowledgement failed: {0}")]
    Settle(String),
}

// =============================================================================
// Topology
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName { Backup, Erp, Crm, CrmDeadLetter, Response }

impl QueueName {
    pub const ALL: [QueueName; 5] = [Self::Backup, Self::Erp, Self::Crm, Self::CrmDeadLetter, Self::Response];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Backup => "order.backup",
            Self::Erp => "order.erp",
            Self::Crm => "order.crm",
            Self::CrmDeadLetter => "order.crm.dlq",
            Self::Response => "order.status",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: QueueName,
    /// Receives a copy of every message published to the exchange.
    pub bound: bool,
    pub dead_letter: Option<QueueName>,
    pub message_ttl: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: &'static str,
    pub queues: Vec<QueueSpec>,
}

impl Topology {
    pub const EXCHANGE: &'static str = "orders.fanout";

    pub fn standard(dead_letter_ttl: Duration) -> Self {
        let plain = |name, bound| QueueSpec { name, bound, dead_letter: None, message_ttl: None };
        Self {
            exchange: Self::EXCHANGE,
            queues: vec![
                plain(QueueName::Backup, true),
                plain(QueueName::Erp, true),
                QueueSpec {
                    name: QueueName::Crm,
                    bound: true,
                    dead_letter: Some(QueueName::CrmDeadLetter),
                    message_ttl: Some(dead_letter_ttl),
                },
                plain(QueueName::CrmDeadLetter, false),
                plain(QueueName::Response, false),
            ],
        }
    }

    pub fn queue(&self, name: QueueName) -> Option<&QueueSpec> {
        self.queues.iter().find(|q| q.name == name)
    }

    pub fn bound_queues(&self) -> impl Iterator<Item = &QueueSpec> {
        self.queues.iter().filter(|q| q.bound)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Exchange,
    Queue(QueueName),
}

// =============================================================================
// Deliveries
// =============================================================================

/// Outcome a handler chooses for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Put the message back for another attempt.
    Requeue,
    /// Drop the message, or move it to the queue's dead-letter target if it has one.
    Reject,
}

#[async_trait]
pub trait Acker: Send + Sync {
    async fn settle(&mut self, disposition: Disposition) -> Result<(), BrokerError>;
}

pub struct Delivery {
    payload: Vec<u8>,
    queue: QueueName,
    attempt: u32,
    acker: Box<dyn Acker>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("attempt", &self.attempt)
            .field("len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

impl Delivery {
    pub fn new(payload: Vec<u8>, queue: QueueName, attempt: u32, acker: Box<dyn Acker>) -> Self {
        Self { payload, queue, attempt, acker }
    }

    pub fn payload(&self) -> &[u8] { &self.payload }
    pub fn queue(&self) -> QueueName { self.queue }
    /// 1 on first delivery, incremented on every redelivery.
    pub fn attempt(&self) -> u32 { self.attempt }

    pub async fn settle(mut self, disposition: Disposition) -> Result<(), BrokerError> {
        self.acker.settle(disposition).await
    }
}

pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Idempotent; safe to call on every start and every reconnect.
    async fn declare(&self, topology: &Topology) -> Result<(), BrokerError>;
    /// Persistent publish. Fails with [`BrokerError::Unavailable`] while disconnected.
    async fn publish(&self, target: Target, payload: Vec<u8>) -> Result<(), BrokerError>;
    async fn consume(&self, queue: QueueName) -> Result<DeliveryStream, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_topology_shape() {
        let topology = Topology::standard(Duration::from_secs(60));
        let bound: Vec<_> = topology.bound_queues().map(|q| q.name).collect();
        assert_eq!(bound, vec![QueueName::Backup, QueueName::Erp, QueueName::Crm]);
        let crm = topology.queue(QueueName::Crm).unwrap();
        assert_eq!(crm.dead_letter, Some(QueueName::CrmDeadLetter));
        assert_eq!(crm.message_ttl, Some(Duration::from_secs(60)));
        assert!(!topology.queue(QueueName::Response).unwrap().bound);
        assert_eq!(topology.queues.len(), QueueName::ALL.len());
    }
}
