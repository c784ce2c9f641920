//! Compliance backup: keeps every raw envelope, decodable or not.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use crate::broker::Delivery;
use crate::codec::EnvelopeCodec;
use crate::store::{BackupRecord, BackupStore, StoreError, UNKNOWN_CORRELATION};
use super::{Disposition, MessageHandler};

/// Only the correlation id is needed here, so a payload that fails full
/// schema validation still yields one.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CorrelationPeek {
    order_id: String,
}

pub struct BackupConsumer {
    store: Arc<dyn BackupStore>,
    codec: EnvelopeCodec,
    max_attempts: u32,
}

impl BackupConsumer {
    pub fn new(store: Arc<dyn BackupStore>, codec: EnvelopeCodec, max_attempts: u32) -> Self {
        Self { store, codec, max_attempts: max_attempts.max(1) }
    }

    fn correlation_id(&self, payload: &[u8]) -> String {
        let plaintext = match self.codec.decrypt(payload) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                tracing::warn!(error = %e, "Backup payload not decryptable; storing with placeholder id");
                return UNKNOWN_CORRELATION.to_string();
            }
        };
        serde_json::from_slice::<CorrelationPeek>(&plaintext)
            .ok()
            .map(|p| p.order_id)
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| UNKNOWN_CORRELATION.to_string())
    }
}

#[async_trait]
impl MessageHandler for BackupConsumer {
    fn name(&self) -> &'static str { "backup" }

    async fn handle(&self, delivery: &Delivery) -> Disposition {
        let record = BackupRecord::new(self.correlation_id(delivery.payload()), delivery.payload().to_vec(), Utc::now());
        match self.store.insert(&record).await {
            Ok(()) => {
                tracing::info!(correlation_id = %record.correlation_id, "Envelope backed up");
                Disposition::Ack
            }
            Err(e) if delivery.attempt() < self.max_attempts => {
                tracing::warn!(correlation_id = %record.correlation_id, attempt = delivery.attempt(), error = %e, "Backup write failed; requeueing");
                Disposition::Requeue
            }
            Err(e) => {
                tracing::error!(
                    correlation_id = %record.correlation_id, attempt = delivery.attempt(), error = %e,
                    "Backup write failed permanently; envelope not retained"
                );
                Disposition::Reject
            }
        }
    }
}

/// Deletes backups received more than `retention_days` ago.
pub async fn sweep_once(store: &dyn BackupStore, retention_days: u32) -> Result<u64, StoreError> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
    let purged = store.purge_older_than(cutoff).await?;
    tracing::info!(purged, retention_days, %cutoff, "Backup retention sweep finished");
    Ok(purged)
}

/// Runs [`sweep_once`] immediately and then every `interval` until `shutdown`.
pub async fn run_retention_sweep(
    store: Arc<dyn BackupStore>,
    retention_days: u32,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = sweep_once(store.as_ref(), retention_days).await {
                    tracing::error!(error = %e, "Backup retention sweep failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Acker, BrokerError, QueueName};
    use crate::store::InMemoryStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct NoopAcker;

    #[async_trait]
    impl Acker for NoopAcker {
        async fn settle(&mut self, _disposition: Disposition) -> Result<(), BrokerError> { Ok(()) }
    }

    fn delivery(payload: &[u8], attempt: u32) -> Delivery {
        Delivery::new(payload.to_vec(), QueueName::Backup, attempt, Box::new(NoopAcker))
    }

    struct FlakyStore { down: AtomicBool }

    #[async_trait]
    impl BackupStore for FlakyStore {
        async fn insert(&self, _record: &BackupRecord) -> Result<(), StoreError> {
            if self.down.load(Ordering::SeqCst) { Err(StoreError::Database("disk full".into())) } else { Ok(()) }
        }
        async fn purge_older_than(&self, _cutoff: chrono::DateTime<Utc>) -> Result<u64, StoreError> { Ok(0) }
    }

    #[tokio::test]
    async fn test_undecryptable_payload_is_kept_with_placeholder() {
        let store = InMemoryStore::new();
        let consumer = BackupConsumer::new(Arc::new(store.clone()), EnvelopeCodec::from_passphrase("k"), 2);
        assert_eq!(consumer.handle(&delivery(b"garbage", 1)).await, Disposition::Ack);

        let sealed = EnvelopeCodec::from_passphrase("k").encrypt(br#"{"orderId":"o-7"}"#).unwrap();
        assert_eq!(consumer.handle(&delivery(&sealed, 1)).await, Disposition::Ack);

        let backups = store.backups().await;
        assert_eq!(backups[0].correlation_id, UNKNOWN_CORRELATION);
        assert_eq!(backups[0].raw_envelope, b"garbage");
        assert_eq!(backups[1].correlation_id, "o-7");
        assert_eq!(backups[1].raw_envelope, sealed);
    }

    #[tokio::test]
    async fn test_write_failure_is_retried_then_surfaced() {
        let store = Arc::new(FlakyStore { down: AtomicBool::new(true) });
        let consumer = BackupConsumer::new(store, EnvelopeCodec::from_passphrase("k"), 2);
        assert_eq!(consumer.handle(&delivery(b"x", 1)).await, Disposition::Requeue);
        assert_eq!(consumer.handle(&delivery(b"x", 2)).await, Disposition::Reject);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired_records() {
        let store = InMemoryStore::new();
        let old = BackupRecord::new("old", vec![1], Utc::now() - chrono::Duration::days(91));
        let fresh = BackupRecord::new("fresh", vec![2], Utc::now() - chrono::Duration::days(89));
        store.insert(&old).await.unwrap();
        store.insert(&fresh).await.unwrap();

        assert_eq!(sweep_once(&store, 90).await.unwrap(), 1);
        let left = store.backups().await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].correlation_id, "fresh");
    }
}
