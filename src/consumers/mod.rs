//! Consumer runtime and the per-integration handlers.
//!
//! [`run_consumer`] drives one queue: it pulls deliveries, runs the handler
//! for each on a bounded worker pool, and settles every delivery on its own
//! with the [`Disposition`] the handler returns.

pub mod backup;
pub mod crm;
pub mod erp;
pub mod reconciler;

pub use crate::broker::Disposition;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use crate::broker::{Broker, BrokerError, Delivery, QueueName, Topology};
use crate::retry::{retry_with_backoff, RetryError, RetryPolicy};

#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    async fn handle(&self, delivery: &Delivery) -> Disposition;
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub concurrency: usize,
    pub shutdown_grace: Duration,
    pub reconnect: RetryPolicy,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self { concurrency: 8, shutdown_grace: Duration::from_secs(10), reconnect: RetryPolicy::reconnect() }
    }
}

async fn process(handler: Arc<dyn MessageHandler>, delivery: Delivery) {
    let queue = delivery.queue();
    let attempt = delivery.attempt();
    let disposition = handler.handle(&delivery).await;
    tracing::debug!(queue = %queue, attempt, ?disposition, handler = handler.name(), "Settling delivery");
    if let Err(e) = delivery.settle(disposition).await {
        // Unsettled deliveries are redelivered by the broker.
        tracing::warn!(queue = %queue, error = %e, "Failed to settle delivery");
    }
}

/// Consumes `queue` until `shutdown` fires, then waits up to the grace period
/// for in-flight handlers.
///
/// A failing stream is re-declared and re-subscribed with backoff. Returns an
/// error only when a bounded reconnect policy is exhausted.
pub async fn run_consumer(
    broker: Arc<dyn Broker>,
    topology: Arc<Topology>,
    queue: QueueName,
    handler: Arc<dyn MessageHandler>,
    settings: ConsumerSettings,
    shutdown: CancellationToken,
) -> Result<(), BrokerError> {
    let permits = Arc::new(Semaphore::new(settings.concurrency.max(1)));
    let mut tasks = JoinSet::new();
    let mut outcome = Ok(());

    'subscribe: loop {
        let subscribed = retry_with_backoff(&settings.reconnect, &shutdown, queue.as_str(), || {
            let broker = broker.clone();
            let topology = topology.clone();
            async move {
                broker.declare(&topology).await?;
                broker.consume(queue).await
            }
        })
        .await;
        let mut stream = match subscribed {
            Ok(stream) => stream,
            Err(RetryError::Cancelled) => break,
            Err(RetryError::Exhausted(e)) => {
                outcome = Err(e);
                break;
            }
        };
        tracing::info!(queue = %queue, handler = handler.name(), concurrency = settings.concurrency, "Consumer started");

        loop {
            let permit = tokio::select! {
                () = shutdown.cancelled() => break 'subscribe,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break 'subscribe,
                },
            };
            let next = tokio::select! {
                () = shutdown.cancelled() => break 'subscribe,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(delivery)) => {
                    let handler = handler.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        process(handler, delivery).await;
                    });
                }
                Some(Err(e)) => {
                    tracing::warn!(queue = %queue, error = %e, "Delivery stream failed; resubscribing");
                    tokio::time::sleep(settings.reconnect.initial_delay).await;
                    continue 'subscribe;
                }
                None => {
                    tracing::warn!(queue = %queue, "Delivery stream ended; resubscribing");
                    tokio::time::sleep(settings.reconnect.initial_delay).await;
                    continue 'subscribe;
                }
            }
            while let Some(Some(joined)) = tasks.join_next().now_or_never() {
                if let Err(e) = joined {
                    tracing::error!(queue = %queue, error = %e, "Handler task panicked");
                }
            }
        }
    }

    let in_flight = tasks.len();
    if in_flight > 0 {
        tracing::info!(queue = %queue, in_flight, "Waiting for in-flight handlers");
    }
    let drained = tokio::time::timeout(settings.shutdown_grace, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!(queue = %queue, remaining = tasks.len(), "Grace period elapsed; aborting handlers");
        tasks.abort_all();
    }
    tracing::info!(queue = %queue, "Consumer stopped");
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, Target};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        seen: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for Counting {
        fn name(&self) -> &'static str { "counting" }

        async fn handle(&self, _delivery: &Delivery) -> Disposition {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.seen.fetch_add(1, Ordering::SeqCst);
            Disposition::Ack
        }
    }

    #[tokio::test]
    async fn test_pool_is_bounded_and_drains_on_shutdown() {
        let broker = InMemoryBroker::new();
        let topology = Arc::new(Topology::standard(Duration::from_secs(60)));
        broker.declare(&topology).await.unwrap();
        for i in 0..10u8 {
            broker.publish(Target::Queue(QueueName::Response), vec![i]).await.unwrap();
        }
        let handler = Arc::new(Counting { seen: AtomicUsize::new(0), in_flight: AtomicUsize::new(0), peak: AtomicUsize::new(0) });
        let shutdown = CancellationToken::new();
        let settings = ConsumerSettings { concurrency: 3, ..ConsumerSettings::default() };
        let task = tokio::spawn(run_consumer(
            Arc::new(broker.clone()), topology, QueueName::Response, handler.clone(), settings, shutdown.clone(),
        ));

        for _ in 0..200 {
            if handler.seen.load(Ordering::SeqCst) == 10 { break; }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(handler.seen.load(Ordering::SeqCst), 10);
        assert!(handler.peak.load(Ordering::SeqCst) <= 3);
        assert!(handler.peak.load(Ordering::SeqCst) > 1);
    }
}
