//! CRM synchronisation and stage polling.
//!
//! A message from the primary CRM queue that fails is rejected, which moves it
//! to the CRM dead-letter queue. A message from the dead-letter queue that
//! fails again is acknowledged and written to the quarantine store, so it is
//! never redelivered by the broker but can be replayed by an operator.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use crate::broker::{Delivery, QueueName};
use crate::codec::EnvelopeCodec;
use crate::crm::{ContactDraft, CrmClient, DealDraft, DealStage, LineItemDraft, TrackedRecords};
use crate::domain::events::{OrderEvent, StatusKind, StatusUpdate};
use crate::domain::value_objects::OrderId;
use crate::publisher::StatusReporter;
use crate::store::{QuarantineEntry, QuarantineStore};
use crate::PipelineError;
use super::{Disposition, MessageHandler};

/// Quarantine writes are retried this many deliveries before the message is dropped.
const QUARANTINE_WRITE_ATTEMPTS: u32 = 3;

/// A tracked deal absent from this many consecutive polls is no longer tracked.
pub const MISSING_DEAL_POLL_LIMIT: u32 = 3;

pub struct CrmSyncConsumer {
    crm: Arc<dyn CrmClient>,
    codec: EnvelopeCodec,
    reporter: StatusReporter,
    tracked: TrackedRecords,
    quarantine: Arc<dyn QuarantineStore>,
}

impl CrmSyncConsumer {
    pub fn new(
        crm: Arc<dyn CrmClient>,
        codec: EnvelopeCodec,
        reporter: StatusReporter,
        tracked: TrackedRecords,
        quarantine: Arc<dyn QuarantineStore>,
    ) -> Self {
        Self { crm, codec, reporter, tracked, quarantine }
    }

    async fn resolve_contact(&self, event: &OrderEvent) -> Result<String, PipelineError> {
        if let Some(id) = self.crm.find_contact_by_email(&event.customer.email).await? {
            tracing::debug!(order_id = %event.order_id, contact_id = %id, "Reusing CRM contact");
            return Ok(id);
        }
        let id = self.crm.create_contact(&ContactDraft::from(&event.customer)).await?;
        tracing::info!(order_id = %event.order_id, contact_id = %id, "CRM contact created");
        Ok(id)
    }

    /// Creates the deal, or resumes the one an earlier delivery of the same
    /// order created, and attaches every line item not yet on it.
    async fn ensure_deal(&self, event: &OrderEvent, contact_id: &str) -> Result<String, PipelineError> {
        let name = DealDraft::name_for(event.order_id.as_str());
        let (deal_id, mut attached) = match self.crm.find_deal(&name).await? {
            Some(existing) => {
                let attached = self.crm.line_item_entries(&existing).await?;
                tracing::info!(order_id = %event.order_id, deal_id = %existing, attached = attached.len(), "Resuming existing deal");
                (existing, attached)
            }
            None => {
                let created = self.crm.create_deal(&DealDraft::for_order(event, contact_id)).await?;
                tracing::info!(order_id = %event.order_id, deal_id = %created, "CRM deal created");
                (created, HashSet::new())
            }
        };

        for item in &event.items {
            let Some(entry) = self.crm.find_price_entry(&item.product_code).await? else {
                let e = PipelineError::Mapping(format!("no price entry for product {}", item.product_code));
                tracing::warn!(order_id = %event.order_id, deal_id = %deal_id, error = %e, "Skipping line item");
                continue;
            };
            if attached.contains(&entry.id) {
                continue;
            }
            self.crm.add_line_item(&LineItemDraft {
                deal_id: deal_id.clone(),
                price_entry_id: entry.id.clone(),
                quantity: item.quantity.value(),
                unit_price: item.unit_price,
            }).await?;
            attached.insert(entry.id);
        }
        Ok(deal_id)
    }

    async fn sync(&self, payload: &[u8]) -> Result<(OrderId, String), PipelineError> {
        let event = OrderEvent::decode(&self.codec.decrypt(payload)?)?;
        let contact_id = self.resolve_contact(&event).await?;
        let deal_id = self.ensure_deal(&event, &contact_id).await?;
        self.tracked.track(deal_id.clone(), event.order_id.clone()).await;
        let update = StatusUpdate::new(StatusKind::Created, event.order_id.clone(), deal_id.clone(), "CRM deal created");
        self.reporter.report(&update).await?;
        Ok((event.order_id, deal_id))
    }

    /// Best-effort order id for quarantine bookkeeping.
    fn peek_order_id(&self, payload: &[u8]) -> Option<String> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Peek { order_id: String }
        let plaintext = self.codec.decrypt(payload).ok()?;
        serde_json::from_slice::<Peek>(&plaintext).ok().map(|p| p.order_id)
    }

    async fn quarantine(&self, delivery: &Delivery, error: &PipelineError) -> Disposition {
        let entry = QuarantineEntry::new(self.peek_order_id(delivery.payload()), delivery.payload().to_vec(), error.to_string());
        match self.quarantine.quarantine(&entry).await {
            Ok(()) => {
                tracing::error!(
                    quarantine_id = %entry.id, order_id = ?entry.order_id, error = %error,
                    "CRM sync failed after dead-letter retry; message quarantined"
                );
                Disposition::Ack
            }
            Err(e) if delivery.attempt() < QUARANTINE_WRITE_ATTEMPTS => {
                tracing::warn!(error = %e, attempt = delivery.attempt(), "Quarantine write failed; requeueing");
                Disposition::Requeue
            }
            Err(e) => {
                tracing::error!(order_id = ?entry.order_id, error = %e, sync_error = %error, "Quarantine write failed; dropping message");
                Disposition::Ack
            }
        }
    }
}

#[async_trait]
impl MessageHandler for CrmSyncConsumer {
    fn name(&self) -> &'static str { "crm-sync" }

    async fn handle(&self, delivery: &Delivery) -> Disposition {
        match self.sync(delivery.payload()).await {
            Ok((order_id, deal_id)) => {
                tracing::info!(order_id = %order_id, deal_id = %deal_id, queue = %delivery.queue(), "Order synced to CRM");
                Disposition::Ack
            }
            Err(e) if delivery.queue() == QueueName::CrmDeadLetter => self.quarantine(delivery, &e).await,
            Err(e) => {
                tracing::warn!(error = %e, "CRM sync failed; dead-lettering");
                Disposition::Reject
            }
        }
    }
}

// =============================================================================
// Poller
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub checked: usize,
    pub won: usize,
    pub lost: usize,
    pub dropped: usize,
}

pub struct CrmPoller {
    crm: Arc<dyn CrmClient>,
    tracked: TrackedRecords,
    reporter: StatusReporter,
}

impl CrmPoller {
    pub fn new(crm: Arc<dyn CrmClient>, tracked: TrackedRecords, reporter: StatusReporter) -> Self {
        Self { crm, tracked, reporter }
    }

    /// One pass over every tracked deal. A record whose status update cannot be
    /// published stays tracked and is retried on the next pass.
    pub async fn poll_once(&self) -> Result<PollSummary, PipelineError> {
        let snapshot = self.tracked.snapshot().await;
        let mut summary = PollSummary { checked: snapshot.len(), ..PollSummary::default() };
        if snapshot.is_empty() {
            return Ok(summary);
        }
        let ids: Vec<String> = snapshot.iter().map(|(id, _)| id.clone()).collect();
        let stages = self.crm.deal_stages(&ids).await?;

        for (deal_id, record) in snapshot {
            let Some(stage) = stages.get(&deal_id) else {
                match self.tracked.record_miss(&deal_id).await {
                    Some(misses) if misses >= MISSING_DEAL_POLL_LIMIT => {
                        self.tracked.remove(&deal_id).await;
                        summary.dropped += 1;
                        tracing::error!(deal_id = %deal_id, order_id = %record.order_id, misses, "Tracked deal missing from CRM; no longer tracking");
                    }
                    Some(misses) => {
                        tracing::warn!(deal_id = %deal_id, order_id = %record.order_id, misses, "Tracked deal not found in CRM");
                    }
                    None => {}
                }
                continue;
            };
            let (kind, message) = match stage {
                DealStage::Won => (StatusKind::Success, "CRM deal won"),
                DealStage::Lost => (StatusKind::Cancelled, "CRM deal lost"),
                DealStage::Open(_) => {
                    if self.tracked.update_stage(&deal_id, stage.clone()).await {
                        tracing::debug!(deal_id = %deal_id, stage = stage.name(), "Deal stage changed");
                    }
                    continue;
                }
            };
            let update = StatusUpdate::new(kind, record.order_id.clone(), deal_id.clone(), message);
            if let Err(e) = self.reporter.report(&update).await {
                tracing::warn!(deal_id = %deal_id, order_id = %record.order_id, error = %e, "Status update not published; keeping deal tracked");
                continue;
            }
            self.tracked.remove(&deal_id).await;
            match kind {
                StatusKind::Success => summary.won += 1,
                _ => summary.lost += 1,
            }
        }
        Ok(summary)
    }

    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = interval.as_secs(), "CRM poller started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => match self.poll_once().await {
                    Ok(summary) if summary.won + summary.lost + summary.dropped > 0 => {
                        tracing::info!(
                            checked = summary.checked, won = summary.won, lost = summary.lost, dropped = summary.dropped,
                            "CRM poll finished"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "CRM poll failed"),
                },
            }
        }
        tracing::info!("CRM poller stopped");
    }
}
