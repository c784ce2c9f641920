//! Deals awaiting a terminal stage, shared by the CRM consumer (insert) and
//! the poller (update, remove).

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use crate::domain::value_objects::OrderId;
use super::DealStage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedRecord {
    pub order_id: OrderId,
    pub last_known_stage: DealStage,
    /// Consecutive polls in which the CRM did not return this deal.
    pub missed_polls: u32,
}

#[derive(Clone, Default)]
pub struct TrackedRecords {
    inner: Arc<RwLock<HashMap<String, TrackedRecord>>>,
}

impl TrackedRecords {
    pub fn new() -> Self { Self::default() }

    pub async fn track(&self, deal_id: impl Into<String>, order_id: OrderId) {
        let record = TrackedRecord { order_id, last_known_stage: DealStage::Open(DealStage::INITIAL.to_string()), missed_polls: 0 };
        self.inner.write().await.insert(deal_id.into(), record);
    }

    pub async fn snapshot(&self) -> Vec<(String, TrackedRecord)> {
        self.inner.read().await.iter().map(|(id, r)| (id.clone(), r.clone())).collect()
    }

    /// Returns `true` when the stored stage actually changed.
    pub async fn update_stage(&self, deal_id: &str, stage: DealStage) -> bool {
        match self.inner.write().await.get_mut(deal_id) {
            Some(record) if record.last_known_stage != stage => {
                record.last_known_stage = stage;
                record.missed_polls = 0;
                true
            }
            Some(record) => {
                record.missed_polls = 0;
                false
            }
            None => false,
        }
    }

    /// Counts one more poll that did not find the deal and returns the new
    /// streak, or `None` when the deal is no longer tracked.
    pub async fn record_miss(&self, deal_id: &str) -> Option<u32> {
        let mut inner = self.inner.write().await;
        let record = inner.get_mut(deal_id)?;
        record.missed_polls += 1;
        Some(record.missed_polls)
    }

    pub async fn remove(&self, deal_id: &str) -> Option<TrackedRecord> { self.inner.write().await.remove(deal_id) }
    pub async fn get(&self, deal_id: &str) -> Option<TrackedRecord> { self.inner.read().await.get(deal_id).cloned() }
    pub async fn len(&self) -> usize { self.inner.read().await.len() }
    pub async fn is_empty(&self) -> bool { self.inner.read().await.is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_track_and_remove() {
        let tracked = TrackedRecords::new();
        let mut tasks = Vec::new();
        for i in 0..50 {
            let tracked = tracked.clone();
            tasks.push(tokio::spawn(async move {
                tracked.track(format!("006{i}"), OrderId::new(format!("o-{i}"))).await;
                if i % 2 == 0 {
                    tracked.remove(&format!("006{i}")).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(tracked.len().await, 25);
        assert!(tracked.update_stage("0061", DealStage::Open("Qualification".into())).await);
        assert!(!tracked.update_stage("0061", DealStage::Open("Qualification".into())).await);
        assert!(!tracked.update_stage("0060", DealStage::Won).await);
    }

    #[tokio::test]
    async fn test_miss_streak_resets_when_deal_is_seen() {
        let tracked = TrackedRecords::new();
        tracked.track("006A", OrderId::new("o-1")).await;
        assert_eq!(tracked.record_miss("006A").await, Some(1));
        assert_eq!(tracked.record_miss("006A").await, Some(2));
        tracked.update_stage("006A", DealStage::Open(DealStage::INITIAL.to_string())).await;
        assert_eq!(tracked.get("006A").await.unwrap().missed_polls, 0);
        assert_eq!(tracked.record_miss("006B").await, None);
    }
}
