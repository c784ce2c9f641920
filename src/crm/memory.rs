//! In-process CRM double with failure injection.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use crate::domain::value_objects::ProductCode;
use super::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDeal {
    pub draft: DealDraft,
    pub stage: DealStage,
}

#[derive(Default)]
struct State {
    contacts: HashMap<String, (String, ContactDraft)>,
    deals: HashMap<String, StoredDeal>,
    price_entries: HashMap<String, PriceEntry>,
    line_items: Vec<LineItemDraft>,
    next_id: u64,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{:012}", self.next_id)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryCrm {
    state: Arc<Mutex<State>>,
    failing_deal_creates: Arc<AtomicUsize>,
    failing_line_items: Arc<AtomicUsize>,
}

/// Consumes one injected failure from `counter`, if any are left.
fn take_failure(counter: &AtomicUsize) -> bool {
    counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
}

impl InMemoryCrm {
    pub fn new() -> Self { Self::default() }

    pub async fn with_price_entry(self, code: &str, unit_price: Decimal) -> Self {
        {
            let mut state = self.state.lock().await;
            let id = state.next_id("01u");
            state.price_entries.insert(code.to_string(), PriceEntry { id, unit_price });
        }
        self
    }

    /// The next `times` deal creations fail with [`CrmError::Request`].
    pub fn fail_deal_creation(&self, times: usize) {
        self.failing_deal_creates.store(times, Ordering::SeqCst);
    }

    /// The next `times` line item additions fail with [`CrmError::Request`].
    pub fn fail_line_items(&self, times: usize) {
        self.failing_line_items.store(times, Ordering::SeqCst);
    }

    /// Drops a deal, as a merge or manual deletion on the CRM side would.
    pub async fn delete_deal(&self, deal_id: &str) {
        let mut state = self.state.lock().await;
        state.deals.remove(deal_id);
        state.line_items.retain(|item| item.deal_id != deal_id);
    }

    pub async fn set_stage(&self, deal_id: &str, stage_name: &str) {
        if let Some(deal) = self.state.lock().await.deals.get_mut(deal_id) {
            deal.stage = DealStage::classify(stage_name);
        }
    }

    pub async fn deals(&self) -> HashMap<String, StoredDeal> { self.state.lock().await.deals.clone() }
    pub async fn contact_count(&self) -> usize { self.state.lock().await.contacts.len() }
    pub async fn line_items(&self) -> Vec<LineItemDraft> { self.state.lock().await.line_items.clone() }
}

#[async_trait]
impl CrmClient for InMemoryCrm {
    async fn find_contact_by_email(&self, email: &str) -> Result<Option<String>, CrmError> {
        Ok(self.state.lock().await.contacts.get(email).map(|(id, _)| id.clone()))
    }

    async fn create_contact(&self, contact: &ContactDraft) -> Result<String, CrmError> {
        let mut state = self.state.lock().await;
        let id = state.next_id("003");
        state.contacts.insert(contact.email.clone(), (id.clone(), contact.clone()));
        Ok(id)
    }

    async fn find_deal(&self, name: &str) -> Result<Option<String>, CrmError> {
        let state = self.state.lock().await;
        Ok(state.deals.iter().find(|(_, d)| d.draft.name == name).map(|(id, _)| id.clone()))
    }

    async fn create_deal(&self, deal: &DealDraft) -> Result<String, CrmError> {
        if take_failure(&self.failing_deal_creates) {
            return Err(CrmError::Request("injected failure".into()));
        }
        let mut state = self.state.lock().await;
        let id = state.next_id("006");
        state.deals.insert(id.clone(), StoredDeal { draft: deal.clone(), stage: DealStage::Open(DealStage::INITIAL.into()) });
        Ok(id)
    }

    async fn find_price_entry(&self, product_code: &ProductCode) -> Result<Option<PriceEntry>, CrmError> {
        Ok(self.state.lock().await.price_entries.get(product_code.as_str()).cloned())
    }

    async fn add_line_item(&self, item: &LineItemDraft) -> Result<String, CrmError> {
        if take_failure(&self.failing_line_items) {
            return Err(CrmError::Request("injected failure".into()));
        }
        let mut state = self.state.lock().await;
        if !state.deals.contains_key(&item.deal_id) {
            return Err(CrmError::Rejected { object: "OpportunityLineItem", message: format!("unknown deal {}", item.deal_id) });
        }
        let id = state.next_id("00k");
        state.line_items.push(item.clone());
        Ok(id)
    }

    async fn line_item_entries(&self, deal_id: &str) -> Result<HashSet<String>, CrmError> {
        let state = self.state.lock().await;
        Ok(state.line_items.iter().filter(|i| i.deal_id == deal_id).map(|i| i.price_entry_id.clone()).collect())
    }

    async fn deal_stages(&self, deal_ids: &[String]) -> Result<HashMap<String, DealStage>, CrmError> {
        let state = self.state.lock().await;
        Ok(deal_ids.iter()
            .filter_map(|id| state.deals.get(id).map(|d| (id.clone(), d.stage.clone())))
            .collect())
    }
}
