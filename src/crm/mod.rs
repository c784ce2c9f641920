//! CRM integration seam.
//!
//! Contacts and deals are the CRM-side records created for each order. Deals
//! move through stages on the CRM side and only the terminal ones matter here.

pub mod memory;
pub mod salesforce;
pub mod tracking;

pub use memory::InMemoryCrm;
pub use salesforce::SalesforceClient;
pub use tracking::{TrackedRecord, TrackedRecords};

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use crate::domain::aggregates::Customer;
use crate::domain::events::OrderEvent;
use crate::domain::value_objects::ProductCode;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CrmError {
    #[error("crm authentication failed: {0}")]
    Auth(String),
    #[error("crm request failed: {0}")]
    Request(String),
    #[error("crm rejected {object}: {message}")]
    Rejected { object: &'static str, message: String },
    #[error("unexpected crm response: {0}")]
    Response(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactDraft {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub mailing_street: String,
    pub mailing_postal_code: String,
    pub mailing_city: Option<String>,
    pub mailing_country: Option<String>,
}

impl From<&Customer> for ContactDraft {
    fn from(c: &Customer) -> Self {
        Self {
            first_name: c.first_name.clone(),
            last_name: c.last_name.clone(),
            email: c.email.clone(),
            mailing_street: c.street_line(),
            mailing_postal_code: c.postal_code.clone(),
            mailing_city: c.city.clone(),
            mailing_country: c.country.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DealDraft {
    pub name: String,
    pub contact_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub close_date: NaiveDate,
    pub description: String,
}

impl DealDraft {
    pub fn name_for(order_id: &str) -> String { format!("Order {order_id}") }

    pub fn for_order(event: &OrderEvent, contact_id: impl Into<String>) -> Self {
        Self {
            name: Self::name_for(event.order_id.as_str()),
            contact_id: contact_id.into(),
            amount: event.total_amount,
            currency: event.currency.clone(),
            close_date: event.timestamp.date_naive(),
            description: format!("Items: {}", event.item_summary()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceEntry {
    pub id: String,
    pub unit_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineItemDraft {
    pub deal_id: String,
    pub price_entry_id: String,
    pub quantity: u32,
    pub unit_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DealStage {
    Open(String),
    Won,
    Lost,
}

impl DealStage {
    pub const INITIAL: &'static str = "Prospecting";

    pub fn classify(stage_name: &str) -> Self {
        match stage_name {
            "Closed Won" => Self::Won,
            "Closed Lost" => Self::Lost,
            other => Self::Open(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Open(name) => name,
            Self::Won => "Closed Won",
            Self::Lost => "Closed Lost",
        }
    }

    pub fn is_terminal(&self) -> bool { !matches!(self, Self::Open(_)) }
}

#[async_trait]
pub trait CrmClient: Send + Sync {
    async fn find_contact_by_email(&self, email: &str) -> Result<Option<String>, CrmError>;
    async fn create_contact(&self, contact: &ContactDraft) -> Result<String, CrmError>;
    /// Looks a deal up by its exact name; used to make deal creation idempotent.
    async fn find_deal(&self, name: &str) -> Result<Option<String>, CrmError>;
    async fn create_deal(&self, deal: &DealDraft) -> Result<String, CrmError>;
    async fn find_price_entry(&self, product_code: &ProductCode) -> Result<Option<PriceEntry>, CrmError>;
    async fn add_line_item(&self, item: &LineItemDraft) -> Result<String, CrmError>;
    /// Price entry ids already attached to `deal_id` as line items.
    async fn line_item_entries(&self, deal_id: &str) -> Result<HashSet<String>, CrmError>;
    /// Current stage per deal id. Ids unknown to the CRM are absent from the map.
    async fn deal_stages(&self, deal_ids: &[String]) -> Result<HashMap<String, DealStage>, CrmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_classification() {
        assert_eq!(DealStage::classify("Closed Won"), DealStage::Won);
        assert_eq!(DealStage::classify("Closed Lost"), DealStage::Lost);
        let open = DealStage::classify("Negotiation/Review");
        assert!(!open.is_terminal());
        assert_eq!(open.name(), "Negotiation/Review");
    }
}
