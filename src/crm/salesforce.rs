//! Salesforce REST client (no SDK dependency).
//!
//! Authenticates with the OAuth2 password grant and keeps the session in
//! memory; a 401 triggers one fresh login and a single retry of the request.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use rust_decimal::prelude::ToPrimitive;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::RwLock;
use crate::config::CrmCredentials;
use crate::domain::value_objects::ProductCode;
use super::*;

const API_VERSION: &str = "v59.0";
/// SOQL `IN (...)` lists are kept well below the query length limit.
const STAGE_QUERY_CHUNK: usize = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct Session {
    access_token: String,
    instance_url: String,
}

pub struct SalesforceClient {
    http: reqwest::Client,
    credentials: CrmCredentials,
    session: RwLock<Option<Session>>,
}

/// Quotes a value for a SOQL string literal.
fn soql_quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}

fn first_record_id(resp: &Value) -> Option<String> {
    resp["records"].as_array()?.first()?["Id"].as_str().map(String::from)
}

impl SalesforceClient {
    pub fn new(credentials: CrmCredentials) -> Result<Self, CrmError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CrmError::Request(format!("http client: {e}")))?;
        Ok(Self { http, credentials, session: RwLock::new(None) })
    }

    async fn login(&self) -> Result<Session, CrmError> {
        let c = &self.credentials;
        let password = format!("{}{}", c.password, c.security_token);
        let resp = self.http
            .post(format!("{}/services/oauth2/token", c.login_url.trim_end_matches('/')))
            .form(&[
                ("grant_type", "password"),
                ("client_id", c.client_id.as_str()),
                ("client_secret", c.client_secret.as_str()),
                ("username", c.username.as_str()),
                ("password", password.as_str()),
            ])
            .send()
            .await
            .map_err(|e| CrmError::Auth(e.to_string()))?;
        let status = resp.status();
        let body: Value = resp.json().await.map_err(|e| CrmError::Auth(e.to_string()))?;
        if !status.is_success() {
            return Err(CrmError::Auth(format!("{status}: {body}")));
        }
        let session = Session {
            access_token: body["access_token"].as_str().map(String::from)
                .ok_or_else(|| CrmError::Auth("response without access_token".into()))?,
            instance_url: body["instance_url"].as_str().map(String::from)
                .ok_or_else(|| CrmError::Auth("response without instance_url".into()))?,
        };
        tracing::info!(instance_url = %session.instance_url, username = %c.username, "CRM session established");
        *self.session.write().await = Some(session.clone());
        Ok(session)
    }

    async fn session(&self) -> Result<Session, CrmError> {
        if let Some(session) = self.session.read().await.clone() {
            return Ok(session);
        }
        self.login().await
    }

    async fn send_once(
        &self,
        session: &Session,
        method: &Method,
        path: &str,
        query: Option<&str>,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, CrmError> {
        let url = format!("{}/services/data/{API_VERSION}/{path}", session.instance_url);
        let mut request = self.http.request(method.clone(), url).bearer_auth(&session.access_token);
        if let Some(soql) = query {
            request = request.query(&[("q", soql)]);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        request.send().await.map_err(|e| CrmError::Request(e.to_string()))
    }

    async fn call(
        &self,
        object: &'static str,
        method: Method,
        path: &str,
        query: Option<&str>,
        body: Option<&Value>,
    ) -> Result<Value, CrmError> {
        let session = self.session().await?;
        let mut resp = self.send_once(&session, &method, path, query, body).await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            tracing::info!("CRM session expired; logging in again");
            let session = self.login().await?;
            resp = self.send_once(&session, &method, path, query, body).await?;
        }
        let status = resp.status();
        let value: Value = resp.json().await.map_err(|e| CrmError::Response(e.to_string()))?;
        if !status.is_success() {
            return Err(CrmError::Rejected { object, message: format!("{status}: {value}") });
        }
        Ok(value)
    }

    async fn query(&self, object: &'static str, soql: &str) -> Result<Value, CrmError> {
        self.call(object, Method::GET, "query", Some(soql), None).await
    }

    async fn create(&self, object: &'static str, fields: Value) -> Result<String, CrmError> {
        let resp = self.call(object, Method::POST, &format!("sobjects/{object}"), None, Some(&fields)).await?;
        if resp["success"].as_bool() == Some(false) {
            return Err(CrmError::Rejected { object, message: resp["errors"].to_string() });
        }
        resp["id"].as_str().map(String::from)
            .ok_or_else(|| CrmError::Response(format!("{object} create returned no id: {resp}")))
    }
}

#[async_trait]
impl CrmClient for SalesforceClient {
    async fn find_contact_by_email(&self, email: &str) -> Result<Option<String>, CrmError> {
        let resp = self.query("Contact", &format!("SELECT Id FROM Contact WHERE Email = {} LIMIT 1", soql_quote(email))).await?;
        Ok(first_record_id(&resp))
    }

    async fn create_contact(&self, contact: &ContactDraft) -> Result<String, CrmError> {
        self.create("Contact", json!({
            "FirstName": contact.first_name,
            "LastName": contact.last_name,
            "Email": contact.email,
            "MailingStreet": contact.mailing_street,
            "MailingPostalCode": contact.mailing_postal_code,
            "MailingCity": contact.mailing_city,
            "MailingCountryCode": contact.mailing_country,
        })).await
    }

    async fn find_deal(&self, name: &str) -> Result<Option<String>, CrmError> {
        let resp = self.query("Opportunity", &format!("SELECT Id FROM Opportunity WHERE Name = {} LIMIT 1", soql_quote(name))).await?;
        Ok(first_record_id(&resp))
    }

    async fn create_deal(&self, deal: &DealDraft) -> Result<String, CrmError> {
        self.create("Opportunity", json!({
            "Name": deal.name,
            "StageName": DealStage::INITIAL,
            "CloseDate": deal.close_date.format("%Y-%m-%d").to_string(),
            "Amount": deal.amount.to_f64(),
            "ContactId": deal.contact_id,
            "Description": deal.description,
        })).await
    }

    async fn find_price_entry(&self, product_code: &ProductCode) -> Result<Option<PriceEntry>, CrmError> {
        let soql = format!(
            "SELECT Id, UnitPrice FROM PricebookEntry WHERE Product2.ProductCode = {} AND IsActive = true AND Pricebook2.IsStandard = true LIMIT 1",
            soql_quote(product_code.as_str())
        );
        let resp = self.query("PricebookEntry", &soql).await?;
        let Some(record) = resp["records"].as_array().and_then(|r| r.first()) else { return Ok(None) };
        let id = record["Id"].as_str().map(String::from)
            .ok_or_else(|| CrmError::Response(format!("PricebookEntry without Id: {record}")))?;
        let unit_price = record["UnitPrice"].as_f64().and_then(Decimal::from_f64_retain).unwrap_or_default();
        Ok(Some(PriceEntry { id, unit_price }))
    }

    async fn add_line_item(&self, item: &LineItemDraft) -> Result<String, CrmError> {
        self.create("OpportunityLineItem", json!({
            "OpportunityId": item.deal_id,
            "PricebookEntryId": item.price_entry_id,
            "Quantity": item.quantity,
            "UnitPrice": item.unit_price.to_f64(),
        })).await
    }

    async fn line_item_entries(&self, deal_id: &str) -> Result<HashSet<String>, CrmError> {
        let soql = format!("SELECT PricebookEntryId FROM OpportunityLineItem WHERE OpportunityId = {}", soql_quote(deal_id));
        let resp = self.query("OpportunityLineItem", &soql).await?;
        Ok(resp["records"].as_array().into_iter().flatten()
            .filter_map(|r| r["PricebookEntryId"].as_str().map(String::from))
            .collect())
    }

    async fn deal_stages(&self, deal_ids: &[String]) -> Result<HashMap<String, DealStage>, CrmError> {
        let mut stages = HashMap::with_capacity(deal_ids.len());
        for chunk in deal_ids.chunks(STAGE_QUERY_CHUNK) {
            let ids = chunk.iter().map(|id| soql_quote(id)).collect::<Vec<_>>().join(", ");
            let resp = self.query("Opportunity", &format!("SELECT Id, StageName FROM Opportunity WHERE Id IN ({ids})")).await?;
            for record in resp["records"].as_array().into_iter().flatten() {
                if let (Some(id), Some(stage)) = (record["Id"].as_str(), record["StageName"].as_str()) {
                    stages.insert(id.to_string(), DealStage::classify(stage));
                }
            }
        }
        Ok(stages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soql_quote_escapes_injection() {
        assert_eq!(soql_quote("jan@example.com"), "'jan@example.com'");
        assert_eq!(soql_quote("o'brien@x.be"), "'o\\'brien@x.be'");
        assert_eq!(soql_quote("a\\' OR Id != '"), "'a\\\\\\' OR Id != \\''");
    }

    #[test]
    fn test_client_builds_with_timeout() {
        let credentials = CrmCredentials {
            login_url: "https://login.example.com".into(),
            client_id: "id".into(),
            client_secret: "secret".into(),
            username: "user".into(),
            password: "pw".into(),
            security_token: String::new(),
        };
        assert!(SalesforceClient::new(credentials).is_ok());
    }

    #[test]
    fn test_first_record_id() {
        assert_eq!(first_record_id(&json!({"records": [{"Id": "003A"}]})), Some("003A".to_string()));
        assert_eq!(first_record_id(&json!({"records": []})), None);
        assert_eq!(first_record_id(&json!({"error": "x"})), None);
    }
}
