//! ERP export: order events rendered as IDoc documents and written to a sink.

pub mod idoc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use crate::domain::events::OrderEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErpDocument {
    pub file_name: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct IdocMapper {
    default_country: String,
}

/// Keeps file names portable whatever the order id contains.
fn file_safe(id: &str) -> String {
    id.chars().map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' }).collect()
}

impl IdocMapper {
    pub fn new(default_country: impl Into<String>) -> Self { Self { default_country: default_country.into() } }

    /// Sales order first, customer master second; both share one timestamp.
    pub fn map(&self, event: &OrderEvent, created: DateTime<Utc>) -> [ErpDocument; 2] {
        let id = file_safe(event.order_id.as_str());
        let millis = created.timestamp_millis();
        [
            ErpDocument {
                file_name: format!("ORDERS_{id}_{millis}.xml"),
                body: idoc::render_orders05(event, &self.default_country, created),
            },
            ErpDocument {
                file_name: format!("DEBMAS_{id}_{millis}.xml"),
                body: idoc::render_debmas07(event, &self.default_country, created),
            },
        ]
    }
}

#[derive(Debug, thiserror::Error)]
#[error("writing {file_name}: {source}")]
pub struct SinkError {
    pub file_name: String,
    #[source]
    pub source: std::io::Error,
}

#[async_trait]
pub trait DocumentSink: Send + Sync {
    async fn write(&self, document: &ErpDocument) -> Result<(), SinkError>;
}

/// Writes each document to `dir`, via a temporary file and a rename so that
/// readers never see a partial document.
#[derive(Debug, Clone)]
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self { Self { dir: dir.into() } }
}

#[async_trait]
impl DocumentSink for FileSink {
    async fn write(&self, document: &ErpDocument) -> Result<(), SinkError> {
        let wrap = |source| SinkError { file_name: document.file_name.clone(), source };
        tokio::fs::create_dir_all(&self.dir).await.map_err(wrap)?;
        let target = self.dir.join(&document.file_name);
        let partial = self.dir.join(format!(".{}.partial", document.file_name));
        tokio::fs::write(&partial, document.body.as_bytes()).await.map_err(wrap)?;
        tokio::fs::rename(&partial, &target).await.map_err(wrap)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemorySink {
    documents: Arc<Mutex<Vec<ErpDocument>>>,
}

impl InMemorySink {
    pub fn new() -> Self { Self::default() }
    pub async fn documents(&self) -> Vec<ErpDocument> { self.documents.lock().await.clone() }
}

#[async_trait]
impl DocumentSink for InMemorySink {
    async fn write(&self, document: &ErpDocument) -> Result<(), SinkError> {
        self.documents.lock().await.push(document.clone());
        Ok(())
    }
}
