//! Metrics store backends.
//!
//! The store only ever receives additive bulk inserts of result documents.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::MetricsStoreError;
use crate::execution::result::ExecutionResult;

/// Destination for execution results.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Inserts every document into `index`, returning how many were written.
    async fn bulk_insert(
        &self,
        index: &str,
        docs: &[ExecutionResult],
    ) -> Result<usize, MetricsStoreError>;
}

/// Renders the newline-delimited body of a `_bulk` request.
pub fn bulk_body(index: &str, docs: &[ExecutionResult]) -> Result<String, MetricsStoreError> {
    let mut body = String::new();
    let action = serde_json::to_string(&json!({ "index": { "_index": index } }))?;
    for doc in docs {
        body.push_str(&action);
        body.push('\n');
        body.push_str(&serde_json::to_string(doc)?);
        body.push('\n');
    }
    Ok(body)
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

impl BulkResponse {
    fn failed_items(&self) -> usize {
        self.items
            .iter()
            .filter(|item| {
                item.as_object()
                    .and_then(|o| o.values().next())
                    .and_then(|action| action.get("error"))
                    .is_some()
            })
            .count()
    }
}

/// Elasticsearch bulk API over `reqwest`.
#[derive(Debug, Clone)]
pub struct ElasticsearchStore {
    client: Client,
    base_url: String,
}

impl ElasticsearchStore {
    /// Creates a store for `host` and `port`. A host without a scheme is
    /// reached over plain HTTP.
    pub fn new(host: &str, port: u16) -> Result<Self, MetricsStoreError> {
        let client = Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self {
            client,
            base_url: base_url(host, port),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn base_url(host: &str, port: u16) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        format!("{}:{}", host, port)
    } else {
        format!("http://{}:{}", host, port)
    }
}

#[async_trait]
impl MetricsStore for ElasticsearchStore {
    async fn bulk_insert(
        &self,
        index: &str,
        docs: &[ExecutionResult],
    ) -> Result<usize, MetricsStoreError> {
        if docs.is_empty() {
            return Ok(0);
        }

        let url = format!("{}/_bulk", self.base_url);
        let body = bulk_body(index, docs)?;
        debug!(url = %url, docs = docs.len(), "Sending bulk insert");

        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MetricsStoreError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: BulkResponse = response.json().await?;
        if parsed.errors {
            return Err(MetricsStoreError::BulkRejected {
                failed: parsed.failed_items(),
                total: docs.len(),
            });
        }

        Ok(docs.len())
    }
}

/// Keeps documents in memory. Used in local mode and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: Mutex<Vec<(String, ExecutionResult)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored document with its index.
    pub fn documents(&self) -> Vec<(String, ExecutionResult)> {
        self.docs
            .lock()
            .map(|d| d.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn len(&self) -> usize {
        self.documents().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn bulk_insert(
        &self,
        index: &str,
        docs: &[ExecutionResult],
    ) -> Result<usize, MetricsStoreError> {
        let mut stored = self.docs.lock().unwrap_or_else(|e| e.into_inner());
        stored.extend(docs.iter().cloned().map(|d| (index.to_string(), d)));
        Ok(docs.len())
    }
}

/// Discards every document.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

#[async_trait]
impl MetricsStore for NullStore {
    async fn bulk_insert(
        &self,
        _index: &str,
        docs: &[ExecutionResult],
    ) -> Result<usize, MetricsStoreError> {
        debug!(docs = docs.len(), "Metrics store disabled, dropping results");
        Ok(0)
    }
}
