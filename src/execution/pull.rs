//! Pull path: fetch token, manifest, and every layer over HTTP.
//!
//! Token and manifest fetches are single attempts. Each layer is retried on
//! its own, and layers of one item are fetched with bounded concurrency.

use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};

use crate::metrics::MetricsCollector;
use crate::scheduler::job::Operation;

use super::pool::run_bounded;
use super::registry_client::{Credentials, ImageReference, RegistryApi};
use super::result::ExecutionResult;
use super::retry::{retry_blind, DEFAULT_MAX_ATTEMPTS};

/// Default number of layers fetched at once per item.
pub const DEFAULT_LAYER_CONCURRENCY: usize = 6;

/// Settings for one pull batch.
#[derive(Debug, Clone)]
pub struct PullConfig {
    /// Credentials for the token call; anonymous when absent.
    pub credentials: Option<Credentials>,
    /// Fetch attempts per layer.
    pub max_attempts: u32,
    /// Items in flight at once.
    pub item_concurrency: usize,
    /// Layers in flight at once, per item.
    pub layer_concurrency: usize,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            credentials: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            item_concurrency: 4,
            layer_concurrency: DEFAULT_LAYER_CONCURRENCY,
        }
    }
}

impl PullConfig {
    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_item_concurrency(mut self, concurrency: usize) -> Self {
        self.item_concurrency = concurrency;
        self
    }

    pub fn with_layer_concurrency(mut self, concurrency: usize) -> Self {
        self.layer_concurrency = concurrency;
        self
    }
}

/// Pulls one item. Returns `None` for a malformed reference.
pub async fn pull_item(
    api: &dyn RegistryApi,
    item: &str,
    config: &PullConfig,
) -> Option<ExecutionResult> {
    let reference = match ImageReference::parse(item) {
        Ok(r) => r,
        Err(e) => {
            info!(tag = %item, error = %e, "Malformed tag");
            return None;
        }
    };

    let start = Utc::now();

    let token = match api
        .fetch_token(&reference, config.credentials.as_ref())
        .await
    {
        Ok(token) => token,
        Err(e) => {
            info!(tag = %item, error = %e, "Auth/token retrieval failed");
            return Some(ExecutionResult::failed_without_timing(
                item,
                Operation::Pull,
                start,
                Utc::now(),
            ));
        }
    };

    let digests = match api.fetch_manifest(&reference, &token).await {
        Ok(digests) if !digests.is_empty() => digests,
        Ok(_) => {
            error!(tag = %item, "Manifest lists no layers");
            return Some(ExecutionResult::timed(
                item,
                Operation::Pull,
                start,
                Utc::now(),
                0,
                1,
                false,
            ));
        }
        Err(e) => {
            error!(tag = %item, error = %e, "Failed to get manifest");
            return Some(ExecutionResult::timed(
                item,
                Operation::Pull,
                start,
                Utc::now(),
                0,
                1,
                false,
            ));
        }
    };

    let metrics = &MetricsCollector::new();
    let reference = &reference;
    let token = token.as_str();
    let max_attempts = config.max_attempts;

    let failed_layers = stream::iter(digests)
        .map(|digest| async move {
            let outcome = retry_blind(
                max_attempts,
                |attempt| {
                    let digest = digest.as_str();
                    async move {
                        let result = api.fetch_layer(reference, digest, token).await;
                        metrics.record_attempt(Operation::Pull.as_str(), result.is_ok());
                        if let Ok(layer) = &result {
                            debug!(
                                digest = %digest,
                                attempt,
                                bytes = layer.bytes,
                                "Layer fetched"
                            );
                        }
                        result
                    }
                },
                |attempt, e| warn!(digest = %digest, attempt, error = %e, "Layer attempt failed"),
            )
            .await;

            if !outcome.succeeded() {
                error!(
                    digest = %digest,
                    attempts = max_attempts.max(1),
                    "Layer failed after all attempts"
                );
            }
            outcome.succeeded()
        })
        .buffer_unordered(config.layer_concurrency.max(1))
        .filter(|ok| futures::future::ready(!*ok))
        .count()
        .await as u32;

    let success_count = u32::from(failed_layers == 0);
    Some(ExecutionResult::timed(
        item,
        Operation::Pull,
        start,
        Utc::now(),
        success_count,
        failed_layers,
        failed_layers == 0,
    ))
}

/// Pulls every item with bounded concurrency.
pub async fn run_pull_batch(
    api: Arc<dyn RegistryApi>,
    items: Vec<String>,
    config: &PullConfig,
) -> Vec<ExecutionResult> {
    info!("Pulling {} tags", items.len());
    let shared = Arc::new(config.clone());
    run_bounded(items, config.item_concurrency, "pulls", move |item| {
        let api = Arc::clone(&api);
        let config = Arc::clone(&shared);
        async move { pull_item(api.as_ref(), &item, &config).await }
    })
    .await
}
