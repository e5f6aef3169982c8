//! Result aggregation: persist execution results and summarize latency.
//!
//! The aggregator runs inside each execution unit after its batch. It
//! attaches run metadata to every result, bulk-writes them to the metrics
//! store, and logs a JSON summary:
//!
//! ```text
//! {
//!   "durations": { "max": 2.1, "mean": 1.4, "min": 0.9 },
//!   "pushes": { "total": 400 }
//! }
//! ```
//!
//! An empty batch yields `"durations": {}` and a total of zero.

pub mod store;

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info};

use crate::error::MetricsStoreError;
use crate::execution::result::{ExecutionResult, RunMetadata};
use crate::scheduler::job::Operation;

pub use store::{ElasticsearchStore, MemoryStore, MetricsStore, NullStore};

/// Mean, min and max of `elapsed_time`, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Durations {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

/// Latency summary of one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub operation: Operation,
    pub total: usize,
    /// Absent when there are no results.
    pub durations: Option<Durations>,
}

impl Summary {
    pub fn from_results(operation: Operation, results: &[ExecutionResult]) -> Self {
        let durations = if results.is_empty() {
            None
        } else {
            let mut min = f64::INFINITY;
            let mut max = f64::NEG_INFINITY;
            let mut sum = 0.0;
            for r in results {
                min = min.min(r.elapsed_time);
                max = max.max(r.elapsed_time);
                sum += r.elapsed_time;
            }
            Some(Durations {
                mean: sum / results.len() as f64,
                min,
                max,
            })
        };

        Self {
            operation,
            total: results.len(),
            durations,
        }
    }

    /// The summary document, keyed `pushes` or `pulls` by operation.
    pub fn to_json(&self) -> serde_json::Value {
        let key = match self.operation {
            Operation::Push => "pushes",
            Operation::Pull => "pulls",
        };
        let durations = match self.durations {
            Some(d) => json!(d),
            None => json!({}),
        };
        json!({
            "durations": durations,
            key: { "total": self.total },
        })
    }
}

/// Aggregation failed after the summary was computed and logged.
#[derive(Debug, Error)]
#[error("Failed to write {attempted} results to the metrics store: {source}")]
pub struct AggregateError {
    pub summary: Summary,
    pub attempted: usize,
    #[source]
    pub source: MetricsStoreError,
}

/// Persists and summarizes one batch of results.
pub struct ResultAggregator {
    store: Arc<dyn MetricsStore>,
    index: String,
    metadata: RunMetadata,
}

impl ResultAggregator {
    pub fn new(store: Arc<dyn MetricsStore>, index: impl Into<String>, metadata: RunMetadata) -> Self {
        Self {
            store,
            index: index.into(),
            metadata,
        }
    }

    /// Attaches metadata, writes the results, and logs the summary.
    ///
    /// The summary is logged even when the store write fails; the failure is
    /// then returned with the summary attached.
    pub async fn aggregate(
        &self,
        operation: Operation,
        results: Vec<ExecutionResult>,
    ) -> Result<Summary, AggregateError> {
        let results: Vec<ExecutionResult> = results
            .into_iter()
            .map(|r| r.with_metadata(self.metadata.clone()))
            .collect();

        info!(
            index = %self.index,
            count = results.len(),
            "Writing '{}' results to metrics store",
            operation.target()
        );
        let written = self.store.bulk_insert(&self.index, &results).await;

        let summary = Summary::from_results(operation, &results);
        let rendered = serde_json::to_string_pretty(&summary.to_json())
            .unwrap_or_else(|e| format!("<unrenderable summary: {}>", e));
        info!("{} summary\n{}", operation, rendered);

        match written {
            Ok(n) => {
                info!(written = n, "Results stored");
                Ok(summary)
            }
            Err(e) => {
                error!(error = %e, "Metrics store write failed");
                Err(AggregateError {
                    summary,
                    attempted: results.len(),
                    source: e,
                })
            }
        }
    }
}
