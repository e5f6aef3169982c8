//! Execution unit: one run of a job's worker.
//!
//! A unit pops up to `batch_size` items from its segment's queue, processes
//! them through the push or pull path, and hands the results to the
//! aggregator. Items popped by a unit that dies before aggregating are lost;
//! they are never handed to another unit.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::aggregate::{AggregateError, ResultAggregator, Summary};
use crate::orchestrator::UnitRunner;
use crate::scheduler::job::{JobDescriptor, Operation, PullPolicy};
use crate::scheduler::queue::{pop_batch, QueueError, WorkQueue};
use crate::scheduler::segment::UserSegment;

use super::image_tool::ImageTool;
use super::pull::{run_pull_batch, PullConfig};
use super::push::{run_push_batch, PushConfig};
use super::registry_client::RegistryApi;

/// Items popped per unit when no batch size is configured.
pub const DEFAULT_BATCH_SIZE: usize = 400;

/// Errors that end a unit run.
#[derive(Debug, Error)]
pub enum UnitError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

/// What one unit run did.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitReport {
    pub operation: Operation,
    /// Items taken off the queue.
    pub popped: usize,
    /// Items appended to the pull queue after publishing.
    pub forwarded: usize,
    /// `None` when the queue was already empty.
    pub summary: Option<Summary>,
}

/// Drains one batch from a segment queue.
pub struct ExecutionUnit {
    queue: Arc<dyn WorkQueue>,
    tool: Arc<dyn ImageTool>,
    registry: Arc<dyn RegistryApi>,
    aggregator: Arc<ResultAggregator>,
    push: PushConfig,
    pull: PullConfig,
    batch_size: usize,
    pull_policy: PullPolicy,
}

impl ExecutionUnit {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        tool: Arc<dyn ImageTool>,
        registry: Arc<dyn RegistryApi>,
        aggregator: Arc<ResultAggregator>,
        push: PushConfig,
        pull: PullConfig,
    ) -> Self {
        Self {
            queue,
            tool,
            registry,
            aggregator,
            push,
            pull,
            batch_size: DEFAULT_BATCH_SIZE,
            pull_policy: PullPolicy::default(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_pull_policy(mut self, pull_policy: PullPolicy) -> Self {
        self.pull_policy = pull_policy;
        self
    }

    /// Pops one batch for `segment` and processes it.
    pub async fn run(
        &self,
        segment: &UserSegment,
        operation: Operation,
    ) -> Result<UnitReport, UnitError> {
        let items = pop_batch(self.queue.as_ref(), segment, operation, self.batch_size).await?;
        if items.is_empty() {
            info!(segment = %segment, "No tags in {} queue. Finished.", operation);
            return Ok(UnitReport {
                operation,
                popped: 0,
                forwarded: 0,
                summary: None,
            });
        }

        let popped = items.len();
        info!(segment = %segment, count = popped, "Processing {} batch", operation);

        // Every segment authenticates as its own user.
        let results = match operation {
            Operation::Push => {
                let mut push = self.push.clone();
                push.credentials.username = segment.username().to_string();
                run_push_batch(Arc::clone(&self.tool), items, &push).await
            }
            Operation::Pull => {
                let mut pull = self.pull.clone();
                if let Some(credentials) = pull.credentials.as_mut() {
                    credentials.username = segment.username().to_string();
                }
                run_pull_batch(Arc::clone(&self.registry), items, &pull).await
            }
        };

        let forward: Vec<String> =
            if operation == Operation::Push && self.pull_policy == PullPolicy::PushedOnly {
                results
                    .iter()
                    .filter(|r| r.successful)
                    .map(|r| r.item.clone())
                    .collect()
            } else {
                Vec::new()
            };

        // Results are stored before the hand-off so a queue failure does not
        // lose them.
        let aggregated = self.aggregator.aggregate(operation, results).await;

        if !forward.is_empty() {
            self.queue
                .enqueue_many(segment, Operation::Pull, &forward)
                .await?;
            info!(segment = %segment, count = forward.len(), "Queued pushed tags for pulling");
        }

        let summary = aggregated?;
        info!(segment = %segment, "Finished {} batch", operation);

        Ok(UnitReport {
            operation,
            popped,
            forwarded: forward.len(),
            summary: Some(summary),
        })
    }
}

#[async_trait]
impl UnitRunner for ExecutionUnit {
    async fn run_unit(&self, job: &JobDescriptor) -> Result<(), UnitError> {
        self.run(&job.segment, job.operation).await.map(|_| ())
    }
}
