//! Job monitor: waits for a submitted job to report completion.
//!
//! After an initial start delay the monitor polls the job's status once per
//! interval and logs how much of the segment's queue is left. Completion is
//! recognized only by the completion timestamp. The wait ends early when the
//! configured deadline passes or the run is cancelled; in both cases the job
//! can optionally be deleted.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::job::{JobDescriptor, JobState, JobStatus};
use super::queue::{queue_key, WorkQueue};
use super::ticker::{Tick, Ticker};
use crate::error::OrchestratorError;
use crate::metrics::MetricsCollector;
use crate::orchestrator::Orchestrator;

/// Default wait before the first poll.
pub const DEFAULT_START_DELAY: Duration = Duration::from_secs(60);

/// Default interval between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Consecutive status failures tolerated before giving up.
const MAX_STATUS_FAILURES: u32 = 5;

/// Errors that end a wait without observing completion.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Job '{job}' did not complete within {waited:?}")]
    DeadlineExceeded { job: String, waited: Duration },

    #[error("Wait for job '{job}' was cancelled")]
    Cancelled { job: String },

    #[error("Could not read status of job '{job}': {source}")]
    Orchestrator {
        job: String,
        #[source]
        source: OrchestratorError,
    },
}

/// Monitor timing and abandonment settings.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Wait before the first poll, giving the job time to start.
    pub start_delay: Duration,
    /// Interval between status polls.
    pub poll_interval: Duration,
    /// Overall limit on one wait; `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Delete the job when the wait is abandoned.
    pub delete_on_abandon: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            start_delay: DEFAULT_START_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
            delete_on_abandon: false,
        }
    }
}

/// Percentage of `total` already taken off the queue.
pub fn percent_complete(remaining: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    let done = total.saturating_sub(remaining);
    done as f64 * 100.0 / total as f64
}

pub struct JobMonitor {
    orchestrator: Arc<dyn Orchestrator>,
    queue: Arc<dyn WorkQueue>,
    config: MonitorConfig,
    cancel: CancellationToken,
    metrics: MetricsCollector,
}

impl JobMonitor {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        queue: Arc<dyn WorkQueue>,
        config: MonitorConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            orchestrator,
            queue,
            config,
            cancel,
            metrics: MetricsCollector::new(),
        }
    }

    /// Waits until `job` reports a completion timestamp.
    ///
    /// `total_items` is the queue size at launch, used for progress logs.
    pub async fn wait(
        &self,
        job: &JobDescriptor,
        total_items: usize,
    ) -> Result<JobStatus, MonitorError> {
        let ticker = Ticker::new(self.config.poll_interval, self.cancel.clone())
            .with_timeout(self.config.timeout);

        let result = self.poll_until_complete(&ticker, job, total_items).await;
        self.metrics.job_finished();

        if let Err(e) = &result {
            let abandoned = matches!(
                e,
                MonitorError::DeadlineExceeded { .. } | MonitorError::Cancelled { .. }
            );
            if !abandoned {
                return result;
            }
            warn!(job = %job.name, error = %e, "Abandoning job");
            if self.config.delete_on_abandon {
                if let Err(e) = self.orchestrator.delete(&job.name).await {
                    warn!(job = %job.name, error = %e, "Failed to delete abandoned job");
                }
            }
        }

        result
    }

    async fn poll_until_complete(
        &self,
        ticker: &Ticker,
        job: &JobDescriptor,
        total_items: usize,
    ) -> Result<JobStatus, MonitorError> {
        let mut next = ticker.sleep(self.config.start_delay).await;
        let mut status_failures = 0u32;

        loop {
            match next {
                Tick::Fire => {}
                Tick::Cancelled => {
                    return Err(MonitorError::Cancelled {
                        job: job.name.clone(),
                    })
                }
                Tick::DeadlineExceeded => {
                    return Err(MonitorError::DeadlineExceeded {
                        job: job.name.clone(),
                        waited: ticker.elapsed(),
                    })
                }
            }

            match self.orchestrator.status(&job.name).await {
                Ok(status) if status.state() == JobState::Completed => {
                    info!(job = %job.name, "Job {} has been completed.", job.name);
                    return Ok(status);
                }
                Ok(_) => status_failures = 0,
                Err(source) => {
                    status_failures += 1;
                    warn!(
                        job = %job.name,
                        attempt = status_failures,
                        error = %source,
                        "Failed to read job status"
                    );
                    if status_failures >= MAX_STATUS_FAILURES {
                        return Err(MonitorError::Orchestrator {
                            job: job.name.clone(),
                            source,
                        });
                    }
                }
            }

            self.log_progress(job, total_items).await;
            next = ticker.tick().await;
        }
    }

    async fn log_progress(&self, job: &JobDescriptor, total_items: usize) {
        match self.queue.length(&job.segment, job.operation).await {
            Ok(remaining) => {
                self.metrics
                    .update_queue_depth(&queue_key(&job.segment, job.operation), remaining);
                info!(
                    job = %job.name,
                    "Waiting for {} to finish. Queue: {}/{} ({:.1}% complete)",
                    job.name,
                    remaining,
                    total_items,
                    percent_complete(remaining, total_items)
                );
            }
            Err(e) => warn!(job = %job.name, error = %e, "Failed to read queue length"),
        }
    }
}
