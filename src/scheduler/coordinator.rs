//! Batch coordinator: drives every segment through push and pull.
//!
//! Segments are split into consecutive chunks of at most `group_size`. The
//! segments of a chunk run concurrently, each in its own supervised task;
//! chunks run strictly one after another. A chunk ends only when every one
//! of its tasks has returned, so at most `group_size` segments have jobs on
//! the platform at any time.
//!
//! Per segment:
//!
//! 1. Clear and fill the push and pull queues
//! 2. Launch the push job and wait for it (unless push is skipped)
//! 3. Launch the pull job and wait for it
//!
//! A failure in one segment is recorded in its [`SegmentReport`] and never
//! stops the others. Once the run is cancelled no further queue is prepared
//! and no further job is submitted.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::job::{JobStatus, Operation, PullPolicy};
use super::launcher::JobLauncher;
use super::monitor::JobMonitor;
use super::queue::{reset_queue, WorkQueue, WorkItem};
use super::segment::UserSegment;

/// Errors that stop the coordinator itself.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Segment slug '{0}' appears more than once")]
    DuplicateSegment(String),

    #[error("Run cancelled after {completed_chunks} chunk(s)")]
    Cancelled {
        completed_chunks: usize,
        reports: Vec<SegmentReport>,
    },
}

/// Outcome of one operation for one segment.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseOutcome {
    Completed { job: String, status: JobStatus },
    Skipped { reason: String },
    Failed { error: String },
}

impl PhaseOutcome {
    fn skipped(reason: impl Into<String>) -> Self {
        PhaseOutcome::Skipped {
            reason: reason.into(),
        }
    }

    fn failed(error: impl fmt::Display) -> Self {
        PhaseOutcome::Failed {
            error: error.to_string(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, PhaseOutcome::Failed { .. })
    }
}

impl fmt::Display for PhaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseOutcome::Completed { job, .. } => write!(f, "completed ({})", job),
            PhaseOutcome::Skipped { reason } => write!(f, "skipped ({})", reason),
            PhaseOutcome::Failed { error } => write!(f, "failed ({})", error),
        }
    }
}

/// What happened to one segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentReport {
    pub segment: UserSegment,
    /// Zero-based chunk the segment ran in.
    pub chunk: usize,
    pub push: PhaseOutcome,
    pub pull: PhaseOutcome,
}

impl SegmentReport {
    pub fn is_success(&self) -> bool {
        !self.push.is_failed() && !self.pull.is_failed()
    }
}

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Segments running at once.
    pub group_size: usize,
    pub skip_push: bool,
    pub pull_policy: PullPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            group_size: 1,
            skip_push: false,
            pull_policy: PullPolicy::AllItems,
        }
    }
}

/// Splits segments into consecutive chunks of at most `group_size`.
pub fn chunk_segments(segments: &[UserSegment], group_size: usize) -> Vec<Vec<UserSegment>> {
    segments
        .chunks(group_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

struct SegmentContext {
    queue: Arc<dyn WorkQueue>,
    launcher: Arc<JobLauncher>,
    monitor: Arc<JobMonitor>,
    items: Arc<Vec<WorkItem>>,
    skip_push: bool,
    pull_policy: PullPolicy,
    cancel: CancellationToken,
}

impl SegmentContext {
    /// Pushed-only pulls need a push phase to feed them.
    fn pulls_pushed_only(&self) -> bool {
        self.pull_policy == PullPolicy::PushedOnly && !self.skip_push
    }

    async fn prepare_queues(&self, segment: &UserSegment) -> Result<(), String> {
        let push_items: &[WorkItem] = if self.skip_push { &[] } else { &self.items };
        reset_queue(self.queue.as_ref(), segment, Operation::Push, push_items)
            .await
            .map_err(|e| e.to_string())?;
        if !self.skip_push {
            info!(segment = %segment, "Queued {} tags to be created", push_items.len());
        }

        let pull_items: &[WorkItem] = if self.pulls_pushed_only() {
            &[]
        } else {
            &self.items
        };
        reset_queue(self.queue.as_ref(), segment, Operation::Pull, pull_items)
            .await
            .map_err(|e| e.to_string())?;
        info!(segment = %segment, "Queued {} tags to be pulled", pull_items.len());

        Ok(())
    }

    async fn run_phase(&self, segment: &UserSegment, operation: Operation, total: usize) -> PhaseOutcome {
        if self.cancel.is_cancelled() {
            info!(segment = %segment, "Run cancelled, not launching {} job", operation);
            return PhaseOutcome::skipped("cancelled");
        }

        let job = match self.launcher.launch(segment, operation, total).await {
            Ok(Some(job)) => job,
            Ok(None) => return PhaseOutcome::skipped("no items queued"),
            Err(e) => {
                error!(segment = %segment, error = %e, "Unable to create {} job", operation);
                return PhaseOutcome::failed(e);
            }
        };

        match self.monitor.wait(&job, total).await {
            Ok(status) => PhaseOutcome::Completed {
                job: job.name,
                status,
            },
            Err(e) => {
                error!(segment = %segment, job = %job.name, error = %e, "Job did not complete");
                PhaseOutcome::failed(e)
            }
        }
    }

    async fn run(&self, segment: &UserSegment, chunk: usize) -> SegmentReport {
        if self.cancel.is_cancelled() {
            return SegmentReport {
                segment: segment.clone(),
                chunk,
                push: PhaseOutcome::skipped("cancelled"),
                pull: PhaseOutcome::skipped("cancelled"),
            };
        }

        if let Err(e) = self.prepare_queues(segment).await {
            error!(segment = %segment, error = %e, "Failed to prepare queues");
            return SegmentReport {
                segment: segment.clone(),
                chunk,
                push: PhaseOutcome::failed(&e),
                pull: PhaseOutcome::failed(&e),
            };
        }

        let push = if self.skip_push {
            PhaseOutcome::skipped("push disabled")
        } else {
            self.run_phase(segment, Operation::Push, self.items.len()).await
        };

        let pull_total = if self.pulls_pushed_only() {
            match self.queue.length(segment, Operation::Pull).await {
                Ok(n) => n,
                Err(e) => {
                    return SegmentReport {
                        segment: segment.clone(),
                        chunk,
                        push,
                        pull: PhaseOutcome::failed(e),
                    }
                }
            }
        } else {
            self.items.len()
        };

        let pull = self.run_phase(segment, Operation::Pull, pull_total).await;

        SegmentReport {
            segment: segment.clone(),
            chunk,
            push,
            pull,
        }
    }
}

/// Drives launch and monitoring across all segments.
pub struct BatchCoordinator {
    context: Arc<SegmentContext>,
    group_size: usize,
    cancel: CancellationToken,
}

impl BatchCoordinator {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        launcher: Arc<JobLauncher>,
        monitor: Arc<JobMonitor>,
        items: Vec<WorkItem>,
        config: CoordinatorConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            context: Arc::new(SegmentContext {
                queue,
                launcher,
                monitor,
                items: Arc::new(items),
                skip_push: config.skip_push,
                pull_policy: config.pull_policy,
                cancel: cancel.clone(),
            }),
            group_size: config.group_size.max(1),
            cancel,
        }
    }

    /// Runs every segment, chunk by chunk.
    ///
    /// Reports come back in segment order. Cancellation is checked between
    /// chunks; the running chunk's monitors observe it directly.
    pub async fn run(&self, segments: &[UserSegment]) -> Result<Vec<SegmentReport>, CoordinatorError> {
        let mut seen = HashSet::new();
        for segment in segments {
            if !seen.insert(segment.slug()) {
                return Err(CoordinatorError::DuplicateSegment(segment.slug().to_string()));
            }
        }

        let chunks = chunk_segments(segments, self.group_size);
        let total_chunks = chunks.len();
        let mut reports = Vec::with_capacity(segments.len());

        for (index, chunk) in chunks.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(CoordinatorError::Cancelled {
                    completed_chunks: index,
                    reports,
                });
            }

            info!(
                chunk = index + 1,
                chunks = total_chunks,
                segments = chunk.len(),
                "Starting chunk"
            );
            let mut chunk_reports = self.run_chunk(index, chunk).await;
            chunk_reports.sort_by_key(|(position, _)| *position);
            reports.extend(chunk_reports.into_iter().map(|(_, report)| report));
            info!(chunk = index + 1, chunks = total_chunks, "Chunk finished");
        }

        if self.cancel.is_cancelled() {
            return Err(CoordinatorError::Cancelled {
                completed_chunks: total_chunks,
                reports,
            });
        }

        Ok(reports)
    }

    async fn run_chunk(&self, index: usize, chunk: Vec<UserSegment>) -> Vec<(usize, SegmentReport)> {
        let mut tasks = JoinSet::new();

        for (position, segment) in chunk.into_iter().enumerate() {
            let context = Arc::clone(&self.context);
            tasks.spawn(async move {
                // The inner task isolates panics so the report still names
                // the segment.
                let worker = {
                    let segment = segment.clone();
                    tokio::spawn(async move { context.run(&segment, index).await })
                };
                let report = match worker.await {
                    Ok(report) => report,
                    Err(e) => {
                        error!(segment = %segment, error = %e, "Segment task panicked");
                        let outcome = PhaseOutcome::failed(format!("task failed: {}", e));
                        SegmentReport {
                            segment,
                            chunk: index,
                            push: outcome.clone(),
                            pull: outcome,
                        }
                    }
                };
                (position, report)
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((position, report)) => {
                    if report.is_success() {
                        info!(segment = %report.segment, push = %report.push, pull = %report.pull, "Segment finished");
                    } else {
                        warn!(segment = %report.segment, push = %report.push, pull = %report.pull, "Segment finished with failures");
                    }
                    reports.push((position, report));
                }
                Err(e) => error!(error = %e, "Segment supervisor failed"),
            }
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segments(n: usize) -> Vec<UserSegment> {
        (0..n)
            .map(|i| UserSegment::new(format!("ab12_user_{}", i)).unwrap())
            .collect()
    }

    #[test]
    fn test_chunking_bound() {
        for (u, g) in [(0, 3), (1, 3), (7, 3), (9, 3), (10, 1), (4, 10)] {
            let segs = segments(u);
            let chunks = chunk_segments(&segs, g);

            assert_eq!(chunks.len(), u.div_ceil(g));
            assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= g));

            let flattened: Vec<_> = chunks.into_iter().flatten().collect();
            assert_eq!(flattened, segs);
        }
    }

    #[test]
    fn test_chunking_zero_group_size() {
        let chunks = chunk_segments(&segments(3), 0);
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn test_phase_outcome_display() {
        assert_eq!(
            PhaseOutcome::skipped("push disabled").to_string(),
            "skipped (push disabled)"
        );
        assert!(PhaseOutcome::failed("boom").is_failed());
    }
}
