//! In-process orchestrator.
//!
//! Runs a job's units as tokio tasks, honoring its parallelism and
//! completion count, and exposes the same status shape as a cluster would.
//! Used for local runs against a reachable registry and throughout the
//! tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Orchestrator;
use crate::error::OrchestratorError;
use crate::execution::unit::UnitError;
use crate::scheduler::job::{JobDescriptor, JobStatus};

/// Runs one execution unit for a job.
#[async_trait]
pub trait UnitRunner: Send + Sync {
    async fn run_unit(&self, job: &JobDescriptor) -> Result<(), UnitError>;
}

struct LocalJob {
    status: JobStatus,
    cancel: CancellationToken,
}

type JobTable = Arc<Mutex<HashMap<String, LocalJob>>>;

/// Orchestrator that runs units in this process.
#[derive(Clone)]
pub struct LocalOrchestrator {
    runner: Arc<dyn UnitRunner>,
    jobs: JobTable,
}

impl LocalOrchestrator {
    pub fn new(runner: Arc<dyn UnitRunner>) -> Self {
        Self {
            runner,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Names of jobs currently known, in no particular order.
    pub fn job_names(&self) -> Vec<String> {
        lock(&self.jobs).keys().cloned().collect()
    }
}

fn lock(jobs: &JobTable) -> std::sync::MutexGuard<'_, HashMap<String, LocalJob>> {
    jobs.lock().unwrap_or_else(|e| e.into_inner())
}

fn update(jobs: &JobTable, name: &str, f: impl FnOnce(&mut JobStatus)) {
    if let Some(job) = lock(jobs).get_mut(name) {
        f(&mut job.status);
    }
}

async fn drive(job: JobDescriptor, runner: Arc<dyn UnitRunner>, jobs: JobTable, cancel: CancellationToken) {
    let name = job.name.clone();
    update(&jobs, &name, |s| s.start_time = Some(Utc::now()));

    let job = Arc::new(job);
    let semaphore = Arc::new(Semaphore::new(job.parallelism.max(1) as usize));
    let mut units = JoinSet::new();

    for index in 0..job.completions {
        let job = Arc::clone(&job);
        let runner = Arc::clone(&runner);
        let jobs = Arc::clone(&jobs);
        let semaphore = Arc::clone(&semaphore);
        units.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            update(&jobs, &job.name, |s| s.active += 1);
            let outcome = runner.run_unit(&job).await;
            update(&jobs, &job.name, |s| {
                s.active = s.active.saturating_sub(1);
                match &outcome {
                    Ok(()) => s.succeeded += 1,
                    Err(_) => s.failed += 1,
                }
            });
            if let Err(e) = outcome {
                warn!(job = %job.name, unit = index, error = %e, "Unit failed");
            }
        });
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                units.abort_all();
                debug!(job = %name, "Local job cancelled");
                return;
            }
            joined = units.join_next() => match joined {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    warn!(job = %name, error = %e, "Unit task panicked");
                    update(&jobs, &name, |s| {
                        s.active = s.active.saturating_sub(1);
                        s.failed += 1;
                    });
                }
                None => break,
            }
        }
    }

    update(&jobs, &name, |s| s.completion_time = Some(Utc::now()));
    info!(job = %name, "Local job completed");
}

#[async_trait]
impl Orchestrator for LocalOrchestrator {
    async fn submit(&self, job: &JobDescriptor) -> Result<(), OrchestratorError> {
        if job.parallelism == 0 || job.completions == 0 {
            return Err(OrchestratorError::InvalidDescriptor(format!(
                "{}: parallelism and completions must be at least 1",
                job.name
            )));
        }

        let cancel = CancellationToken::new();
        {
            let mut jobs = lock(&self.jobs);
            if jobs.contains_key(&job.name) {
                return Err(OrchestratorError::AlreadyExists(job.name.clone()));
            }
            jobs.insert(
                job.name.clone(),
                LocalJob {
                    status: JobStatus::default(),
                    cancel: cancel.clone(),
                },
            );
        }

        info!(
            job = %job.name,
            parallelism = job.parallelism,
            completions = job.completions,
            "Created local job"
        );
        tokio::spawn(drive(
            job.clone(),
            Arc::clone(&self.runner),
            Arc::clone(&self.jobs),
            cancel,
        ));
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<JobStatus, OrchestratorError> {
        lock(&self.jobs)
            .get(name)
            .map(|j| j.status.clone())
            .ok_or_else(|| OrchestratorError::NotFound(name.to_string()))
    }

    async fn delete(&self, name: &str) -> Result<(), OrchestratorError> {
        let job = lock(&self.jobs)
            .remove(name)
            .ok_or_else(|| OrchestratorError::NotFound(name.to_string()))?;
        job.cancel.cancel();
        info!(job = %name, "Deleted local job");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::{JobState, Operation};
    use crate::scheduler::segment::UserSegment;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingRunner {
        runs: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl UnitRunner for CountingRunner {
        async fn run_unit(&self, _job: &JobDescriptor) -> Result<(), UnitError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn descriptor(parallelism: u32, completions: u32) -> JobDescriptor {
        JobDescriptor::new(
            UserSegment::new("local_user").unwrap(),
            Operation::Push,
            "local",
            parallelism,
            completions,
        )
    }

    async fn wait_completed(orchestrator: &LocalOrchestrator, name: &str) -> JobStatus {
        for _ in 0..500 {
            let status = orchestrator.status(name).await.unwrap();
            if status.state() == JobState::Completed {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {} did not complete", name);
    }

    #[tokio::test]
    async fn test_runs_all_completions_within_parallelism() {
        let runner = Arc::new(CountingRunner::default());
        let orchestrator = LocalOrchestrator::new(runner.clone());
        let job = descriptor(2, 7);

        orchestrator.submit(&job).await.unwrap();
        let status = wait_completed(&orchestrator, &job.name).await;

        assert_eq!(runner.runs.load(Ordering::SeqCst), 7);
        assert!(runner.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(status.succeeded, 7);
        assert_eq!(status.active, 0);
        assert!(status.start_time.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_submit_rejected() {
        let orchestrator = LocalOrchestrator::new(Arc::new(CountingRunner::default()));
        let job = descriptor(1, 1);

        orchestrator.submit(&job).await.unwrap();
        let err = orchestrator.submit(&job).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_delete_and_not_found() {
        let orchestrator = LocalOrchestrator::new(Arc::new(CountingRunner::default()));
        let job = descriptor(1, 1);

        assert!(matches!(
            orchestrator.status(&job.name).await,
            Err(OrchestratorError::NotFound(_))
        ));

        orchestrator.submit(&job).await.unwrap();
        orchestrator.delete(&job.name).await.unwrap();
        assert!(orchestrator.job_names().is_empty());

        // The name can be reused once deleted.
        orchestrator.submit(&job).await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_completions_rejected() {
        let orchestrator = LocalOrchestrator::new(Arc::new(CountingRunner::default()));
        let err = orchestrator.submit(&descriptor(1, 0)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidDescriptor(_)));
    }
}
