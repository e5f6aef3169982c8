//! Job launcher: sizes and submits the job for one segment and operation.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use super::job::{completions_for, JobDescriptor, Operation};
use super::segment::UserSegment;
use crate::error::OrchestratorError;
use crate::metrics::MetricsCollector;
use crate::orchestrator::Orchestrator;

/// Builds job descriptors and submits them.
pub struct JobLauncher {
    orchestrator: Arc<dyn Orchestrator>,
    /// Image running the execution units.
    image: String,
    /// Units running at once per job.
    concurrency: u32,
    /// Items each unit pops.
    batch_size: usize,
    /// Environment shared by every unit of the run.
    env: BTreeMap<String, String>,
    metrics: MetricsCollector,
}

impl JobLauncher {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        image: impl Into<String>,
        concurrency: u32,
        batch_size: usize,
    ) -> Self {
        Self {
            orchestrator,
            image: image.into(),
            concurrency: concurrency.max(1),
            batch_size: batch_size.max(1),
            env: BTreeMap::new(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Descriptor for `total_items` queued items, or `None` when there is
    /// nothing to do.
    pub fn descriptor(
        &self,
        segment: &UserSegment,
        operation: Operation,
        total_items: usize,
    ) -> Option<JobDescriptor> {
        let completions = completions_for(total_items, self.batch_size);
        if completions == 0 {
            return None;
        }

        let mut env = self.env.clone();
        env.insert("QUAY_USERNAME".to_string(), segment.username().to_string());
        env.insert("QUAY_TEST_NAME".to_string(), operation.to_string());

        Some(
            JobDescriptor::new(
                segment.clone(),
                operation,
                self.image.clone(),
                self.concurrency,
                completions,
            )
            .with_env(env),
        )
    }

    /// Submits the job for `total_items` queued items.
    ///
    /// Returns `Ok(None)` without contacting the platform when there are no
    /// items.
    pub async fn launch(
        &self,
        segment: &UserSegment,
        operation: Operation,
        total_items: usize,
    ) -> Result<Option<JobDescriptor>, OrchestratorError> {
        let Some(job) = self.descriptor(segment, operation, total_items) else {
            info!(segment = %segment, "No {} items queued, not launching a job", operation);
            return Ok(None);
        };

        self.orchestrator.submit(&job).await?;
        self.metrics.job_submitted(operation.as_str());
        info!(
            job = %job.name,
            parallelism = job.parallelism,
            completions = job.completions,
            items = total_items,
            "Launched {} job",
            operation
        );
        Ok(Some(job))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::JobStatus;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingOrchestrator {
        submitted: Mutex<Vec<JobDescriptor>>,
    }

    #[async_trait]
    impl Orchestrator for RecordingOrchestrator {
        async fn submit(&self, job: &JobDescriptor) -> Result<(), OrchestratorError> {
            self.submitted.lock().unwrap().push(job.clone());
            Ok(())
        }

        async fn status(&self, name: &str) -> Result<JobStatus, OrchestratorError> {
            Err(OrchestratorError::NotFound(name.to_string()))
        }

        async fn delete(&self, _name: &str) -> Result<(), OrchestratorError> {
            Ok(())
        }
    }

    fn segment() -> UserSegment {
        UserSegment::new("ab12_user_1").unwrap()
    }

    #[tokio::test]
    async fn test_launch_sizes_job() {
        let orchestrator = Arc::new(RecordingOrchestrator::default());
        let mut env = BTreeMap::new();
        env.insert("QUAY_HOST".to_string(), "quay.example.com".to_string());
        let launcher = JobLauncher::new(orchestrator.clone(), "img", 5, 100).with_env(env);

        let job = launcher
            .launch(&segment(), Operation::Push, 1001)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(job.completions, 11);
        assert_eq!(job.parallelism, 5);
        assert_eq!(job.env["QUAY_USERNAME"], "ab12_user_1");
        assert_eq!(job.env["QUAY_TEST_NAME"], "push");
        assert_eq!(job.env["QUAY_HOST"], "quay.example.com");
        assert_eq!(orchestrator.submitted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_items_submits_nothing() {
        let orchestrator = Arc::new(RecordingOrchestrator::default());
        let launcher = JobLauncher::new(orchestrator.clone(), "img", 5, 100);

        let job = launcher.launch(&segment(), Operation::Pull, 0).await.unwrap();
        assert!(job.is_none());
        assert!(orchestrator.submitted.lock().unwrap().is_empty());
    }
}
