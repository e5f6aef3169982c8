//! Orchestration platforms that run execution units.
//!
//! - **KubernetesOrchestrator**: batch/v1 Jobs through the API server
//! - **LocalOrchestrator**: in-process units, for local runs and tests

pub mod kubernetes;
pub mod local;

use async_trait::async_trait;

use crate::error::OrchestratorError;
use crate::scheduler::job::{JobDescriptor, JobStatus};

pub use kubernetes::KubernetesOrchestrator;
pub use local::{LocalOrchestrator, UnitRunner};

/// Submits, inspects and deletes jobs.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Submits a job. A job with the same name must not already exist.
    async fn submit(&self, job: &JobDescriptor) -> Result<(), OrchestratorError>;

    /// Current status of the named job.
    async fn status(&self, name: &str) -> Result<JobStatus, OrchestratorError>;

    /// Deletes the named job and its units.
    async fn delete(&self, name: &str) -> Result<(), OrchestratorError>;
}
