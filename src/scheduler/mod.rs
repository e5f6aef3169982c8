//! Work distribution across user segments and Kubernetes jobs.
//!
//! This module provides the driver side of a load run:
//!
//! - **WorkQueue**: Redis-backed FIFO lists, one per segment and operation
//! - **JobLauncher**: sizes and submits the job that drains a queue
//! - **JobMonitor**: waits for a job to complete, logging queue progress
//! - **BatchCoordinator**: runs segments in bounded chunks, push then pull
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │ Coordinator  │
//!                      │  (run cmd)   │
//!                      └──────┬───────┘
//!                  enqueue    │    launch + monitor
//!                      ┌──────▼───────┐
//!                      │    Redis     │
//!                      │ tags_to_*-*  │
//!                      └──────┬───────┘
//!                             │ pop
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Unit 1  │         │ Unit 2  │         │ Unit N  │
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use registry_loadgen::scheduler::{
//!     BatchCoordinator, CoordinatorConfig, JobLauncher, JobMonitor, MonitorConfig,
//!     RedisWorkQueue, segments_from_usernames,
//! };
//!
//! let queue = Arc::new(RedisWorkQueue::connect("redis://localhost:6379").await?);
//! let launcher = Arc::new(JobLauncher::new(orchestrator.clone(), image, 10, 400));
//! let monitor = Arc::new(JobMonitor::new(orchestrator, queue.clone(), MonitorConfig::default(), cancel.clone()));
//!
//! let coordinator = BatchCoordinator::new(queue, launcher, monitor, tags, CoordinatorConfig::default(), cancel);
//! let reports = coordinator.run(&segments_from_usernames(users)?).await?;
//! ```

pub mod coordinator;
pub mod job;
pub mod launcher;
pub mod monitor;
pub mod queue;
pub mod segment;
pub mod ticker;

// Re-export main types for convenience
pub use coordinator::{
    chunk_segments, BatchCoordinator, CoordinatorConfig, CoordinatorError, PhaseOutcome,
    SegmentReport,
};
pub use job::{JobDescriptor, JobState, JobStatus, Operation, PullPolicy};
pub use launcher::JobLauncher;
pub use monitor::{JobMonitor, MonitorConfig, MonitorError};
pub use queue::{
    pop_batch, queue_key, reset_queue, MemoryWorkQueue, QueueError, RedisWorkQueue, WorkItem,
    WorkQueue,
};
pub use segment::{segments_from_usernames, UserSegment};
pub use ticker::{Tick, Ticker};
