//! registry-loadgen: container registry push/pull load generator.
//!
//! This library fans image push and pull work out across registry users and
//! parallel execution units, and aggregates per-image timings.

// Core modules
pub mod aggregate;
pub mod cli;
pub mod config;
pub mod error;
pub mod execution;
pub mod metrics;
pub mod orchestrator;
pub mod plan;
pub mod scheduler;

// Re-export commonly used error types
pub use error::{ConfigError, MetricsStoreError, OrchestratorError, RegistryError, ToolError};
