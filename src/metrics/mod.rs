//! Metrics module for Prometheus-based monitoring.
//!
//! This module provides metrics collection and export for load runs: items
//! processed per operation, per-item latency, attempts, queue depth, and
//! jobs in flight.
//!
//! # Example
//!
//! ```ignore
//! use registry_loadgen::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_item("push", true, 2.5);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics, write_metrics_file};

pub use prometheus::{
    ATTEMPTS_TOTAL, ITEMS_TOTAL, ITEM_DURATION, JOBS_IN_PROGRESS, JOBS_SUBMITTED, QUEUE_DEPTH,
    REGISTRY,
};
