//! High-level metric recording for load runs.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics so call sites record
//! with consistent labels. Every method is a no-op until `init_metrics()` has
//! run, which keeps library code usable without a registry.

use super::prometheus::{
    ATTEMPTS_TOTAL, ITEMS_TOTAL, ITEM_DURATION, JOBS_IN_PROGRESS, JOBS_SUBMITTED, QUEUE_DEPTH,
};

/// Metrics collector for recording load-generator metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record one processed item.
    ///
    /// # Arguments
    ///
    /// * `operation` - `push` or `pull`
    /// * `successful` - Whether the item ended successfully
    /// * `elapsed_secs` - Elapsed time recorded in the item's result
    pub fn record_item(&self, operation: &str, successful: bool, elapsed_secs: f64) {
        let outcome = if successful { "success" } else { "failure" };

        if let Some(items_total) = ITEMS_TOTAL.get() {
            items_total.with_label_values(&[operation, outcome]).inc();
        }

        if let Some(item_duration) = ITEM_DURATION.get() {
            item_duration
                .with_label_values(&[operation])
                .observe(elapsed_secs);
        }

        tracing::trace!(
            operation = operation,
            outcome = outcome,
            elapsed_secs = elapsed_secs,
            "Recorded item metric"
        );
    }

    /// Record a single push or layer-fetch attempt.
    pub fn record_attempt(&self, operation: &str, succeeded: bool) {
        let outcome = if succeeded { "success" } else { "failure" };
        if let Some(attempts) = ATTEMPTS_TOTAL.get() {
            attempts.with_label_values(&[operation, outcome]).inc();
        }
    }

    /// Update the depth gauge for a named queue.
    pub fn update_queue_depth(&self, queue_name: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&[queue_name])
                .set(depth as f64);
        }

        tracing::trace!(
            queue_name = queue_name,
            depth = depth,
            "Updated queue depth metric"
        );
    }

    /// Record a job submission and count it as in progress.
    pub fn job_submitted(&self, operation: &str) {
        if let Some(submitted) = JOBS_SUBMITTED.get() {
            submitted.with_label_values(&[operation]).inc();
        }
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.inc();
        }
    }

    /// Mark a submitted job as no longer in progress.
    pub fn job_finished(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::init_metrics;

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_metrics_collector_new() {
        let collector = MetricsCollector::new();
        assert!(std::mem::size_of_val(&collector) == 0);
    }

    #[test]
    fn test_record_item() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_item("push", true, 1.25);
        collector.record_item("pull", false, 0.0);

        let items = ITEMS_TOTAL.get().unwrap();
        assert!(items.with_label_values(&["push", "success"]).get() >= 1.0);
    }

    #[test]
    fn test_record_attempt() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_attempt("pull", false);
        collector.record_attempt("pull", true);

        let attempts = ATTEMPTS_TOTAL.get().unwrap();
        assert!(attempts.with_label_values(&["pull", "failure"]).get() >= 1.0);
    }

    #[test]
    fn test_update_queue_depth() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.update_queue_depth("tags_to_push-user-0", 42);
        collector.update_queue_depth("tags_to_push-user-0", 40);

        let depth = QUEUE_DEPTH.get().unwrap();
        assert_eq!(
            depth.with_label_values(&["tags_to_push-user-0"]).get(),
            40.0
        );
    }

    #[test]
    fn test_job_lifecycle() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.job_submitted("push");
        collector.job_finished();
    }
}
