//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by registry-loadgen and
//! provides functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all registry-loadgen metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of items processed, labeled by operation and outcome.
pub static ITEMS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Per-item elapsed time in seconds, labeled by operation.
pub static ITEM_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Individual push or layer-fetch attempts, labeled by operation and outcome.
pub static ATTEMPTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of items in queue, labeled by queue name.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of jobs submitted and not yet observed as completed.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Jobs submitted, labeled by operation.
pub static JOBS_SUBMITTED: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls leave the first registry in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Item metrics
    let items_total = CounterVec::new(
        Opts::new("registry_loadgen_items_total", "Total number of items processed"),
        &["operation", "outcome"],
    )?;

    let item_duration = HistogramVec::new(
        HistogramOpts::new(
            "registry_loadgen_item_duration_seconds",
            "Elapsed time per processed item in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        &["operation"],
    )?;

    let attempts_total = CounterVec::new(
        Opts::new(
            "registry_loadgen_attempts_total",
            "Push and layer fetch attempts",
        ),
        &["operation", "outcome"],
    )?;

    // Queue and job metrics
    let queue_depth = GaugeVec::new(
        Opts::new("registry_loadgen_queue_depth", "Number of items in queue"),
        &["queue_name"],
    )?;

    let jobs_in_progress = Gauge::new(
        "registry_loadgen_jobs_in_progress",
        "Number of submitted jobs not yet completed",
    )?;

    let jobs_submitted = CounterVec::new(
        Opts::new("registry_loadgen_jobs_submitted_total", "Jobs submitted"),
        &["operation"],
    )?;

    registry.register(Box::new(items_total.clone()))?;
    registry.register(Box::new(item_duration.clone()))?;
    registry.register(Box::new(attempts_total.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(jobs_submitted.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = ITEMS_TOTAL.set(items_total);
    let _ = ITEM_DURATION.set(item_duration);
    let _ = ATTEMPTS_TOTAL.set(attempts_total);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = JOBS_SUBMITTED.set(jobs_submitted);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, the returned
/// string is a single comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// Writes the text export to `path`.
pub async fn write_metrics_file(path: &std::path::Path) -> std::io::Result<()> {
    tokio::fs::write(path, export_metrics()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(items) = ITEMS_TOTAL.get() {
            items.with_label_values(&["push", "success"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.is_empty());
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("registry_loadgen_items_total"));
    }

    #[tokio::test]
    async fn test_write_metrics_file() {
        let _ = init_metrics();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.prom");

        write_metrics_file(&path).await.unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.is_empty());
    }
}
