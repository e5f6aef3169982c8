//! Bounded, supervised fan-out of per-item tasks.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::metrics::MetricsCollector;

use super::result::ExecutionResult;

/// Runs `process` for every item with at most `concurrency` in flight.
///
/// Each item runs in its own task. Items for which `process` returns `None`
/// produce no result. A panicking task is logged and the rest continue.
/// Results come back in completion order.
pub async fn run_bounded<F, Fut>(
    items: Vec<String>,
    concurrency: usize,
    label: &'static str,
    process: F,
) -> Vec<ExecutionResult>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<ExecutionResult>> + Send + 'static,
{
    let total = items.len();
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let process = Arc::new(process);
    let metrics = MetricsCollector::new();
    let mut tasks = JoinSet::new();

    for item in items {
        let semaphore = Arc::clone(&semaphore);
        let process = Arc::clone(&process);
        tasks.spawn(async move {
            // The semaphore is never closed.
            let _permit = semaphore.acquire_owned().await.ok();
            process(item).await
        });
    }

    let mut results = Vec::with_capacity(total);
    let mut finished = 0usize;
    while let Some(joined) = tasks.join_next().await {
        finished += 1;
        match joined {
            Ok(Some(result)) => {
                metrics.record_item(
                    result.operation.as_str(),
                    result.successful,
                    result.elapsed_time,
                );
                results.push(result);
            }
            Ok(None) => {}
            Err(e) => error!(error = %e, "{} task failed", label),
        }

        if finished % 10 == 0 {
            info!("{}/{} {} completed", finished, total, label);
        }
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::Operation;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ok(item: String) -> Option<ExecutionResult> {
        let now = Utc::now();
        Some(ExecutionResult::timed(item, Operation::Pull, now, now, 1, 0, true))
    }

    #[tokio::test]
    async fn test_all_items_processed() {
        let items: Vec<String> = (0..25).map(|i| format!("r/o/x:{}", i)).collect();
        let results = run_bounded(items, 4, "pulls", |item| async move { ok(item) }).await;
        assert_eq!(results.len(), 25);
    }

    #[tokio::test]
    async fn test_none_and_panic_are_isolated() {
        let items: Vec<String> = vec!["keep:1".into(), "drop:2".into(), "panic:3".into(), "keep:4".into()];
        let results = run_bounded(items, 2, "pulls", |item| async move {
            if item.starts_with("panic") {
                panic!("simulated worker crash");
            }
            if item.starts_with("drop") {
                return None;
            }
            ok(item)
        })
        .await;

        let mut tags: Vec<_> = results.into_iter().map(|r| r.item).collect();
        tags.sort();
        assert_eq!(tags, vec!["keep:1", "keep:4"]);
    }

    #[tokio::test]
    async fn test_concurrency_bound() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let items: Vec<String> = (0..20).map(|i| i.to_string()).collect();

        let (f, p) = (Arc::clone(&in_flight), Arc::clone(&peak));
        run_bounded(items, 3, "pushes", move |item| {
            let in_flight = Arc::clone(&f);
            let peak = Arc::clone(&p);
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                ok(item)
            }
        })
        .await;

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }
}
