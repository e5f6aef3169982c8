//! Blind bounded retry.
//!
//! Attempts run back to back with no delay and no error inspection: any
//! failure consumes one attempt.

use std::future::Future;

/// Default number of attempts per push and per layer.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Outcome of a retried operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome<T> {
    /// Value of the first successful attempt, if any.
    pub value: Option<T>,
    /// Number of attempts that failed.
    pub failures: u32,
}

impl<T> RetryOutcome<T> {
    pub fn succeeded(&self) -> bool {
        self.value.is_some()
    }
}

/// Runs `attempt` up to `max_attempts` times, stopping at the first `Ok`.
///
/// `max_attempts` of zero is treated as one. The closure receives the
/// 1-based attempt number; the last error of each failed attempt is passed
/// to `on_failure` for logging.
pub async fn retry_blind<T, E, F, Fut>(
    max_attempts: u32,
    mut attempt: F,
    mut on_failure: impl FnMut(u32, &E),
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = max_attempts.max(1);
    let mut failures = 0;

    for n in 1..=max_attempts {
        match attempt(n).await {
            Ok(value) => {
                return RetryOutcome {
                    value: Some(value),
                    failures,
                }
            }
            Err(e) => {
                failures += 1;
                on_failure(n, &e);
            }
        }
    }

    RetryOutcome {
        value: None,
        failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_always_failing_uses_every_attempt() {
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<()> = retry_blind(
            3,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("boom") }
            },
            |_, _| {},
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.failures, 3);
        assert!(!outcome.succeeded());
    }

    #[tokio::test]
    async fn test_stops_on_first_success() {
        let calls = AtomicU32::new(0);
        let outcome = retry_blind(
            5,
            |n| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("transient")
                    } else {
                        Ok(n)
                    }
                }
            },
            |_, _| {},
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.value, Some(2));
        assert_eq!(outcome.failures, 1);
    }

    #[tokio::test]
    async fn test_zero_attempts_runs_once() {
        let outcome = retry_blind(0, |_| async { Err::<(), _>(()) }, |_, _| {}).await;
        assert_eq!(outcome.failures, 1);
    }
}
