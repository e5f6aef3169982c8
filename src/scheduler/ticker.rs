//! Cancellable interval with an optional overall deadline.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Result of waiting on a [`Ticker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// The requested wait elapsed.
    Fire,
    /// The deadline passed before or during the wait.
    DeadlineExceeded,
    /// The cancellation token fired.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Ticker {
    interval: Duration,
    deadline: Option<Instant>,
    started: Instant,
    cancel: CancellationToken,
}

impl Ticker {
    pub fn new(interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            interval,
            deadline: None,
            started: Instant::now(),
            cancel,
        }
    }

    /// Sets a deadline measured from now. `None` waits without limit.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.deadline = timeout.map(|t| Instant::now() + t);
        self
    }

    /// Time since the ticker was created.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Waits one interval.
    pub async fn tick(&self) -> Tick {
        self.sleep(self.interval).await
    }

    /// Waits `duration`, cut short by the deadline or cancellation.
    pub async fn sleep(&self, duration: Duration) -> Tick {
        if self.cancel.is_cancelled() {
            return Tick::Cancelled;
        }

        let (wait, outcome) = match self.deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Tick::DeadlineExceeded;
                }
                if duration >= remaining {
                    (remaining, Tick::DeadlineExceeded)
                } else {
                    (duration, Tick::Fire)
                }
            }
            None => (duration, Tick::Fire),
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Tick::Cancelled,
            _ = tokio::time::sleep(wait) => outcome,
        }
    }
}
