//! Bounded waits on store state.
//!
//! A wait re-runs its check every poll interval, and additionally whenever
//! the store's change feed reports a write. It never blocks past its
//! ceiling: callers decide what "proceed anyway" means.

use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::store::StateStore;

/// Intervals shared by the runner, watchers and the push stream.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub poll_interval: Duration,
    pub wait_ceiling: Duration,
    /// Pause between writing a result and flipping the job to `ready`.
    pub settle_delay: Duration,
    /// Delay before re-reading a result that was not visible yet.
    pub read_retry_delay: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            wait_ceiling: Duration::from_secs(300),
            settle_delay: Duration::from_millis(100),
            read_retry_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    Satisfied(T),
    TimedOut,
    Cancelled,
}

/// Wait until `check` yields `Some`, the ceiling passes, or `cancel` fires.
pub async fn wait_until<T, F, Fut>(
    store: &dyn StateStore,
    poll_interval: Duration,
    ceiling: Duration,
    cancel: &CancellationToken,
    mut check: F,
) -> WaitOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + ceiling;
    let mut changes = store.subscribe();

    loop {
        if cancel.is_cancelled() {
            return WaitOutcome::Cancelled;
        }
        if let Some(value) = check().await {
            return WaitOutcome::Satisfied(value);
        }
        let now = Instant::now();
        if now >= deadline {
            return WaitOutcome::TimedOut;
        }
        let nap = poll_interval.min(deadline - now);

        let mut feed_closed = false;
        match changes.as_mut() {
            Some(rx) => {
                tokio::select! {
                    _ = cancel.cancelled() => return WaitOutcome::Cancelled,
                    _ = tokio::time::sleep(nap) => {}
                    recv = rx.recv() => {
                        feed_closed = matches!(recv, Err(RecvError::Closed));
                    }
                }
            }
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => return WaitOutcome::Cancelled,
                    _ = tokio::time::sleep(nap) => {}
                }
            }
        }
        if feed_closed {
            changes = None;
        }
    }
}
