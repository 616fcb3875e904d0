//! Scheduling policy for the jobs of a sequence.
//!
//! ```text
//!   create ──► job 0 (watcher A, immediate)
//!                │ ready
//!                ▼
//!              job 1 (watcher B, no confirmation)
//!                │ launched
//!                ▼
//!   confirm(1) ► job 2 (watcher C)
//!                │ launched
//!                ▼
//!   confirm(2) ► job 3 (watcher C) ...
//! ```
//!
//! Every wait has a ceiling after which the watcher proceeds anyway. Watcher C
//! starts its ceiling once job i-1 is terminal. Watchers stop when the
//! sequence disappears and only talk to runners through the store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::collaborators::{ArtifactProcessor, Generator};
use super::models::{JobStatus, SequenceStatus};
use super::runner::{JobOutcome, JobRunner, JobSpec};
use super::store::{StateStore, read_result_with_retry};
use super::wait::{Timing, WaitOutcome, wait_until};
use crate::errors::SequenceError;

/// Tunables for a coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub timing: Timing,
    pub max_topics: usize,
    pub max_concurrent_jobs: usize,
    /// When non-empty, forced parameters must come from this list.
    pub allowed_params: Vec<String>,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            timing: Timing::default(),
            max_topics: 20,
            max_concurrent_jobs: 4,
            allowed_params: Vec::new(),
        }
    }
}

/// How a watcher got past its wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unblocked {
    /// The normal trigger: job 0 ready, or job i-1 confirmed.
    Trigger,
    /// The previous job failed; there is nothing to wait for.
    PreviousFailed,
    /// The sequence was deleted or expired.
    Gone,
}

/// Where job i-1 stands before watcher C starts its confirmation wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Predecessor {
    Finished,
    Failed,
    Gone,
}

/// What the watchers of one sequence need to launch its jobs.
#[derive(Debug, Clone)]
struct Plan {
    id: String,
    topics: Vec<String>,
    forced_params: Vec<String>,
}

impl Plan {
    fn len(&self) -> usize {
        self.topics.len()
    }
}

#[derive(Clone)]
pub struct SequenceCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn StateStore>,
    runner: JobRunner,
    options: CoordinatorOptions,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl SequenceCoordinator {
    pub fn new(
        store: Arc<dyn StateStore>,
        generator: Arc<dyn Generator>,
        processors: Vec<Arc<dyn ArtifactProcessor>>,
        options: CoordinatorOptions,
    ) -> Self {
        let cancel = CancellationToken::new();
        let runner = JobRunner::new(
            store.clone(),
            generator,
            processors,
            options.max_concurrent_jobs,
            options.timing,
            cancel.clone(),
        );
        Self {
            inner: Arc::new(Inner {
                store,
                runner,
                options,
                tracker: TaskTracker::new(),
                cancel,
            }),
        }
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        self.inner.store.clone()
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.inner.options
    }

    /// Token cancelled when the coordinator shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Tracked tasks (runners and watchers) still alive.
    pub fn in_flight(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Jobs currently generating.
    pub fn active_jobs(&self) -> usize {
        self.inner.runner.active_jobs()
    }

    /// Create a sequence and start its first job.
    pub async fn create_sequence(
        &self,
        topics: Vec<String>,
        forced_params: Vec<String>,
    ) -> Result<String, SequenceError> {
        if self.inner.tracker.is_closed() {
            return Err(SequenceError::ShuttingDown);
        }
        self.validate(&topics, &forced_params)?;

        let sequence_id = self
            .inner
            .store
            .create_sequence(&topics, &forced_params)
            .await?;
        info!(
            sequence_id = %sequence_id,
            topics = topics.len(),
            forced_params = forced_params.len(),
            "sequence created"
        );

        let sequence = Plan {
            id: sequence_id.clone(),
            topics,
            forced_params,
        };

        if let Err(e) = self
            .inner
            .store
            .set_sequence_status(&sequence_id, SequenceStatus::Active)
            .await
        {
            warn!(sequence_id = %sequence_id, error = %e, "failed to mark sequence active");
        }
        // Watcher A
        self.launch(&sequence, 0, None);

        if sequence.len() > 1 {
            let coordinator = self.clone();
            self.inner
                .tracker
                .spawn(async move { coordinator.watch_first_ready(sequence).await });
        }
        Ok(sequence_id)
    }

    fn validate(&self, topics: &[String], forced_params: &[String]) -> Result<(), SequenceError> {
        let options = &self.inner.options;
        if topics.is_empty() {
            return Err(SequenceError::InvalidRequest(
                "at least one topic is required".into(),
            ));
        }
        if topics.iter().any(|t| t.trim().is_empty()) {
            return Err(SequenceError::InvalidRequest(
                "topics must not be blank".into(),
            ));
        }
        if topics.len() > options.max_topics {
            return Err(SequenceError::InvalidRequest(format!(
                "{} topics requested, at most {} allowed",
                topics.len(),
                options.max_topics
            )));
        }
        if !options.allowed_params.is_empty()
            && let Some(unknown) = forced_params
                .iter()
                .find(|p| !options.allowed_params.contains(*p))
        {
            return Err(SequenceError::InvalidRequest(format!(
                "unknown forced parameter '{}'",
                unknown
            )));
        }
        Ok(())
    }

    /// Spawn the runner for one job. Marks the sequence complete when the
    /// last job reaches a terminal status.
    fn launch(&self, sequence: &Plan, index: usize, continuation: Option<String>) {
        if self.inner.cancel.is_cancelled() {
            debug!(sequence_id = %sequence.id, index, "not launching job during shutdown");
            return;
        }
        let spec = JobSpec {
            sequence_id: sequence.id.clone(),
            index,
            topic: sequence.topics[index].clone(),
            forced_params: sequence.forced_params.clone(),
            continuation,
            wait_for_confirmation: false,
        };
        let coordinator = self.clone();
        self.inner.tracker.spawn(async move {
            let sequence_id = spec.sequence_id.clone();
            let outcome = coordinator.inner.runner.run(spec).await;
            if outcome != JobOutcome::Abandoned {
                coordinator.complete_if_done(&sequence_id).await;
            }
        });
    }

    async fn complete_if_done(&self, sequence_id: &str) {
        let statuses = match self.inner.store.get_all_statuses(sequence_id).await {
            Ok(statuses) => statuses,
            Err(e) => {
                debug!(sequence_id, error = %e, "could not check completion");
                return;
            }
        };
        if statuses.is_empty() || !statuses.values().all(JobStatus::is_terminal) {
            return;
        }
        match self
            .inner
            .store
            .set_sequence_status(sequence_id, SequenceStatus::Complete)
            .await
        {
            Ok(()) => info!(sequence_id, jobs = statuses.len(), "sequence complete"),
            Err(e) => warn!(sequence_id, error = %e, "failed to mark sequence complete"),
        }
    }

    /// Watcher B: start job 1 as soon as job 0 is ready.
    async fn watch_first_ready(self, sequence: Plan) {
        let store = self.inner.store.as_ref();
        let sequence_id = sequence.id.as_str();
        let timing = self.inner.options.timing;

        let outcome = wait_until(
            store,
            timing.poll_interval,
            timing.wait_ceiling,
            &self.inner.cancel,
            || async move {
                match store.get_job_status(sequence_id, 0).await {
                    Ok(Some(status)) if status.has_result() => Some(Unblocked::Trigger),
                    Ok(Some(JobStatus::Error)) => Some(Unblocked::PreviousFailed),
                    Ok(Some(_)) => None,
                    Ok(None) => Some(Unblocked::Gone),
                    Err(e) => {
                        debug!(sequence_id, error = %e, "job 0 status read failed");
                        None
                    }
                }
            },
        )
        .await;

        let Some(continuation) = self.resolve_continuation(&sequence, 1, outcome).await else {
            return;
        };
        self.launch(&sequence, 1, continuation);
        self.spawn_confirmation_watcher(sequence, 2);
    }

    fn spawn_confirmation_watcher(&self, sequence: Plan, index: usize) {
        if index >= sequence.len() || self.inner.cancel.is_cancelled() {
            return;
        }
        let coordinator = self.clone();
        self.inner
            .tracker
            .spawn(async move { coordinator.watch_confirmation(sequence, index).await });
    }

    /// Watcher C: start job `index` once job `index - 1` is confirmed.
    ///
    /// The confirmation ceiling starts counting only once job `index - 1` is
    /// terminal, so a slow predecessor still hands over its content.
    async fn watch_confirmation(self, sequence: Plan, index: usize) {
        let previous = index - 1;
        let outcome = match self.wait_for_predecessor(&sequence, previous).await {
            None => WaitOutcome::Cancelled,
            Some(Predecessor::Gone) => WaitOutcome::Satisfied(Unblocked::Gone),
            Some(Predecessor::Failed) => WaitOutcome::Satisfied(Unblocked::PreviousFailed),
            Some(Predecessor::Finished) => self.wait_for_confirmation(&sequence, previous).await,
        };

        let Some(continuation) = self.resolve_continuation(&sequence, index, outcome).await
        else {
            return;
        };
        self.launch(&sequence, index, continuation);
        self.spawn_confirmation_watcher(sequence, index + 1);
    }

    /// Wait, one ceiling at a time, for job `previous` to reach a terminal
    /// status. Stops waiting early only when the store is still failing at a
    /// ceiling. Returns `None` on shutdown.
    async fn wait_for_predecessor(&self, sequence: &Plan, previous: usize) -> Option<Predecessor> {
        let store = self.inner.store.as_ref();
        let sequence_id = sequence.id.as_str();
        let timing = self.inner.options.timing;
        let store_failing = AtomicBool::new(false);
        let failing = &store_failing;

        loop {
            let outcome = wait_until(
                store,
                timing.poll_interval,
                timing.wait_ceiling,
                &self.inner.cancel,
                || async move {
                    match store.get_job_status(sequence_id, previous).await {
                        Ok(Some(JobStatus::Error)) => Some(Predecessor::Failed),
                        Ok(Some(status)) if status.is_terminal() => Some(Predecessor::Finished),
                        Ok(Some(_)) => {
                            failing.store(false, Ordering::Relaxed);
                            None
                        }
                        Ok(None) => Some(Predecessor::Gone),
                        Err(e) => {
                            debug!(sequence_id, index = previous, error = %e, "job status read failed");
                            failing.store(true, Ordering::Relaxed);
                            None
                        }
                    }
                },
            )
            .await;

            match outcome {
                WaitOutcome::Satisfied(state) => return Some(state),
                WaitOutcome::Cancelled => return None,
                WaitOutcome::TimedOut if failing.load(Ordering::Relaxed) => {
                    warn!(
                        sequence_id,
                        index = previous,
                        "store unavailable, not waiting for job to finish"
                    );
                    return Some(Predecessor::Finished);
                }
                WaitOutcome::TimedOut => {
                    debug!(sequence_id, index = previous, "job still generating, waiting again");
                }
            }
        }
    }

    async fn wait_for_confirmation(
        &self,
        sequence: &Plan,
        previous: usize,
    ) -> WaitOutcome<Unblocked> {
        let store = self.inner.store.as_ref();
        let sequence_id = sequence.id.as_str();
        let timing = self.inner.options.timing;

        wait_until(
            store,
            timing.poll_interval,
            timing.wait_ceiling,
            &self.inner.cancel,
            || async move {
                match store.is_confirmed(sequence_id, previous).await {
                    Ok(true) => return Some(Unblocked::Trigger),
                    Ok(false) => {}
                    Err(e) => {
                        debug!(sequence_id, index = previous, error = %e, "confirmation read failed");
                        return None;
                    }
                }
                match store.get_job_status(sequence_id, previous).await {
                    Ok(Some(JobStatus::Error)) => Some(Unblocked::PreviousFailed),
                    Ok(None) => Some(Unblocked::Gone),
                    _ => None,
                }
            },
        )
        .await
    }

    /// Log how a watcher got unblocked and fetch the previous job's content.
    /// Returns `None` when the watcher should stop.
    async fn resolve_continuation(
        &self,
        sequence: &Plan,
        index: usize,
        outcome: WaitOutcome<Unblocked>,
    ) -> Option<Option<String>> {
        let sequence_id = sequence.id.as_str();
        let previous = index - 1;
        let waited = self.inner.options.timing.wait_ceiling;
        match outcome {
            WaitOutcome::Satisfied(Unblocked::Trigger) => {
                debug!(sequence_id, index, "watcher unblocked");
            }
            WaitOutcome::Satisfied(Unblocked::PreviousFailed) => {
                info!(
                    sequence_id,
                    index,
                    "job {} failed, starting without continuation",
                    previous
                );
                return Some(None);
            }
            WaitOutcome::Satisfied(Unblocked::Gone) => {
                debug!(sequence_id, index, "sequence gone, watcher stopping");
                return None;
            }
            WaitOutcome::TimedOut if !self.sequence_exists(sequence_id).await => {
                debug!(sequence_id, index, "sequence gone, watcher stopping");
                return None;
            }
            WaitOutcome::TimedOut if index == 1 => {
                warn!(
                    sequence_id,
                    index,
                    waited_secs = waited.as_secs_f64(),
                    "job 0 not ready before the ceiling, starting job 1 anyway"
                );
            }
            WaitOutcome::TimedOut => {
                let err = SequenceError::ConfirmationTimeout {
                    sequence_id: sequence_id.to_string(),
                    index: previous,
                    waited,
                };
                warn!(error = %err, "starting job {} unconfirmed", index);
            }
            WaitOutcome::Cancelled => {
                debug!(sequence_id, index, "watcher cancelled");
                return None;
            }
        }

        let retry_delay = self.inner.options.timing.read_retry_delay;
        match read_result_with_retry(self.inner.store.as_ref(), sequence_id, previous, retry_delay)
            .await
        {
            Ok(Some(result)) => Some(Some(result.content)),
            Ok(None) => {
                warn!(
                    sequence_id,
                    index,
                    "no result for job {}, starting without continuation",
                    previous
                );
                Some(None)
            }
            Err(e) => {
                warn!(sequence_id, index, error = %e, "continuation read failed");
                Some(None)
            }
        }
    }

    /// Whether the sequence is still stored. A failing store counts as
    /// present so that watchers keep degrading to launching at the ceiling.
    async fn sequence_exists(&self, sequence_id: &str) -> bool {
        match self.inner.store.get_sequence_info(sequence_id).await {
            Ok(info) => info.is_some(),
            Err(e) => {
                debug!(sequence_id, error = %e, "sequence lookup failed");
                true
            }
        }
    }

    /// Stop accepting sequences, cancel waiting watchers and give running
    /// jobs up to `grace` to finish. Returns whether everything drained.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.inner.tracker.close();
        self.inner.cancel.cancel();
        let drained = tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_ok();
        if drained {
            info!("coordinator drained");
        } else {
            warn!(
                in_flight = self.inner.tracker.len(),
                "coordinator shutdown grace period elapsed"
            );
        }
        drained
    }
}
