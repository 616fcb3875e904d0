//! Delivery of finished jobs to the consumer.
//!
//! Pull: [`ResultStream::status`] returns a snapshot of every job.
//! Push: [`ResultStream::subscribe`] starts a per-connection loop that emits
//! each `ready` job exactly once, claiming it with the store's `ready -> sent`
//! compare-and-set, so two connections never deliver the same job.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::models::{JobResult, JobStatus, JobView, SequenceStatusView};
use super::store::{StateStore, read_result_with_retry};
use super::wait::Timing;
use crate::errors::SequenceError;

/// Events sent to a push subscriber, in emission order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    JobReady {
        sequence_id: String,
        index: usize,
        result: JobResult,
    },
    JobFailed {
        sequence_id: String,
        index: usize,
        error: String,
    },
    SequenceComplete {
        sequence_id: String,
        total: usize,
        succeeded: usize,
        failed: usize,
    },
}

impl StreamEvent {
    /// Event name, matching the serialized `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::JobReady { .. } => "job_ready",
            Self::JobFailed { .. } => "job_failed",
            Self::SequenceComplete { .. } => "sequence_complete",
        }
    }
}

const EVENT_BUFFER: usize = 32;
const UNKNOWN_ERROR: &str = "unknown error";
const MISSING_RESULT: &str = "result missing for ready job";

#[derive(Clone)]
pub struct ResultStream {
    store: Arc<dyn StateStore>,
    timing: Timing,
    shutdown: CancellationToken,
}

impl ResultStream {
    pub fn new(store: Arc<dyn StateStore>, timing: Timing, shutdown: CancellationToken) -> Self {
        Self {
            store,
            timing,
            shutdown,
        }
    }

    /// Snapshot of a sequence. Failed jobs always carry an error entry.
    pub async fn status(&self, sequence_id: &str) -> Result<SequenceStatusView, SequenceError> {
        let info = self
            .store
            .get_sequence_info(sequence_id)
            .await?
            .ok_or_else(|| SequenceError::SequenceNotFound {
                id: sequence_id.to_string(),
            })?;
        let statuses = self.store.get_all_statuses(sequence_id).await?;

        let mut results = BTreeMap::new();
        for (&index, &status) in &statuses {
            let view = match status {
                JobStatus::Ready | JobStatus::Sent => JobView {
                    status,
                    data: read_result_with_retry(
                        self.store.as_ref(),
                        sequence_id,
                        index,
                        self.timing.read_retry_delay,
                    )
                    .await?,
                    error: None,
                },
                JobStatus::Error => JobView {
                    status,
                    data: None,
                    error: Some(
                        self.store
                            .get_job_error(sequence_id, index)
                            .await?
                            .unwrap_or_else(|| UNKNOWN_ERROR.to_string()),
                    ),
                },
                JobStatus::Pending | JobStatus::Generating => continue,
            };
            results.insert(index, view);
        }

        let total = info.len();
        let complete = statuses.len() == total && statuses.values().all(JobStatus::is_terminal);
        Ok(SequenceStatusView {
            sequence_id: info.id,
            sequence_status: info.status,
            total,
            status: statuses,
            results,
            complete,
        })
    }

    /// Start a push loop for one consumer. The receiver yields events until
    /// the sequence completes, disappears, or the service shuts down.
    pub async fn subscribe(
        &self,
        sequence_id: &str,
    ) -> Result<mpsc::Receiver<StreamEvent>, SequenceError> {
        if self.store.get_sequence_info(sequence_id).await?.is_none() {
            return Err(SequenceError::SequenceNotFound {
                id: sequence_id.to_string(),
            });
        }
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let stream = self.clone();
        let sequence_id = sequence_id.to_string();
        tokio::spawn(async move {
            stream.push_loop(&sequence_id, tx).await;
            debug!(sequence_id = %sequence_id, "push stream ended");
        });
        Ok(rx)
    }

    async fn push_loop(&self, sequence_id: &str, tx: mpsc::Sender<StreamEvent>) {
        let mut reported_failures = HashSet::new();
        let mut changes = self.store.subscribe();

        loop {
            match self.tick(sequence_id, &tx, &mut reported_failures).await {
                Tick::Continue => {}
                Tick::Stop => return,
            }

            let mut feed_closed = false;
            match changes.as_mut() {
                Some(feed) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = tx.closed() => return,
                        _ = tokio::time::sleep(self.timing.poll_interval) => {}
                        recv = feed.recv() => {
                            feed_closed = matches!(recv, Err(tokio::sync::broadcast::error::RecvError::Closed));
                        }
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = tx.closed() => return,
                        _ = tokio::time::sleep(self.timing.poll_interval) => {}
                    }
                }
            }
            if feed_closed {
                changes = None;
            }
        }
    }

    /// One scan over the sequence, in index order. A ready job that hits a
    /// store error ends the scan so later jobs are never emitted ahead of it.
    async fn tick(
        &self,
        sequence_id: &str,
        tx: &mpsc::Sender<StreamEvent>,
        reported_failures: &mut HashSet<usize>,
    ) -> Tick {
        let statuses = match self.store.get_all_statuses(sequence_id).await {
            Ok(statuses) => statuses,
            Err(e) => {
                debug!(sequence_id, error = %e, "status scan failed, retrying");
                return Tick::Continue;
            }
        };
        if statuses.is_empty() {
            info!(sequence_id, "sequence no longer exists, closing stream");
            return Tick::Stop;
        }

        let mut all_terminal = true;
        let (mut succeeded, mut failed) = (0, 0);
        for (&index, &status) in &statuses {
            match status {
                JobStatus::Ready if reported_failures.contains(&index) => failed += 1,
                JobStatus::Ready => match self.deliver(sequence_id, index, tx).await {
                    Delivery::Done => succeeded += 1,
                    Delivery::NotYet => return Tick::Continue,
                    Delivery::ResultMissing => {
                        warn!(sequence_id, index, "job is ready but has no result");
                        failed += 1;
                        reported_failures.insert(index);
                        let event = StreamEvent::JobFailed {
                            sequence_id: sequence_id.to_string(),
                            index,
                            error: MISSING_RESULT.to_string(),
                        };
                        if tx.send(event).await.is_err() {
                            return Tick::Stop;
                        }
                    }
                    Delivery::ConsumerGone => return Tick::Stop,
                },
                JobStatus::Sent => succeeded += 1,
                JobStatus::Error => {
                    failed += 1;
                    if reported_failures.insert(index) {
                        let error = match self.store.get_job_error(sequence_id, index).await {
                            Ok(detail) => detail.unwrap_or_else(|| UNKNOWN_ERROR.to_string()),
                            Err(e) => {
                                debug!(sequence_id, index, error = %e, "error read failed");
                                reported_failures.remove(&index);
                                return Tick::Continue;
                            }
                        };
                        let event = StreamEvent::JobFailed {
                            sequence_id: sequence_id.to_string(),
                            index,
                            error,
                        };
                        if tx.send(event).await.is_err() {
                            return Tick::Stop;
                        }
                    }
                }
                JobStatus::Pending | JobStatus::Generating => all_terminal = false,
            }
        }

        if !all_terminal {
            return Tick::Continue;
        }
        let event = StreamEvent::SequenceComplete {
            sequence_id: sequence_id.to_string(),
            total: statuses.len(),
            succeeded,
            failed,
        };
        let _ = tx.send(event).await;
        info!(sequence_id, succeeded, failed, "sequence delivered");
        Tick::Stop
    }

    /// Claim a `ready` job and emit it. A lost claim means another consumer
    /// delivered it. `NotYet` covers store errors worth another scan.
    async fn deliver(
        &self,
        sequence_id: &str,
        index: usize,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Delivery {
        let result = match read_result_with_retry(
            self.store.as_ref(),
            sequence_id,
            index,
            self.timing.read_retry_delay,
        )
        .await
        {
            Ok(Some(result)) => result,
            Ok(None) => return Delivery::ResultMissing,
            Err(e) => {
                debug!(sequence_id, index, error = %e, "result read failed");
                return Delivery::NotYet;
            }
        };
        match self.store.mark_sent(sequence_id, index).await {
            Ok(true) => {}
            Ok(false) => return Delivery::Done,
            Err(e) => {
                debug!(sequence_id, index, error = %e, "could not claim job");
                return Delivery::NotYet;
            }
        }
        let event = StreamEvent::JobReady {
            sequence_id: sequence_id.to_string(),
            index,
            result,
        };
        if tx.send(event).await.is_err() {
            return Delivery::ConsumerGone;
        }
        debug!(sequence_id, index, "job delivered");
        Delivery::Done
    }
}

enum Tick {
    Continue,
    Stop,
}

enum Delivery {
    Done,
    NotYet,
    ResultMissing,
    ConsumerGone,
}
