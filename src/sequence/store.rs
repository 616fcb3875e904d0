//! The state store contract shared by every role in the sequencer.
//!
//! Job runners, watchers, the confirmation gate and the result stream never
//! talk to each other directly: every observation and every write goes
//! through a [`StateStore`]. Implementations live in [`super::db`] (SQLite)
//! and [`super::memory`] (in-process).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::models::{JobResult, JobStatus, Sequence, SequenceStatus};
use crate::errors::StoreError;

pub type StoreResult<T> = Result<T, StoreError>;

/// Capacity of the in-process change feed.
pub(crate) const CHANGE_FEED_CAPACITY: usize = 1024;

/// What kind of key a write touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    SequenceStatus,
    JobStatus,
    JobResult,
    Confirmed,
    Removed,
}

/// Notification published after a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub sequence_id: String,
    pub index: Option<usize>,
    pub kind: ChangeKind,
}

impl StoreChange {
    pub(crate) fn new(sequence_id: &str, index: Option<usize>, kind: ChangeKind) -> Self {
        Self {
            sequence_id: sequence_id.to_string(),
            index,
            kind,
        }
    }
}

/// Durable key-value state for sequences and their jobs.
///
/// Every write refreshes the expiry of the rows it touches. Reads only see
/// unexpired state; an expired sequence reads as absent.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Create a sequence with every job `pending`. Returns the new id.
    async fn create_sequence(&self, topics: &[String], forced_params: &[String])
    -> StoreResult<String>;

    async fn get_sequence_info(&self, sequence_id: &str) -> StoreResult<Option<Sequence>>;

    async fn set_sequence_status(&self, sequence_id: &str, status: SequenceStatus)
    -> StoreResult<()>;

    /// Write a job status. Transitions that would reverse the lifecycle are
    /// rejected with [`StoreError::InvalidTransition`].
    async fn set_job_status(&self, sequence_id: &str, index: usize, status: JobStatus)
    -> StoreResult<()>;

    async fn get_job_status(&self, sequence_id: &str, index: usize)
    -> StoreResult<Option<JobStatus>>;

    async fn get_all_statuses(&self, sequence_id: &str)
    -> StoreResult<BTreeMap<usize, JobStatus>>;

    /// Write a job result. A second write is rejected.
    async fn set_job_result(&self, sequence_id: &str, index: usize, result: &JobResult)
    -> StoreResult<()>;

    async fn get_job_result(&self, sequence_id: &str, index: usize)
    -> StoreResult<Option<JobResult>>;

    async fn set_job_error(&self, sequence_id: &str, index: usize, detail: &str)
    -> StoreResult<()>;

    async fn get_job_error(&self, sequence_id: &str, index: usize) -> StoreResult<Option<String>>;

    /// Atomically flip `ready` to `sent`. Returns false if the job was not
    /// `ready` (already sent by someone else, or not finished yet).
    async fn mark_sent(&self, sequence_id: &str, index: usize) -> StoreResult<bool>;

    async fn set_confirmed(&self, sequence_id: &str, index: usize) -> StoreResult<()>;

    async fn is_confirmed(&self, sequence_id: &str, index: usize) -> StoreResult<bool>;

    /// Remove every key belonging to a sequence. Returns whether it existed.
    async fn cleanup_sequence(&self, sequence_id: &str) -> StoreResult<bool>;

    /// Drop expired sequences. Returns how many were removed.
    async fn purge_expired(&self) -> StoreResult<usize>;

    /// Feed of writes made through this handle, if the backend is embedded.
    fn subscribe(&self) -> Option<broadcast::Receiver<StoreChange>> {
        None
    }
}

/// Read a job result, retrying once after `delay` if the first read comes
/// back absent. Papers over read-after-write lag between a `ready` status
/// observation and the result becoming visible.
pub async fn read_result_with_retry(
    store: &dyn StateStore,
    sequence_id: &str,
    index: usize,
    delay: Duration,
) -> StoreResult<Option<JobResult>> {
    if let Some(result) = store.get_job_result(sequence_id, index).await? {
        return Ok(Some(result));
    }
    tokio::time::sleep(delay).await;
    store.get_job_result(sequence_id, index).await
}

/// Expiry timestamp for a write happening now.
pub(crate) fn expiry_from_now(ttl: Duration) -> chrono::DateTime<chrono::Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    chrono::Utc::now()
        .checked_add_signed(ttl)
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC)
}
