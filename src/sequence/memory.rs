//! In-process [`StateStore`] used by tests and by `sequencer run`.
//!
//! Same semantics as the SQLite store, including expiry and the change feed.
//! [`MemoryStore::set_available`] simulates a backend outage.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use super::models::*;
use super::store::{
    CHANGE_FEED_CAPACITY, ChangeKind, StateStore, StoreChange, StoreResult, expiry_from_now,
};
use crate::errors::StoreError;

const MAX_ID_ATTEMPTS: usize = 8;

#[derive(Debug, Clone)]
struct JobEntry {
    status: JobStatus,
    result: Option<JobResult>,
    error: Option<String>,
    confirmed: bool,
}

impl JobEntry {
    fn new() -> Self {
        Self {
            status: JobStatus::Pending,
            result: None,
            error: None,
            confirmed: false,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    sequence: Sequence,
    jobs: Vec<JobEntry>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.sequence.expires_at > now
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    available: Arc<AtomicBool>,
    ttl: Duration,
    changes: broadcast::Sender<StoreChange>,
}

impl MemoryStore {
    pub fn new(ttl: Duration) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
            ttl,
            changes,
        }
    }

    /// Toggle simulated availability. While unavailable every call fails
    /// with [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".into()))
        }
    }

    fn publish(&self, sequence_id: &str, index: Option<usize>, kind: ChangeKind) {
        let _ = self
            .changes
            .send(StoreChange::new(sequence_id, index, kind));
    }

    fn read<R>(&self, f: impl FnOnce(&HashMap<String, Entry>) -> R) -> StoreResult<R> {
        self.check_available()?;
        let guard = self
            .entries
            .read()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {}", e)))?;
        Ok(f(&guard))
    }

    fn write<R>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Entry>) -> StoreResult<R>,
    ) -> StoreResult<R> {
        self.check_available()?;
        let mut guard = self
            .entries
            .write()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {}", e)))?;
        f(&mut guard)
    }

    /// Apply `f` to a live job, then refresh the sequence expiry.
    fn update_job<R>(
        &self,
        sequence_id: &str,
        index: usize,
        f: impl FnOnce(&mut JobEntry) -> StoreResult<R>,
    ) -> StoreResult<R> {
        let ttl = self.ttl;
        self.write(|entries| {
            let not_found = || StoreError::JobNotFound {
                sequence_id: sequence_id.to_string(),
                index,
            };
            let entry = entries
                .get_mut(sequence_id)
                .filter(|e| e.is_live(Utc::now()))
                .ok_or_else(not_found)?;
            let job = entry.jobs.get_mut(index).ok_or_else(not_found)?;
            let out = f(job)?;
            entry.sequence.expires_at = expiry_from_now(ttl);
            Ok(out)
        })
    }

    fn read_job<R>(
        &self,
        sequence_id: &str,
        index: usize,
        f: impl FnOnce(&JobEntry) -> R,
    ) -> StoreResult<Option<R>> {
        self.read(|entries| {
            entries
                .get(sequence_id)
                .filter(|e| e.is_live(Utc::now()))
                .and_then(|e| e.jobs.get(index))
                .map(f)
        })
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn create_sequence(
        &self,
        topics: &[String],
        forced_params: &[String],
    ) -> StoreResult<String> {
        let ttl = self.ttl;
        let id = self.write(|entries| {
            let now = Utc::now();
            for _ in 0..MAX_ID_ATTEMPTS {
                let id = new_sequence_id();
                if entries.get(&id).is_some_and(|e| e.is_live(now)) {
                    continue;
                }
                let sequence = Sequence {
                    id: id.clone(),
                    topics: topics.to_vec(),
                    forced_params: forced_params.to_vec(),
                    status: SequenceStatus::Pending,
                    created_at: now,
                    expires_at: expiry_from_now(ttl),
                };
                let jobs = (0..topics.len()).map(|_| JobEntry::new()).collect();
                entries.insert(id.clone(), Entry { sequence, jobs });
                return Ok(id);
            }
            Err(StoreError::IdExhausted {
                attempts: MAX_ID_ATTEMPTS,
            })
        })?;
        self.publish(&id, None, ChangeKind::Created);
        Ok(id)
    }

    async fn get_sequence_info(&self, sequence_id: &str) -> StoreResult<Option<Sequence>> {
        self.read(|entries| {
            entries
                .get(sequence_id)
                .filter(|e| e.is_live(Utc::now()))
                .map(|e| e.sequence.clone())
        })
    }

    async fn set_sequence_status(
        &self,
        sequence_id: &str,
        status: SequenceStatus,
    ) -> StoreResult<()> {
        let ttl = self.ttl;
        self.write(|entries| {
            if let Some(entry) = entries
                .get_mut(sequence_id)
                .filter(|e| e.is_live(Utc::now()))
            {
                entry.sequence.status = status;
                entry.sequence.expires_at = expiry_from_now(ttl);
            }
            Ok(())
        })?;
        self.publish(sequence_id, None, ChangeKind::SequenceStatus);
        Ok(())
    }

    async fn set_job_status(
        &self,
        sequence_id: &str,
        index: usize,
        status: JobStatus,
    ) -> StoreResult<()> {
        self.update_job(sequence_id, index, |job| {
            if !job.status.can_transition_to(status) {
                return Err(StoreError::InvalidTransition {
                    sequence_id: sequence_id.to_string(),
                    index,
                    from: job.status,
                    to: status,
                });
            }
            job.status = status;
            Ok(())
        })?;
        self.publish(sequence_id, Some(index), ChangeKind::JobStatus);
        Ok(())
    }

    async fn get_job_status(
        &self,
        sequence_id: &str,
        index: usize,
    ) -> StoreResult<Option<JobStatus>> {
        self.read_job(sequence_id, index, |job| job.status)
    }

    async fn get_all_statuses(&self, sequence_id: &str) -> StoreResult<BTreeMap<usize, JobStatus>> {
        self.read(|entries| {
            entries
                .get(sequence_id)
                .filter(|e| e.is_live(Utc::now()))
                .map(|e| {
                    e.jobs
                        .iter()
                        .enumerate()
                        .map(|(i, job)| (i, job.status))
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    async fn set_job_result(
        &self,
        sequence_id: &str,
        index: usize,
        result: &JobResult,
    ) -> StoreResult<()> {
        self.update_job(sequence_id, index, |job| {
            if job.result.is_some() {
                return Err(StoreError::ResultAlreadyWritten {
                    sequence_id: sequence_id.to_string(),
                    index,
                });
            }
            job.result = Some(result.clone());
            Ok(())
        })?;
        self.publish(sequence_id, Some(index), ChangeKind::JobResult);
        Ok(())
    }

    async fn get_job_result(
        &self,
        sequence_id: &str,
        index: usize,
    ) -> StoreResult<Option<JobResult>> {
        Ok(self
            .read_job(sequence_id, index, |job| job.result.clone())?
            .flatten())
    }

    async fn set_job_error(&self, sequence_id: &str, index: usize, detail: &str) -> StoreResult<()> {
        self.update_job(sequence_id, index, |job| {
            job.error = Some(detail.to_string());
            Ok(())
        })?;
        self.publish(sequence_id, Some(index), ChangeKind::JobResult);
        Ok(())
    }

    async fn get_job_error(&self, sequence_id: &str, index: usize) -> StoreResult<Option<String>> {
        Ok(self
            .read_job(sequence_id, index, |job| job.error.clone())?
            .flatten())
    }

    async fn mark_sent(&self, sequence_id: &str, index: usize) -> StoreResult<bool> {
        let flipped = match self.update_job(sequence_id, index, |job| {
            if job.status == JobStatus::Ready {
                job.status = JobStatus::Sent;
                Ok(true)
            } else {
                Ok(false)
            }
        }) {
            Ok(flipped) => flipped,
            Err(StoreError::JobNotFound { .. }) => false,
            Err(e) => return Err(e),
        };
        if flipped {
            self.publish(sequence_id, Some(index), ChangeKind::JobStatus);
        }
        Ok(flipped)
    }

    async fn set_confirmed(&self, sequence_id: &str, index: usize) -> StoreResult<()> {
        self.update_job(sequence_id, index, |job| {
            job.confirmed = true;
            Ok(())
        })?;
        self.publish(sequence_id, Some(index), ChangeKind::Confirmed);
        Ok(())
    }

    async fn is_confirmed(&self, sequence_id: &str, index: usize) -> StoreResult<bool> {
        Ok(self
            .read_job(sequence_id, index, |job| job.confirmed)?
            .unwrap_or(false))
    }

    async fn cleanup_sequence(&self, sequence_id: &str) -> StoreResult<bool> {
        let existed = self.write(|entries| {
            Ok(entries
                .remove(sequence_id)
                .is_some_and(|e| e.is_live(Utc::now())))
        })?;
        self.publish(sequence_id, None, ChangeKind::Removed);
        Ok(existed)
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        self.write(|entries| {
            let now = Utc::now();
            let before = entries.len();
            entries.retain(|_, e| e.is_live(now));
            Ok(before - entries.len())
        })
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<StoreChange>> {
        Some(self.changes.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(86_400);

    fn topics(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("topic {}", i)).collect()
    }

    fn result_for(id: &str, index: usize) -> JobResult {
        JobResult {
            sequence_id: id.to_string(),
            index,
            topic: format!("topic {}", index),
            content: "script".into(),
            forced_param: None,
            context_snippet: None,
            artifacts: vec![],
            generated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_and_read_back() {
        let store = MemoryStore::new(DAY);
        let id = store
            .create_sequence(&topics(3), &["Notion".into()])
            .await
            .unwrap();
        let info = store.get_sequence_info(&id).await.unwrap().unwrap();
        assert_eq!(info.len(), 3);
        assert_eq!(info.forced_params, vec!["Notion".to_string()]);
        let statuses = store.get_all_statuses(&id).await.unwrap();
        assert_eq!(statuses.len(), 3);
        assert!(statuses.values().all(|s| *s == JobStatus::Pending));
    }

    #[tokio::test]
    async fn test_rejects_backward_transition() {
        let store = MemoryStore::new(DAY);
        let id = store.create_sequence(&topics(1), &[]).await.unwrap();
        store.set_job_status(&id, 0, JobStatus::Generating).await.unwrap();
        store.set_job_status(&id, 0, JobStatus::Error).await.unwrap();
        let err = store
            .set_job_status(&id, 0, JobStatus::Ready)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_result_write_once_and_mark_sent_once() {
        let store = MemoryStore::new(DAY);
        let id = store.create_sequence(&topics(1), &[]).await.unwrap();
        store.set_job_result(&id, 0, &result_for(&id, 0)).await.unwrap();
        assert!(store.set_job_result(&id, 0, &result_for(&id, 0)).await.is_err());

        store.set_job_status(&id, 0, JobStatus::Generating).await.unwrap();
        store.set_job_status(&id, 0, JobStatus::Ready).await.unwrap();
        assert!(store.mark_sent(&id, 0).await.unwrap());
        assert!(!store.mark_sent(&id, 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_outage_fails_every_call() {
        let store = MemoryStore::new(DAY);
        let id = store.create_sequence(&topics(1), &[]).await.unwrap();
        store.set_available(false);
        assert!(store.get_job_status(&id, 0).await.unwrap_err().is_unavailable());
        assert!(store.create_sequence(&topics(1), &[]).await.unwrap_err().is_unavailable());
        store.set_available(true);
        assert_eq!(
            store.get_job_status(&id, 0).await.unwrap(),
            Some(JobStatus::Pending)
        );
    }

    #[tokio::test]
    async fn test_zero_ttl_reads_absent() {
        let store = MemoryStore::new(Duration::ZERO);
        let id = store.create_sequence(&topics(2), &[]).await.unwrap();
        assert!(store.get_sequence_info(&id).await.unwrap().is_none());
        assert!(store.get_all_statuses(&id).await.unwrap().is_empty());
        assert!(!store.mark_sent(&id, 0).await.unwrap());
        assert_eq!(store.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_reports_existence() {
        let store = MemoryStore::new(DAY);
        let id = store.create_sequence(&topics(1), &[]).await.unwrap();
        assert!(store.cleanup_sequence(&id).await.unwrap());
        assert!(!store.cleanup_sequence(&id).await.unwrap());
        assert!(!store.is_confirmed(&id, 0).await.unwrap());
    }
}
