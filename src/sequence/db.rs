use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::broadcast;

use super::models::*;
use super::store::{
    CHANGE_FEED_CAPACITY, ChangeKind, StateStore, StoreChange, StoreResult, expiry_from_now,
};
use crate::errors::StoreError;

/// Attempts at drawing a fresh sequence id before giving up.
const MAX_ID_ATTEMPTS: usize = 8;

fn unavailable(err: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Async-safe handle to the sequence database.
///
/// Wraps `SequenceDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<SequenceDb>>,
}

impl DbHandle {
    pub fn new(db: SequenceDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&SequenceDb) -> StoreResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| unavailable(format!("DB lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .map_err(|e| unavailable(format!("DB task panicked: {}", e)))?
    }
}

pub struct SequenceDb {
    conn: Connection,
}

impl SequenceDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path).map_err(unavailable)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(unavailable)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> StoreResult<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(unavailable)?;
        // In-memory databases answer "memory" here.
        let _mode: String = self
            .conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(unavailable)?;
        self.run_migrations()
    }

    fn run_migrations(&self) -> StoreResult<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS sequences (
                    id TEXT PRIMARY KEY,
                    topics TEXT NOT NULL,
                    forced_params TEXT NOT NULL DEFAULT '[]',
                    status TEXT NOT NULL DEFAULT 'pending',
                    created_at TEXT NOT NULL,
                    expires_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS jobs (
                    sequence_id TEXT NOT NULL REFERENCES sequences(id) ON DELETE CASCADE,
                    idx INTEGER NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    result TEXT,
                    error TEXT,
                    confirmed INTEGER NOT NULL DEFAULT 0,
                    expires_at INTEGER NOT NULL,
                    PRIMARY KEY (sequence_id, idx)
                );

                CREATE INDEX IF NOT EXISTS idx_sequences_expiry ON sequences(expires_at);
                ",
            )
            .map_err(unavailable)
    }

    fn live_sequence_exists(&self, id: &str) -> StoreResult<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM sequences WHERE id = ?1 AND expires_at > ?2",
                params![id, now_ms()],
                |row| row.get(0),
            )
            .optional()
            .map_err(unavailable)?;
        Ok(found.is_some())
    }

    pub fn create_sequence(
        &self,
        topics: &[String],
        forced_params: &[String],
        ttl: Duration,
    ) -> StoreResult<String> {
        let topics_json = serde_json::to_string(topics).map_err(unavailable)?;
        let params_json = serde_json::to_string(forced_params).map_err(unavailable)?;
        let expires_at = expiry_from_now(ttl).timestamp_millis();
        let created_at = Utc::now().to_rfc3339();

        for _ in 0..MAX_ID_ATTEMPTS {
            let id = new_sequence_id();
            if self.live_sequence_exists(&id)? {
                continue;
            }
            // An expired row with the same id is garbage; reclaim it.
            self.conn
                .execute("DELETE FROM sequences WHERE id = ?1", params![id])
                .map_err(unavailable)?;

            let tx = self.conn.unchecked_transaction().map_err(unavailable)?;
            tx.execute(
                "INSERT INTO sequences (id, topics, forced_params, status, created_at, expires_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?5)",
                params![id, topics_json, params_json, created_at, expires_at],
            )
            .map_err(unavailable)?;
            for idx in 0..topics.len() {
                tx.execute(
                    "INSERT INTO jobs (sequence_id, idx, status, expires_at)
                     VALUES (?1, ?2, 'pending', ?3)",
                    params![id, idx as i64, expires_at],
                )
                .map_err(unavailable)?;
            }
            tx.commit().map_err(unavailable)?;
            return Ok(id);
        }
        Err(StoreError::IdExhausted {
            attempts: MAX_ID_ATTEMPTS,
        })
    }

    pub fn get_sequence_info(&self, id: &str) -> StoreResult<Option<Sequence>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, topics, forced_params, status, created_at, expires_at
                 FROM sequences WHERE id = ?1 AND expires_at > ?2",
                params![id, now_ms()],
                |row| {
                    Ok(SequenceRow {
                        id: row.get(0)?,
                        topics: row.get(1)?,
                        forced_params: row.get(2)?,
                        status: row.get(3)?,
                        created_at: row.get(4)?,
                        expires_at: row.get(5)?,
                    })
                },
            )
            .optional()
            .map_err(unavailable)?;
        row.map(SequenceRow::into_sequence).transpose()
    }

    /// Refresh the expiry of a sequence and all of its jobs.
    fn touch(&self, id: &str, ttl: Duration) -> StoreResult<()> {
        let expires_at = expiry_from_now(ttl).timestamp_millis();
        let now = now_ms();
        self.conn
            .execute(
                "UPDATE sequences SET expires_at = ?2 WHERE id = ?1 AND expires_at > ?3",
                params![id, expires_at, now],
            )
            .map_err(unavailable)?;
        self.conn
            .execute(
                "UPDATE jobs SET expires_at = ?2 WHERE sequence_id = ?1 AND expires_at > ?3",
                params![id, expires_at, now],
            )
            .map_err(unavailable)?;
        Ok(())
    }

    pub fn set_sequence_status(
        &self,
        id: &str,
        status: SequenceStatus,
        ttl: Duration,
    ) -> StoreResult<()> {
        self.conn
            .execute(
                "UPDATE sequences SET status = ?2 WHERE id = ?1 AND expires_at > ?3",
                params![id, status.as_str(), now_ms()],
            )
            .map_err(unavailable)?;
        self.touch(id, ttl)
    }

    fn job_column(&self, id: &str, index: usize, column: &str) -> StoreResult<Option<Option<String>>> {
        // `column` is always a fixed identifier chosen by this module.
        let sql = format!(
            "SELECT {} FROM jobs WHERE sequence_id = ?1 AND idx = ?2 AND expires_at > ?3",
            column
        );
        self.conn
            .query_row(&sql, params![id, index as i64, now_ms()], |row| row.get(0))
            .optional()
            .map_err(unavailable)
    }

    pub fn get_job_status(&self, id: &str, index: usize) -> StoreResult<Option<JobStatus>> {
        match self.job_column(id, index, "status")?.flatten() {
            Some(raw) => raw.parse().map(Some).map_err(unavailable),
            None => Ok(None),
        }
    }

    pub fn set_job_status(
        &self,
        id: &str,
        index: usize,
        status: JobStatus,
        ttl: Duration,
    ) -> StoreResult<()> {
        let current = self
            .get_job_status(id, index)?
            .ok_or_else(|| StoreError::JobNotFound {
                sequence_id: id.to_string(),
                index,
            })?;
        if !current.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                sequence_id: id.to_string(),
                index,
                from: current,
                to: status,
            });
        }
        self.conn
            .execute(
                "UPDATE jobs SET status = ?3
                 WHERE sequence_id = ?1 AND idx = ?2 AND expires_at > ?4",
                params![id, index as i64, status.as_str(), now_ms()],
            )
            .map_err(unavailable)?;
        self.touch(id, ttl)
    }

    pub fn get_all_statuses(&self, id: &str) -> StoreResult<BTreeMap<usize, JobStatus>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT idx, status FROM jobs
                 WHERE sequence_id = ?1 AND expires_at > ?2 ORDER BY idx",
            )
            .map_err(unavailable)?;
        let rows = stmt
            .query_map(params![id, now_ms()], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(unavailable)?;
        let mut statuses = BTreeMap::new();
        for row in rows {
            let (idx, raw) = row.map_err(unavailable)?;
            let status: JobStatus = raw.parse().map_err(unavailable)?;
            statuses.insert(idx as usize, status);
        }
        Ok(statuses)
    }

    pub fn set_job_result(
        &self,
        id: &str,
        index: usize,
        result: &JobResult,
        ttl: Duration,
    ) -> StoreResult<()> {
        let json = serde_json::to_string(result).map_err(unavailable)?;
        let updated = self
            .conn
            .execute(
                "UPDATE jobs SET result = ?3
                 WHERE sequence_id = ?1 AND idx = ?2 AND result IS NULL AND expires_at > ?4",
                params![id, index as i64, json, now_ms()],
            )
            .map_err(unavailable)?;
        if updated == 0 {
            return match self.job_column(id, index, "result")? {
                None => Err(StoreError::JobNotFound {
                    sequence_id: id.to_string(),
                    index,
                }),
                Some(_) => Err(StoreError::ResultAlreadyWritten {
                    sequence_id: id.to_string(),
                    index,
                }),
            };
        }
        self.touch(id, ttl)
    }

    pub fn get_job_result(&self, id: &str, index: usize) -> StoreResult<Option<JobResult>> {
        match self.job_column(id, index, "result")?.flatten() {
            Some(json) => serde_json::from_str(&json).map(Some).map_err(unavailable),
            None => Ok(None),
        }
    }

    pub fn set_job_error(
        &self,
        id: &str,
        index: usize,
        detail: &str,
        ttl: Duration,
    ) -> StoreResult<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE jobs SET error = ?3
                 WHERE sequence_id = ?1 AND idx = ?2 AND expires_at > ?4",
                params![id, index as i64, detail, now_ms()],
            )
            .map_err(unavailable)?;
        if updated == 0 {
            return Err(StoreError::JobNotFound {
                sequence_id: id.to_string(),
                index,
            });
        }
        self.touch(id, ttl)
    }

    pub fn get_job_error(&self, id: &str, index: usize) -> StoreResult<Option<String>> {
        Ok(self.job_column(id, index, "error")?.flatten())
    }

    pub fn mark_sent(&self, id: &str, index: usize, ttl: Duration) -> StoreResult<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE jobs SET status = 'sent'
                 WHERE sequence_id = ?1 AND idx = ?2 AND status = 'ready' AND expires_at > ?3",
                params![id, index as i64, now_ms()],
            )
            .map_err(unavailable)?;
        if updated == 1 {
            self.touch(id, ttl)?;
        }
        Ok(updated == 1)
    }

    pub fn set_confirmed(&self, id: &str, index: usize, ttl: Duration) -> StoreResult<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE jobs SET confirmed = 1
                 WHERE sequence_id = ?1 AND idx = ?2 AND expires_at > ?3",
                params![id, index as i64, now_ms()],
            )
            .map_err(unavailable)?;
        if updated == 0 {
            return Err(StoreError::JobNotFound {
                sequence_id: id.to_string(),
                index,
            });
        }
        self.touch(id, ttl)
    }

    pub fn is_confirmed(&self, id: &str, index: usize) -> StoreResult<bool> {
        let confirmed: Option<i64> = self
            .conn
            .query_row(
                "SELECT confirmed FROM jobs
                 WHERE sequence_id = ?1 AND idx = ?2 AND expires_at > ?3",
                params![id, index as i64, now_ms()],
                |row| row.get(0),
            )
            .optional()
            .map_err(unavailable)?;
        Ok(confirmed == Some(1))
    }

    pub fn cleanup_sequence(&self, id: &str) -> StoreResult<bool> {
        let existed = self.live_sequence_exists(id)?;
        self.conn
            .execute("DELETE FROM sequences WHERE id = ?1", params![id])
            .map_err(unavailable)?;
        Ok(existed)
    }

    pub fn purge_expired(&self) -> StoreResult<usize> {
        let now = now_ms();
        self.conn
            .execute("DELETE FROM jobs WHERE expires_at <= ?1", params![now])
            .map_err(unavailable)?;
        self.conn
            .execute("DELETE FROM sequences WHERE expires_at <= ?1", params![now])
            .map_err(unavailable)
    }
}

struct SequenceRow {
    id: String,
    topics: String,
    forced_params: String,
    status: String,
    created_at: String,
    expires_at: i64,
}

impl SequenceRow {
    fn into_sequence(self) -> StoreResult<Sequence> {
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(unavailable)?
            .with_timezone(&Utc);
        let expires_at = DateTime::<Utc>::from_timestamp_millis(self.expires_at)
            .ok_or_else(|| unavailable(format!("bad expiry {}", self.expires_at)))?;
        Ok(Sequence {
            id: self.id,
            topics: serde_json::from_str(&self.topics).map_err(unavailable)?,
            forced_params: serde_json::from_str(&self.forced_params).map_err(unavailable)?,
            status: self.status.parse().map_err(unavailable)?,
            created_at,
            expires_at,
        })
    }
}

/// [`StateStore`] backed by SQLite.
#[derive(Clone)]
pub struct SqliteStore {
    db: DbHandle,
    ttl: Duration,
    changes: broadcast::Sender<StoreChange>,
}

impl SqliteStore {
    pub fn new(db: SequenceDb, ttl: Duration) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            db: DbHandle::new(db),
            ttl,
            changes,
        }
    }

    pub fn open(path: &Path, ttl: Duration) -> StoreResult<Self> {
        Ok(Self::new(SequenceDb::new(path)?, ttl))
    }

    pub fn in_memory(ttl: Duration) -> StoreResult<Self> {
        Ok(Self::new(SequenceDb::new_in_memory()?, ttl))
    }

    fn publish(&self, sequence_id: &str, index: Option<usize>, kind: ChangeKind) {
        // No receivers is fine.
        let _ = self
            .changes
            .send(StoreChange::new(sequence_id, index, kind));
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn create_sequence(
        &self,
        topics: &[String],
        forced_params: &[String],
    ) -> StoreResult<String> {
        let topics = topics.to_vec();
        let forced_params = forced_params.to_vec();
        let ttl = self.ttl;
        let id = self
            .db
            .call(move |db| db.create_sequence(&topics, &forced_params, ttl))
            .await?;
        self.publish(&id, None, ChangeKind::Created);
        Ok(id)
    }

    async fn get_sequence_info(&self, sequence_id: &str) -> StoreResult<Option<Sequence>> {
        let id = sequence_id.to_string();
        self.db.call(move |db| db.get_sequence_info(&id)).await
    }

    async fn set_sequence_status(
        &self,
        sequence_id: &str,
        status: SequenceStatus,
    ) -> StoreResult<()> {
        let id = sequence_id.to_string();
        let ttl = self.ttl;
        self.db
            .call(move |db| db.set_sequence_status(&id, status, ttl))
            .await?;
        self.publish(sequence_id, None, ChangeKind::SequenceStatus);
        Ok(())
    }

    async fn set_job_status(
        &self,
        sequence_id: &str,
        index: usize,
        status: JobStatus,
    ) -> StoreResult<()> {
        let id = sequence_id.to_string();
        let ttl = self.ttl;
        self.db
            .call(move |db| db.set_job_status(&id, index, status, ttl))
            .await?;
        self.publish(sequence_id, Some(index), ChangeKind::JobStatus);
        Ok(())
    }

    async fn get_job_status(
        &self,
        sequence_id: &str,
        index: usize,
    ) -> StoreResult<Option<JobStatus>> {
        let id = sequence_id.to_string();
        self.db.call(move |db| db.get_job_status(&id, index)).await
    }

    async fn get_all_statuses(&self, sequence_id: &str) -> StoreResult<BTreeMap<usize, JobStatus>> {
        let id = sequence_id.to_string();
        self.db.call(move |db| db.get_all_statuses(&id)).await
    }

    async fn set_job_result(
        &self,
        sequence_id: &str,
        index: usize,
        result: &JobResult,
    ) -> StoreResult<()> {
        let id = sequence_id.to_string();
        let result = result.clone();
        let ttl = self.ttl;
        self.db
            .call(move |db| db.set_job_result(&id, index, &result, ttl))
            .await?;
        self.publish(sequence_id, Some(index), ChangeKind::JobResult);
        Ok(())
    }

    async fn get_job_result(
        &self,
        sequence_id: &str,
        index: usize,
    ) -> StoreResult<Option<JobResult>> {
        let id = sequence_id.to_string();
        self.db.call(move |db| db.get_job_result(&id, index)).await
    }

    async fn set_job_error(&self, sequence_id: &str, index: usize, detail: &str) -> StoreResult<()> {
        let id = sequence_id.to_string();
        let detail = detail.to_string();
        let ttl = self.ttl;
        self.db
            .call(move |db| db.set_job_error(&id, index, &detail, ttl))
            .await?;
        self.publish(sequence_id, Some(index), ChangeKind::JobResult);
        Ok(())
    }

    async fn get_job_error(&self, sequence_id: &str, index: usize) -> StoreResult<Option<String>> {
        let id = sequence_id.to_string();
        self.db.call(move |db| db.get_job_error(&id, index)).await
    }

    async fn mark_sent(&self, sequence_id: &str, index: usize) -> StoreResult<bool> {
        let id = sequence_id.to_string();
        let ttl = self.ttl;
        let flipped = self.db.call(move |db| db.mark_sent(&id, index, ttl)).await?;
        if flipped {
            self.publish(sequence_id, Some(index), ChangeKind::JobStatus);
        }
        Ok(flipped)
    }

    async fn set_confirmed(&self, sequence_id: &str, index: usize) -> StoreResult<()> {
        let id = sequence_id.to_string();
        let ttl = self.ttl;
        self.db
            .call(move |db| db.set_confirmed(&id, index, ttl))
            .await?;
        self.publish(sequence_id, Some(index), ChangeKind::Confirmed);
        Ok(())
    }

    async fn is_confirmed(&self, sequence_id: &str, index: usize) -> StoreResult<bool> {
        let id = sequence_id.to_string();
        self.db.call(move |db| db.is_confirmed(&id, index)).await
    }

    async fn cleanup_sequence(&self, sequence_id: &str) -> StoreResult<bool> {
        let id = sequence_id.to_string();
        let existed = self.db.call(move |db| db.cleanup_sequence(&id)).await?;
        self.publish(sequence_id, None, ChangeKind::Removed);
        Ok(existed)
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        self.db.call(|db| db.purge_expired()).await
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<StoreChange>> {
        Some(self.changes.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(86_400);

    fn topics(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn sample_result(id: &str, index: usize) -> JobResult {
        JobResult {
            sequence_id: id.to_string(),
            index,
            topic: "A".into(),
            content: "Alex: hello\nMaya: hi".into(),
            forced_param: Some("Notion".into()),
            context_snippet: None,
            artifacts: vec![],
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn test_create_database_and_run_migrations() -> StoreResult<()> {
        let db = SequenceDb::new_in_memory()?;
        // Running migrations twice is safe.
        db.run_migrations()?;
        Ok(())
    }

    #[test]
    fn test_create_sequence_initialises_every_job_pending() -> StoreResult<()> {
        let db = SequenceDb::new_in_memory()?;
        let id = db.create_sequence(&topics(&["A", "B", "C"]), &[], DAY)?;
        assert!(id.starts_with("seq-"));

        let info = db.get_sequence_info(&id)?.expect("sequence exists");
        assert_eq!(info.topics, topics(&["A", "B", "C"]));
        assert!(info.forced_params.is_empty());
        assert_eq!(info.status, SequenceStatus::Pending);

        let statuses = db.get_all_statuses(&id)?;
        assert_eq!(statuses.len(), 3);
        assert!(statuses.values().all(|s| *s == JobStatus::Pending));
        Ok(())
    }

    #[test]
    fn test_unknown_sequence_reads_absent() -> StoreResult<()> {
        let db = SequenceDb::new_in_memory()?;
        assert!(db.get_sequence_info("seq-000000000000")?.is_none());
        assert!(db.get_job_status("seq-000000000000", 0)?.is_none());
        assert!(!db.is_confirmed("seq-000000000000", 0)?);
        Ok(())
    }

    #[test]
    fn test_status_transitions_are_enforced() -> StoreResult<()> {
        let db = SequenceDb::new_in_memory()?;
        let id = db.create_sequence(&topics(&["A"]), &[], DAY)?;

        db.set_job_status(&id, 0, JobStatus::Generating, DAY)?;
        db.set_job_status(&id, 0, JobStatus::Ready, DAY)?;
        let err = db
            .set_job_status(&id, 0, JobStatus::Generating, DAY)
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: JobStatus::Ready,
                to: JobStatus::Generating,
                ..
            }
        ));
        assert_eq!(db.get_job_status(&id, 0)?, Some(JobStatus::Ready));
        Ok(())
    }

    #[test]
    fn test_result_is_write_once() -> StoreResult<()> {
        let db = SequenceDb::new_in_memory()?;
        let id = db.create_sequence(&topics(&["A"]), &[], DAY)?;
        let first = sample_result(&id, 0);
        db.set_job_result(&id, 0, &first, DAY)?;

        let mut second = sample_result(&id, 0);
        second.content = "different".into();
        let err = db.set_job_result(&id, 0, &second, DAY).unwrap_err();
        assert!(matches!(err, StoreError::ResultAlreadyWritten { index: 0, .. }));

        assert_eq!(db.get_job_result(&id, 0)?, Some(first));
        Ok(())
    }

    #[test]
    fn test_mark_sent_flips_only_ready_jobs_once() -> StoreResult<()> {
        let db = SequenceDb::new_in_memory()?;
        let id = db.create_sequence(&topics(&["A"]), &[], DAY)?;

        assert!(!db.mark_sent(&id, 0, DAY)?);
        db.set_job_status(&id, 0, JobStatus::Generating, DAY)?;
        db.set_job_status(&id, 0, JobStatus::Ready, DAY)?;

        assert!(db.mark_sent(&id, 0, DAY)?);
        assert!(!db.mark_sent(&id, 0, DAY)?);
        assert_eq!(db.get_job_status(&id, 0)?, Some(JobStatus::Sent));
        Ok(())
    }

    #[test]
    fn test_confirmation_is_idempotent() -> StoreResult<()> {
        let db = SequenceDb::new_in_memory()?;
        let id = db.create_sequence(&topics(&["A", "B"]), &[], DAY)?;
        assert!(!db.is_confirmed(&id, 1)?);
        db.set_confirmed(&id, 1, DAY)?;
        db.set_confirmed(&id, 1, DAY)?;
        assert!(db.is_confirmed(&id, 1)?);
        assert!(!db.is_confirmed(&id, 0)?);
        Ok(())
    }

    #[test]
    fn test_error_detail_round_trip() -> StoreResult<()> {
        let db = SequenceDb::new_in_memory()?;
        let id = db.create_sequence(&topics(&["A"]), &[], DAY)?;
        db.set_job_error(&id, 0, "model overloaded", DAY)?;
        db.set_job_status(&id, 0, JobStatus::Error, DAY)?;
        assert_eq!(db.get_job_error(&id, 0)?.as_deref(), Some("model overloaded"));
        assert!(db.get_job_result(&id, 0)?.is_none());
        Ok(())
    }

    #[test]
    fn test_zero_ttl_expires_immediately_and_purges() -> StoreResult<()> {
        let db = SequenceDb::new_in_memory()?;
        let id = db.create_sequence(&topics(&["A", "B"]), &[], Duration::ZERO)?;
        assert!(db.get_sequence_info(&id)?.is_none());
        assert!(db.get_all_statuses(&id)?.is_empty());
        assert_eq!(db.purge_expired()?, 1);
        Ok(())
    }

    #[test]
    fn test_writes_do_not_revive_expired_sequence() -> StoreResult<()> {
        let db = SequenceDb::new_in_memory()?;
        let id = db.create_sequence(&topics(&["A", "B"]), &[], Duration::ZERO)?;

        let result = db.set_job_result(&id, 0, &sample_result(&id, 0), DAY);
        assert!(matches!(result, Err(StoreError::JobNotFound { index: 0, .. })));
        let error = db.set_job_error(&id, 0, "late failure", DAY);
        assert!(matches!(error, Err(StoreError::JobNotFound { index: 0, .. })));
        let confirmed = db.set_confirmed(&id, 1, DAY);
        assert!(matches!(confirmed, Err(StoreError::JobNotFound { index: 1, .. })));
        let status = db.set_job_status(&id, 0, JobStatus::Generating, DAY);
        assert!(matches!(status, Err(StoreError::JobNotFound { index: 0, .. })));
        db.set_sequence_status(&id, SequenceStatus::Active, DAY)?;

        assert!(db.get_sequence_info(&id)?.is_none());
        assert!(db.get_all_statuses(&id)?.is_empty());
        assert_eq!(db.purge_expired()?, 1);
        Ok(())
    }

    #[test]
    fn test_cleanup_removes_jobs() -> StoreResult<()> {
        let db = SequenceDb::new_in_memory()?;
        let id = db.create_sequence(&topics(&["A", "B"]), &["Calm".into()], DAY)?;
        assert!(db.cleanup_sequence(&id)?);
        assert!(db.get_sequence_info(&id)?.is_none());
        assert!(db.get_all_statuses(&id)?.is_empty());
        assert!(!db.cleanup_sequence(&id)?);
        Ok(())
    }

    #[test]
    fn test_file_backed_database_persists() -> StoreResult<()> {
        let dir = tempfile::tempdir().map_err(unavailable)?;
        let path = dir.path().join("sequencer.db");
        let id = {
            let db = SequenceDb::new(&path)?;
            db.create_sequence(&topics(&["A"]), &[], DAY)?
        };
        let reopened = SequenceDb::new(&path)?;
        assert!(reopened.get_sequence_info(&id)?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_store_publishes_changes() {
        let store = SqliteStore::in_memory(DAY).unwrap();
        let mut rx = store.subscribe().expect("embedded store has a feed");
        let id = store.create_sequence(&topics(&["A"]), &[]).await.unwrap();
        store.set_confirmed(&id, 0).await.unwrap();

        let created = rx.recv().await.unwrap();
        assert_eq!(created.kind, ChangeKind::Created);
        let confirmed = rx.recv().await.unwrap();
        assert_eq!(confirmed, StoreChange::new(&id, Some(0), ChangeKind::Confirmed));
    }

    #[tokio::test]
    async fn test_store_reports_missing_job_on_write() {
        let store = SqliteStore::in_memory(DAY).unwrap();
        let id = store.create_sequence(&topics(&["A"]), &[]).await.unwrap();
        let err = store.set_confirmed(&id, 5).await.unwrap_err();
        assert!(matches!(err, StoreError::JobNotFound { index: 5, .. }));
    }
}
