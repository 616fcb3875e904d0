//! Executes a single job of a sequence.
//!
//! The runner is the only writer of a job's status, result and error. It
//! writes exactly one result-or-error and then exactly one terminal status.
//! Store write failures are logged and do not stop the job.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::collaborators::{ArtifactProcessor, Generator, GenerationRequest, ProcessRequest};
use super::gate::ConfirmationGate;
use super::models::{JobResult, JobStatus};
use super::store::StateStore;
use super::wait::{Timing, WaitOutcome, wait_until};
use crate::errors::SequenceError;

/// Everything a runner needs to execute one job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub sequence_id: String,
    pub index: usize,
    pub topic: String,
    pub forced_params: Vec<String>,
    /// Content of job `index - 1`, when available.
    pub continuation: Option<String>,
    /// Block on confirmation of `index - 1` before starting. Only honoured
    /// for `index > 1`.
    pub wait_for_confirmation: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Ready(JobResult),
    Failed(String),
    /// Shut down before the job started; nothing was written.
    Abandoned,
}

/// Forced parameter for a job: the entry at its index, else the first entry,
/// else none.
pub fn resolve_forced_param(forced_params: &[String], index: usize) -> Option<String> {
    forced_params
        .get(index)
        .or_else(|| forced_params.first())
        .filter(|p| !p.is_empty())
        .cloned()
}

pub struct JobRunner {
    store: Arc<dyn StateStore>,
    gate: ConfirmationGate,
    generator: Arc<dyn Generator>,
    processors: Vec<Arc<dyn ArtifactProcessor>>,
    limiter: Arc<Semaphore>,
    max_concurrent_jobs: usize,
    timing: Timing,
    cancel: CancellationToken,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn StateStore>,
        generator: Arc<dyn Generator>,
        processors: Vec<Arc<dyn ArtifactProcessor>>,
        max_concurrent_jobs: usize,
        timing: Timing,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            gate: ConfirmationGate::new(store.clone()),
            store,
            generator,
            processors,
            limiter: Arc::new(Semaphore::new(max_concurrent_jobs)),
            max_concurrent_jobs,
            timing,
            cancel,
        }
    }

    /// Number of jobs currently holding a generation slot.
    pub fn active_jobs(&self) -> usize {
        self.max_concurrent_jobs
            .saturating_sub(self.limiter.available_permits())
    }

    pub async fn run(&self, spec: JobSpec) -> JobOutcome {
        let sequence_id = spec.sequence_id.as_str();
        let index = spec.index;

        if spec.wait_for_confirmation && index > 1 && !self.await_confirmation(&spec).await {
            return JobOutcome::Abandoned;
        }

        let _permit = tokio::select! {
            _ = self.cancel.cancelled() => return JobOutcome::Abandoned,
            permit = self.limiter.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return JobOutcome::Abandoned,
            },
        };

        self.write_status(sequence_id, index, JobStatus::Generating)
            .await;
        let forced_param = resolve_forced_param(&spec.forced_params, index);
        info!(
            sequence_id,
            index,
            topic = %spec.topic,
            forced_param = forced_param.as_deref().unwrap_or("-"),
            continued = spec.continuation.is_some(),
            "generating job"
        );

        let request = GenerationRequest {
            sequence_id: spec.sequence_id.clone(),
            index,
            topic: spec.topic.clone(),
            prior_content: spec.continuation.clone(),
            forced_param: forced_param.clone(),
        };
        let generation = match self.generator.generate(request).await {
            Ok(generation) => generation,
            Err(e) => {
                let err = SequenceError::GenerationFailed {
                    index,
                    message: format!("{:#}", e),
                };
                warn!(sequence_id, index, error = %err, "job failed");
                let detail = err.to_string();
                if let Err(e) = self.store.set_job_error(sequence_id, index, &detail).await {
                    warn!(sequence_id, index, error = %e, "failed to record job error");
                }
                self.write_status(sequence_id, index, JobStatus::Error).await;
                return JobOutcome::Failed(detail);
            }
        };

        let mut artifacts = Vec::new();
        for processor in &self.processors {
            let request = ProcessRequest {
                sequence_id: spec.sequence_id.clone(),
                index,
                topic: spec.topic.clone(),
                content: generation.content.clone(),
            };
            match processor.process(request).await {
                Ok(produced) => artifacts.extend(produced),
                Err(e) => {
                    let err = SequenceError::DownstreamFailed {
                        collaborator: processor.name().to_string(),
                        message: format!("{:#}", e),
                    };
                    warn!(sequence_id, index, error = %err, "continuing without artifacts");
                }
            }
        }

        let result = JobResult {
            sequence_id: spec.sequence_id.clone(),
            index,
            topic: spec.topic.clone(),
            content: generation.content,
            forced_param: generation.forced_param_used.or(forced_param),
            context_snippet: generation.context_snippet,
            artifacts,
            generated_at: Utc::now(),
        };
        if let Err(e) = self.store.set_job_result(sequence_id, index, &result).await {
            warn!(sequence_id, index, error = %e, "failed to record job result");
        }
        tokio::time::sleep(self.timing.settle_delay).await;
        self.write_status(sequence_id, index, JobStatus::Ready).await;
        info!(sequence_id, index, "job ready");
        JobOutcome::Ready(result)
    }

    /// Wait for `index - 1` to be confirmed. Returns false on shutdown.
    async fn await_confirmation(&self, spec: &JobSpec) -> bool {
        let previous = spec.index - 1;
        let gate = &self.gate;
        let sequence_id = spec.sequence_id.as_str();
        let outcome = wait_until(
            self.store.as_ref(),
            self.timing.poll_interval,
            self.timing.wait_ceiling,
            &self.cancel,
            || async move {
                match gate.is_confirmed(sequence_id, previous).await {
                    Ok(true) => Some(()),
                    Ok(false) => None,
                    Err(e) => {
                        debug!(sequence_id, error = %e, "confirmation read failed");
                        None
                    }
                }
            },
        )
        .await;
        match outcome {
            WaitOutcome::Satisfied(()) => true,
            WaitOutcome::TimedOut => {
                let err = SequenceError::ConfirmationTimeout {
                    sequence_id: spec.sequence_id.clone(),
                    index: previous,
                    waited: self.timing.wait_ceiling,
                };
                warn!(error = %err, "starting job {} without confirmation", spec.index);
                true
            }
            WaitOutcome::Cancelled => false,
        }
    }

    async fn write_status(&self, sequence_id: &str, index: usize, status: JobStatus) {
        if let Err(e) = self.store.set_job_status(sequence_id, index, status).await {
            warn!(sequence_id, index, status = %status, error = %e, "failed to record job status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::memory::MemoryStore;
    use crate::sequence::testing::{ScriptedGenerator, ScriptedProcessor, scripted_content};
    use std::time::Duration;

    const DAY: Duration = Duration::from_secs(86_400);

    fn fast_timing() -> Timing {
        Timing {
            poll_interval: Duration::from_millis(10),
            wait_ceiling: Duration::from_millis(200),
            settle_delay: Duration::from_millis(5),
            read_retry_delay: Duration::from_millis(5),
        }
    }

    fn runner(
        store: Arc<MemoryStore>,
        generator: Arc<ScriptedGenerator>,
        processors: Vec<Arc<dyn ArtifactProcessor>>,
    ) -> JobRunner {
        JobRunner::new(
            store,
            generator,
            processors,
            4,
            fast_timing(),
            CancellationToken::new(),
        )
    }

    fn spec(id: &str, index: usize, topic: &str) -> JobSpec {
        JobSpec {
            sequence_id: id.to_string(),
            index,
            topic: topic.to_string(),
            forced_params: vec![],
            continuation: None,
            wait_for_confirmation: false,
        }
    }

    async fn new_sequence(store: &MemoryStore, n: usize) -> String {
        let topics: Vec<String> = (0..n).map(|i| format!("topic {}", i)).collect();
        store.create_sequence(&topics, &[]).await.unwrap()
    }

    #[test]
    fn test_resolve_forced_param_prefers_index_then_first() {
        let params = vec!["X".to_string(), "Y".to_string()];
        assert_eq!(resolve_forced_param(&params, 0).as_deref(), Some("X"));
        assert_eq!(resolve_forced_param(&params, 1).as_deref(), Some("Y"));
        assert_eq!(resolve_forced_param(&params, 5).as_deref(), Some("X"));
        assert_eq!(resolve_forced_param(&[], 0), None);
    }

    #[test]
    fn test_resolve_forced_param_single_entry_applies_everywhere() {
        let params = vec!["X".to_string()];
        for index in 0..3 {
            assert_eq!(resolve_forced_param(&params, index).as_deref(), Some("X"));
        }
    }

    #[tokio::test]
    async fn test_successful_job_writes_result_then_ready() {
        let store = Arc::new(MemoryStore::new(DAY));
        let generator = Arc::new(ScriptedGenerator::new());
        let id = new_sequence(&store, 2).await;
        let runner = runner(store.clone(), generator.clone(), vec![]);

        let mut job = spec(&id, 1, "topic 1");
        job.forced_params = vec!["Notion".into()];
        job.continuation = Some("earlier episode".into());
        let outcome = runner.run(job).await;

        let JobOutcome::Ready(result) = outcome else {
            panic!("expected ready outcome");
        };
        assert_eq!(result.content, scripted_content(1, "topic 1"));
        assert_eq!(result.forced_param.as_deref(), Some("Notion"));
        assert_eq!(store.get_job_status(&id, 1).await.unwrap(), Some(JobStatus::Ready));
        assert_eq!(store.get_job_result(&id, 1).await.unwrap(), Some(result));

        let call = generator.call_for(1).unwrap();
        assert_eq!(call.prior_content.as_deref(), Some("earlier episode"));
    }

    #[tokio::test]
    async fn test_generation_failure_records_error() {
        let store = Arc::new(MemoryStore::new(DAY));
        let generator = Arc::new(ScriptedGenerator::new().failing_at(0));
        let id = new_sequence(&store, 1).await;
        let runner = runner(store.clone(), generator.clone(), vec![]);

        let outcome = runner.run(spec(&id, 0, "topic 0")).await;
        assert!(matches!(outcome, JobOutcome::Failed(_)));
        assert_eq!(store.get_job_status(&id, 0).await.unwrap(), Some(JobStatus::Error));
        let detail = store.get_job_error(&id, 0).await.unwrap().unwrap();
        assert!(detail.contains("scripted failure"));
        assert!(store.get_job_result(&id, 0).await.unwrap().is_none());
        assert_eq!(generator.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_downstream_failure_keeps_job_ready() {
        let store = Arc::new(MemoryStore::new(DAY));
        let generator = Arc::new(ScriptedGenerator::new());
        let id = new_sequence(&store, 1).await;
        let processors: Vec<Arc<dyn ArtifactProcessor>> = vec![
            Arc::new(ScriptedProcessor::failing("audio")),
            Arc::new(ScriptedProcessor::ok("publish")),
        ];
        let runner = runner(store.clone(), generator, processors);

        let JobOutcome::Ready(result) = runner.run(spec(&id, 0, "topic 0")).await else {
            panic!("expected ready outcome");
        };
        assert_eq!(result.artifacts.len(), 1);
        assert_eq!(result.artifacts[0].collaborator, "publish");
    }

    #[tokio::test]
    async fn test_waits_for_previous_confirmation() {
        let store = Arc::new(MemoryStore::new(DAY));
        let generator = Arc::new(ScriptedGenerator::new());
        let id = new_sequence(&store, 3).await;
        let runner = Arc::new(JobRunner::new(
            store.clone(),
            generator.clone(),
            vec![],
            4,
            Timing {
                wait_ceiling: Duration::from_secs(30),
                ..fast_timing()
            },
            CancellationToken::new(),
        ));

        let mut job = spec(&id, 2, "topic 2");
        job.wait_for_confirmation = true;
        let task = tokio::spawn({
            let runner = runner.clone();
            async move { runner.run(job).await }
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.get_job_status(&id, 2).await.unwrap(), Some(JobStatus::Pending));
        assert!(generator.calls().is_empty());

        store.set_confirmed(&id, 1).await.unwrap();
        let outcome = task.await.unwrap();
        assert!(matches!(outcome, JobOutcome::Ready(_)));
    }

    #[tokio::test]
    async fn test_confirmation_ceiling_proceeds() {
        let store = Arc::new(MemoryStore::new(DAY));
        let generator = Arc::new(ScriptedGenerator::new());
        let id = new_sequence(&store, 3).await;
        let runner = runner(store.clone(), generator.clone(), vec![]);

        let mut job = spec(&id, 2, "topic 2");
        job.wait_for_confirmation = true;
        let outcome = runner.run(job).await;
        assert!(matches!(outcome, JobOutcome::Ready(_)));
        assert!(!store.is_confirmed(&id, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_store_outage_does_not_stop_the_job() {
        let store = Arc::new(MemoryStore::new(DAY));
        let generator = Arc::new(ScriptedGenerator::new());
        let id = new_sequence(&store, 1).await;
        let runner = runner(store.clone(), generator.clone(), vec![]);

        store.set_available(false);
        let outcome = runner.run(spec(&id, 0, "topic 0")).await;
        assert!(matches!(outcome, JobOutcome::Ready(_)));
        assert_eq!(generator.calls().len(), 1);
        store.set_available(true);
        assert_eq!(store.get_job_status(&id, 0).await.unwrap(), Some(JobStatus::Pending));
    }

    #[tokio::test]
    async fn test_cancelled_runner_abandons_before_start() {
        let store = Arc::new(MemoryStore::new(DAY));
        let generator = Arc::new(ScriptedGenerator::new());
        let id = new_sequence(&store, 3).await;
        let cancel = CancellationToken::new();
        let runner = JobRunner::new(
            store.clone(),
            generator.clone(),
            vec![],
            1,
            fast_timing(),
            cancel.clone(),
        );
        cancel.cancel();

        let mut job = spec(&id, 2, "topic 2");
        job.wait_for_confirmation = true;
        assert_eq!(runner.run(job).await, JobOutcome::Abandoned);
        assert!(generator.calls().is_empty());
    }
}
