//! Scripted collaborator doubles shared by the sequence tests.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;

use super::collaborators::*;
use super::models::{ArtifactRef, JobStatus, SequenceStatus};
use super::store::StateStore;

/// Generator that answers from a script: optional per-call delay and a set of
/// indices that always fail. Every request is recorded.
#[derive(Default)]
pub struct ScriptedGenerator {
    delay: Duration,
    fail_at: HashSet<usize>,
    calls: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_at(mut self, index: usize) -> Self {
        self.fail_at.insert(index);
        self
    }

    pub fn calls(&self) -> Vec<GenerationRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_for(&self, index: usize) -> Option<GenerationRequest> {
        self.calls().into_iter().find(|c| c.index == index)
    }
}

/// Content the scripted generator produces for a job.
pub fn scripted_content(index: usize, topic: &str) -> String {
    format!("episode {} about {}", index, topic)
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, request: GenerationRequest) -> anyhow::Result<Generation> {
        self.calls.lock().unwrap().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_at.contains(&request.index) {
            bail!("scripted failure at index {}", request.index);
        }
        Ok(Generation {
            content: scripted_content(request.index, &request.topic),
            forced_param_used: request.forced_param.clone(),
            topic: Some(request.topic.clone()),
            context_snippet: request.prior_content.as_ref().map(|c| c.chars().take(20).collect()),
        })
    }
}

/// Processor that returns one artifact per call, or always fails.
pub struct ScriptedProcessor {
    name: String,
    fail: bool,
}

impl ScriptedProcessor {
    pub fn ok(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fail: false,
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fail: true,
        }
    }
}

#[async_trait]
impl ArtifactProcessor for ScriptedProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, request: ProcessRequest) -> anyhow::Result<Vec<ArtifactRef>> {
        if self.fail {
            bail!("{} unavailable", self.name);
        }
        Ok(vec![ArtifactRef {
            collaborator: self.name.clone(),
            uri: format!("mem://{}/{}/{}", self.name, request.sequence_id, request.index),
        }])
    }
}

/// Poll until job `index` satisfies `want`, panicking after five seconds.
pub async fn wait_for_job(
    store: &dyn StateStore,
    sequence_id: &str,
    index: usize,
    want: impl Fn(JobStatus) -> bool,
) -> JobStatus {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(Some(status)) = store.get_job_status(sequence_id, index).await
            && want(status)
        {
            return status;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} of {} never reached the wanted status",
            index,
            sequence_id
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll until the sequence reports `complete`, panicking after five seconds.
pub async fn wait_for_complete(store: &dyn StateStore, sequence_id: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(Some(info)) = store.get_sequence_info(sequence_id).await
            && info.status == SequenceStatus::Complete
        {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "sequence {} never completed",
            sequence_id
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
