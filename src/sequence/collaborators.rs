//! Client side of the external collaborators a job runner calls.
//!
//! The generator is mandatory and its failure fails the job. Artifact
//! processors (audio synthesis, publishing) run after a successful
//! generation; their failures are logged and never fail the job.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::models::ArtifactRef;

/// Input to one generation call.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GenerationRequest {
    pub sequence_id: String,
    pub index: usize,
    pub topic: String,
    /// Content of the previous job, when continuing from it.
    pub prior_content: Option<String>,
    pub forced_param: Option<String>,
}

/// What the generator produced.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Generation {
    #[serde(alias = "conversation")]
    pub content: String,
    #[serde(default, alias = "sponsor")]
    pub forced_param_used: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default, alias = "context_used")]
    pub context_snippet: Option<String>,
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> anyhow::Result<Generation>;
}

/// Input to a downstream artifact processor.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProcessRequest {
    pub sequence_id: String,
    pub index: usize,
    pub topic: String,
    pub content: String,
}

#[async_trait]
pub trait ArtifactProcessor: Send + Sync {
    /// Short name used in logs and on the produced [`ArtifactRef`]s.
    fn name(&self) -> &str;

    async fn process(&self, request: ProcessRequest) -> anyhow::Result<Vec<ArtifactRef>>;
}

fn build_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("sequencer/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")
}

/// Generator reached over HTTP: POSTs the request as JSON and expects a
/// [`Generation`] back.
pub struct HttpGenerator {
    client: reqwest::Client,
    url: String,
}

impl HttpGenerator {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, request: GenerationRequest) -> anyhow::Result<Generation> {
        self.client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Failed to reach generator at {}", self.url))?
            .error_for_status()
            .context("Generator returned error status")?
            .json::<Generation>()
            .await
            .context("Failed to parse generator response")
    }
}

#[derive(Debug, Deserialize)]
struct ProcessResponse {
    #[serde(default)]
    artifacts: Vec<String>,
}

/// Artifact processor reached over HTTP. The service answers with
/// `{"artifacts": ["<uri>", ...]}`.
pub struct HttpProcessor {
    name: String,
    client: reqwest::Client,
    url: String,
}

impl HttpProcessor {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            name: name.into(),
            client: build_client(timeout)?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ArtifactProcessor for HttpProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, request: ProcessRequest) -> anyhow::Result<Vec<ArtifactRef>> {
        let resp = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Failed to reach {} at {}", self.name, self.url))?
            .error_for_status()
            .with_context(|| format!("{} returned error status", self.name))?
            .json::<ProcessResponse>()
            .await
            .with_context(|| format!("Failed to parse {} response", self.name))?;
        Ok(resp
            .artifacts
            .into_iter()
            .map(|uri| ArtifactRef {
                collaborator: self.name.clone(),
                uri,
            })
            .collect())
    }
}
