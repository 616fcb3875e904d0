use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix shared by every sequence identifier.
pub const SEQUENCE_ID_PREFIX: &str = "seq-";

/// Generate a fresh sequence identifier: `seq-` followed by 12 hex chars.
pub fn new_sequence_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}", SEQUENCE_ID_PREFIX, &hex[..12])
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SequenceStatus {
    Pending,
    Active,
    Complete,
}

impl SequenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Complete => "complete",
        }
    }
}

impl FromStr for SequenceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "complete" => Ok(Self::Complete),
            _ => Err(format!("Invalid sequence status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Generating,
    Ready,
    Sent,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Generating => "generating",
            Self::Ready => "ready",
            Self::Sent => "sent",
            Self::Error => "error",
        }
    }

    /// Terminal for the purpose of sequence completion.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Sent | Self::Error)
    }

    /// Whether a result payload is expected for this status.
    pub fn has_result(&self) -> bool {
        matches!(self, Self::Ready | Self::Sent)
    }

    /// Legal edges of the job lifecycle. Re-writing the current status is
    /// accepted so that retried writes stay idempotent.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        *self == next
            || matches!(
                (self, next),
                (Pending, Generating)
                    | (Pending, Error)
                    | (Generating, Ready)
                    | (Generating, Error)
                    | (Ready, Sent)
            )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "generating" => Ok(Self::Generating),
            "ready" => Ok(Self::Ready),
            "sent" => Ok(Self::Sent),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sequence {
    pub id: String,
    pub topics: Vec<String>,
    pub forced_params: Vec<String>,
    pub status: SequenceStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Sequence {
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

/// Reference to an artifact produced by a downstream collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactRef {
    pub collaborator: String,
    pub uri: String,
}

/// Payload written once a job has generated successfully.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobResult {
    pub sequence_id: String,
    pub index: usize,
    pub topic: String,
    pub content: String,
    pub forced_param: Option<String>,
    pub context_snippet: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
    pub generated_at: DateTime<Utc>,
}

// API view types

/// Per-index entry of a status view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobView {
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JobResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Snapshot returned by the pull endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequenceStatusView {
    pub sequence_id: String,
    pub sequence_status: SequenceStatus,
    pub total: usize,
    pub status: BTreeMap<usize, JobStatus>,
    pub results: BTreeMap<usize, JobView>,
    pub complete: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_id_format() {
        let id = new_sequence_id();
        assert!(id.starts_with("seq-"));
        assert_eq!(id.len(), 16);
        assert!(id[4..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_sequence_id());
    }

    #[test]
    fn test_job_status_round_trips_through_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::Generating,
            JobStatus::Ready,
            JobStatus::Sent,
            JobStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("done".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_job_status_transitions_are_monotonic() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Generating));
        assert!(Generating.can_transition_to(Ready));
        assert!(Generating.can_transition_to(Error));
        assert!(Ready.can_transition_to(Sent));
        assert!(Ready.can_transition_to(Ready));

        assert!(!Ready.can_transition_to(Generating));
        assert!(!Sent.can_transition_to(Ready));
        assert!(!Error.can_transition_to(Generating));
        assert!(!Pending.can_transition_to(Ready));
        assert!(!Generating.can_transition_to(Sent));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Ready.is_terminal());
        assert!(JobStatus::Sent.is_terminal());
        assert!(JobStatus::Error.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Generating.is_terminal());
    }

    #[test]
    fn test_sequence_status_serializes_snake_case() {
        let json = serde_json::to_string(&SequenceStatus::Active).unwrap();
        assert_eq!(json, "\"active\"");
        assert_eq!("complete".parse::<SequenceStatus>().unwrap(), SequenceStatus::Complete);
    }

    #[test]
    fn test_status_view_keys_serialize_as_strings() {
        let mut status = BTreeMap::new();
        status.insert(0, JobStatus::Ready);
        status.insert(1, JobStatus::Error);
        let mut results = BTreeMap::new();
        results.insert(
            1,
            JobView {
                status: JobStatus::Error,
                data: None,
                error: Some("boom".into()),
            },
        );
        let view = SequenceStatusView {
            sequence_id: "seq-1".into(),
            sequence_status: SequenceStatus::Active,
            total: 2,
            status,
            results,
            complete: true,
        };
        let json: serde_json::Value = serde_json::to_value(&view).unwrap();
        assert_eq!(json["status"]["0"], "ready");
        assert_eq!(json["results"]["1"]["error"], "boom");
        assert!(json["results"]["1"].get("data").is_none());
    }
}
