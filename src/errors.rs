//! Typed error hierarchy for the sequencer.
//!
//! Two enums cover the two layers:
//! - `StoreError`: failures reported by a `StateStore` implementation
//! - `SequenceError`: failures surfaced by the coordinator, gate and stream

use std::time::Duration;

use thiserror::Error;

use crate::sequence::models::JobStatus;

/// Errors reported by a state store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),

    #[error("job {index} of {sequence_id}: illegal status transition {from} -> {to}")]
    InvalidTransition {
        sequence_id: String,
        index: usize,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job {index} of {sequence_id} already has a result")]
    ResultAlreadyWritten { sequence_id: String, index: usize },

    #[error("job {index} not found in sequence {sequence_id}")]
    JobNotFound { sequence_id: String, index: usize },

    #[error("could not allocate a unique sequence id after {attempts} attempts")]
    IdExhausted { attempts: usize },
}

impl StoreError {
    /// True for infrastructure failures, as opposed to rejected writes.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Errors from the sequence coordinator and its collaborators.
#[derive(Debug, Error)]
pub enum SequenceError {
    #[error(transparent)]
    StoreUnavailable(StoreError),

    #[error("generation failed for job {index}: {message}")]
    GenerationFailed { index: usize, message: String },

    #[error("downstream collaborator '{collaborator}' failed: {message}")]
    DownstreamFailed {
        collaborator: String,
        message: String,
    },

    #[error("confirmation of job {index} in {sequence_id} not seen after {waited:?}")]
    ConfirmationTimeout {
        sequence_id: String,
        index: usize,
        waited: Duration,
    },

    #[error("Sequence {id} not found")]
    SequenceNotFound { id: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("sequencer is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for SequenceError {
    fn from(err: StoreError) -> Self {
        if err.is_unavailable() {
            SequenceError::StoreUnavailable(err)
        } else {
            SequenceError::Store(err)
        }
    }
}
