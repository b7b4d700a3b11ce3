//! Error types for the job scheduler.

use crate::ids::{BatchId, ContentHash, JobId, StepId};
use crate::job::{JobStepBatchState, JobStepState};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Job errors
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Batch not found: {0}")]
    BatchNotFound(BatchId),

    #[error("Step not found: {batch_id}:{step_id}")]
    StepNotFound { batch_id: BatchId, step_id: StepId },

    #[error("Job has been cancelled")]
    JobCancelled,

    // Graph errors
    #[error("Graph not found: {0}")]
    GraphNotFound(ContentHash),

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Job references graph {expected}, not {actual}")]
    GraphMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("Node '{0}' is missing from the updated graph")]
    NodeRemoved(String),

    #[error("Nodes of group {0} are split across groups in the updated graph")]
    GroupSplit(usize),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Label not found: {0}")]
    LabelNotFound(String),

    // Transition errors
    #[error("Batch {batch_id} cannot move from {from:?} to {to:?}")]
    InvalidBatchTransition {
        batch_id: BatchId,
        from: JobStepBatchState,
        to: JobStepBatchState,
    },

    #[error("Step {step_id} cannot move from {from:?} to {to:?}")]
    InvalidStepTransition {
        step_id: StepId,
        from: JobStepState,
        to: JobStepState,
    },

    #[error("Step {0} completed without an outcome")]
    MissingOutcome(StepId),

    #[error("Step {0} cannot be retried")]
    RetryNotAllowed(StepId),

    #[error("Step {0} has already been superseded by a later attempt")]
    StepSuperseded(StepId),

    // Concurrency
    #[error("Gave up updating job {job_id} after {attempts} conflicting attempts")]
    UpdateConflict { job_id: JobId, attempts: u32 },

    // Providers
    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Unable to resolve change: {0}")]
    ChangeResolution(String),

    // Infrastructure errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true for errors that reject a state change without indicating a fault.
    ///
    /// Collections report these to callers as "not applied" rather than as failures.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::InvalidBatchTransition { .. }
                | Error::InvalidStepTransition { .. }
                | Error::RetryNotAllowed(_)
                | Error::StepSuperseded(_)
                | Error::JobCancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
