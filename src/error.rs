//! Error types for trainforge operations.
//!
//! Defines error types for each subsystem:
//! - Container runtime adapter
//! - Project storage
//! - Stage executors (train, export, test)
//! - The orchestration service itself

use thiserror::Error;

use crate::orchestrator::readiness::ReadinessState;
use crate::orchestrator::status::TrainingStatus;

/// Errors that can occur while talking to the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Container runtime not available: {0}")]
    DaemonUnavailable(String),

    #[error("Failed to pull image '{image}': {reason}")]
    PullFailed { image: String, reason: String },

    #[error("Container run failed: {0}")]
    RunFailed(String),

    #[error("Container '{id}' not found")]
    ContainerNotFound { id: String },

    #[error("Container control failed for '{id}': {reason}")]
    ControlFailed { id: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur in the project store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Project '{0}' not found")]
    ProjectNotFound(String),

    #[error("Failed to create store directory: {0}")]
    DirectoryCreationFailed(String),

    #[error("Invalid project data: {0}")]
    InvalidData(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by stage executors.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Project '{0}' has no dataset archive configured")]
    MissingDataset(String),

    #[error("Failed to extract dataset archive: {0}")]
    Archive(String),

    #[error("{role} container exited with code {code}")]
    ContainerExited { role: String, code: i64 },

    #[error("Expected output not produced: {0}")]
    MissingOutput(String),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced by the orchestration service to its callers.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Container runtime is unreachable; the service cannot run pipelines")]
    RuntimeUnavailable,

    #[error("Service is not ready (readiness: {0})")]
    NotReady(ReadinessState),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("No trainjob found for project '{0}'")]
    NoTrainJob(String),

    #[error("Training for project '{0}' is already paused")]
    AlreadyPaused(String),

    #[error("Training for project '{0}' is not paused")]
    NotPaused(String),

    #[error("A training run is already active for project '{0}'")]
    AlreadyRunning(String),

    #[error("Project '{project}' still holds training container '{container}' from an earlier run; halt it first")]
    StaleTrainJob { project: String, container: String },

    #[error("Checkpoint '{checkpoint}' of project '{project}' is already in use by an export")]
    CheckpointInUse { project: String, checkpoint: String },

    #[error("Invalid training status transition from {from} to {to}")]
    InvalidTransition {
        from: TrainingStatus,
        to: TrainingStatus,
    },

    #[error("Invalid readiness transition from {from} to {to}")]
    InvalidReadinessTransition {
        from: ReadinessState,
        to: ReadinessState,
    },

    #[error("Step '{step}' failed: {source}")]
    Stage {
        step: &'static str,
        #[source]
        source: StageError,
    },

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

impl OrchestratorError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ProjectNotFound(id) => Self::not_found("Project", id),
            other => Self::Store(other),
        }
    }
}
