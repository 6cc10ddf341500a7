//! trainforge: orchestration of containerized model training, export and test
//! workloads.
//!
//! The [`orchestrator::Orchestrator`] boots against a container runtime,
//! tracks a training status per project and sequences the train, export and
//! test pipelines through pluggable stage executors.

pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod runtime;
pub mod stages;
pub mod store;

// Re-export commonly used types
pub use config::ServiceConfig;
pub use error::{OrchestratorError, RuntimeError, StageError, StoreError};
pub use orchestrator::{Orchestrator, ReadinessState, TrainingStatus};
