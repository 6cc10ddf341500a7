//! Orchestration service.
//!
//! This module provides the core of trainforge:
//!
//! - [`readiness`]: the boot-time readiness state machine
//! - [`status`]: the per-project training status table
//! - [`service`]: the [`Orchestrator`] that sequences the train, export and
//!   test pipelines and controls live training containers
//! - [`poller`]: a background task reconciling checkpoints of running projects
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use trainforge::config::ServiceConfig;
//! use trainforge::orchestrator::Orchestrator;
//! use trainforge::runtime::DockerRuntime;
//! use trainforge::store::JsonProjectStore;
//!
//! let config = ServiceConfig::from_env()?;
//! let runtime = Arc::new(DockerRuntime::new()?);
//! let store = Arc::new(JsonProjectStore::new(&config.store_dir));
//! let orchestrator = Orchestrator::containerized(runtime, store, &config);
//!
//! orchestrator.boot().await?;
//! orchestrator.start("my-project").await?;
//! ```

pub mod poller;
pub mod readiness;
pub mod service;
pub mod status;

pub use poller::CheckpointPoller;
pub use readiness::{Readiness, ReadinessState};
pub use service::Orchestrator;
pub use status::{StatusEvent, StatusRecord, StatusTable, TrainingStatus};
