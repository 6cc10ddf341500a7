//! Metrics module for Prometheus-based monitoring.
//!
//! Tracks service readiness, how many projects sit in each training status,
//! pipeline run outcomes and per-step durations.
//!
//! # Example
//!
//! ```ignore
//! use trainforge::metrics::{init_metrics, export_metrics, MetricsCollector, RunOutcome};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! MetricsCollector::new().record_run("train", RunOutcome::Success);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{MetricsCollector, RunOutcome};
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{PIPELINE_RUNS_TOTAL, READINESS_STATE, REGISTRY, STEP_DURATION, TRAINING_PROJECTS};
