//! Recording helpers for trainforge metrics.
//!
//! Every method is a no-op until [`init_metrics`](super::init_metrics) has run,
//! so library users and tests never need to initialize metrics.

use std::time::Duration;

use super::prometheus::{PIPELINE_RUNS_TOTAL, READINESS_STATE, STEP_DURATION, TRAINING_PROJECTS};

/// Outcome label of a finished pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Failure,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Failure => "failure",
        }
    }
}

/// Metrics collector for recording orchestration metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Records the readiness position (0 = NO_RUNTIME, 8 = READY).
    pub fn record_readiness(&self, ordinal: u8) {
        if let Some(gauge) = READINESS_STATE.get() {
            gauge.set(f64::from(ordinal));
        }
    }

    /// Moves one project from the `from` status bucket to `to`.
    ///
    /// `from` is `None` when the project enters the status table.
    pub fn record_status_change(&self, from: Option<&str>, to: &str) {
        let Some(gauge) = TRAINING_PROJECTS.get() else {
            return;
        };
        if let Some(from) = from {
            gauge.with_label_values(&[from]).dec();
        }
        gauge.with_label_values(&[to]).inc();
    }

    /// Records the duration of one pipeline step.
    pub fn record_step(&self, pipeline: &str, step: &str, elapsed: Duration) {
        if let Some(histogram) = STEP_DURATION.get() {
            histogram
                .with_label_values(&[pipeline, step])
                .observe(elapsed.as_secs_f64());
        }
    }

    /// Records a finished pipeline run.
    pub fn record_run(&self, pipeline: &str, outcome: RunOutcome) {
        if let Some(counter) = PIPELINE_RUNS_TOTAL.get() {
            counter
                .with_label_values(&[pipeline, outcome.as_str()])
                .inc();
        }
    }
}
