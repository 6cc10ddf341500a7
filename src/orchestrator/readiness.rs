//! Service readiness state machine.
//!
//! Readiness only moves forward, one state at a time, in the order the
//! variants are declared below. `NoRuntime` is the single exception: it is
//! reachable only from `ScanningRuntime` and ends the sequence.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::error::OrchestratorError;
use crate::metrics::MetricsCollector;

/// Where the service is in its boot sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadinessState {
    NoRuntime,
    ScanningRuntime,
    ScanningProjects,
    PullDatasetImage,
    PullMetricsImage,
    PullTrainImage,
    PullExportImage,
    PullTestImage,
    Ready,
}

impl ReadinessState {
    /// Image pull states, in pull order.
    pub const PULL_SEQUENCE: [ReadinessState; 5] = [
        ReadinessState::PullDatasetImage,
        ReadinessState::PullMetricsImage,
        ReadinessState::PullTrainImage,
        ReadinessState::PullExportImage,
        ReadinessState::PullTestImage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReadinessState::NoRuntime => "NO_RUNTIME",
            ReadinessState::ScanningRuntime => "SCANNING_RUNTIME",
            ReadinessState::ScanningProjects => "SCANNING_PROJECTS",
            ReadinessState::PullDatasetImage => "PULL_DATASET_IMAGE",
            ReadinessState::PullMetricsImage => "PULL_METRICS_IMAGE",
            ReadinessState::PullTrainImage => "PULL_TRAIN_IMAGE",
            ReadinessState::PullExportImage => "PULL_EXPORT_IMAGE",
            ReadinessState::PullTestImage => "PULL_TEST_IMAGE",
            ReadinessState::Ready => "READY",
        }
    }

    /// Position in the boot sequence, used as the readiness gauge value.
    pub fn ordinal(&self) -> u8 {
        *self as u8
    }

    /// Boot has finished, successfully or not.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReadinessState::NoRuntime | ReadinessState::Ready)
    }

    /// The state that follows this one on a successful boot.
    fn successor(&self) -> Option<ReadinessState> {
        match self {
            ReadinessState::NoRuntime | ReadinessState::Ready => None,
            ReadinessState::ScanningRuntime => Some(ReadinessState::ScanningProjects),
            ReadinessState::ScanningProjects => Some(ReadinessState::PullDatasetImage),
            ReadinessState::PullDatasetImage => Some(ReadinessState::PullMetricsImage),
            ReadinessState::PullMetricsImage => Some(ReadinessState::PullTrainImage),
            ReadinessState::PullTrainImage => Some(ReadinessState::PullExportImage),
            ReadinessState::PullExportImage => Some(ReadinessState::PullTestImage),
            ReadinessState::PullTestImage => Some(ReadinessState::Ready),
        }
    }

    /// Check if moving from `self` to `next` is allowed.
    pub fn can_advance_to(&self, next: ReadinessState) -> bool {
        match (self, next) {
            (ReadinessState::ScanningRuntime, ReadinessState::NoRuntime) => true,
            _ => self.successor() == Some(next),
        }
    }
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current readiness plus every state entered so far.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadinessSnapshot {
    current: ReadinessState,
    history: Vec<ReadinessState>,
}

/// Observable readiness cell owned by the orchestrator.
pub struct Readiness {
    tx: watch::Sender<ReadinessSnapshot>,
    metrics: MetricsCollector,
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

impl Readiness {
    /// Starts in `ScanningRuntime`.
    pub fn new() -> Self {
        let initial = ReadinessState::ScanningRuntime;
        let (tx, _rx) = watch::channel(ReadinessSnapshot {
            current: initial,
            history: vec![initial],
        });
        let metrics = MetricsCollector::new();
        metrics.record_readiness(initial.ordinal());
        Self { tx, metrics }
    }

    pub fn current(&self) -> ReadinessState {
        self.tx.borrow().current
    }

    pub fn history(&self) -> Vec<ReadinessState> {
        self.tx.borrow().history.clone()
    }

    /// Moves to `next`, rejecting anything but the immediate successor.
    pub fn advance(&self, next: ReadinessState) -> Result<(), OrchestratorError> {
        let mut rejected = None;
        self.tx.send_if_modified(|snapshot| {
            if !snapshot.current.can_advance_to(next) {
                rejected = Some(snapshot.current);
                return false;
            }
            snapshot.current = next;
            snapshot.history.push(next);
            true
        });

        if let Some(from) = rejected {
            return Err(OrchestratorError::InvalidReadinessTransition { from, to: next });
        }

        self.metrics.record_readiness(next.ordinal());
        info!(readiness = %next, "Readiness changed");
        Ok(())
    }

    /// Waits until boot reaches `Ready` or `NoRuntime` and returns that state.
    ///
    /// A boot that fails while pulling never reaches either, so callers should
    /// only wait on a boot that is still running.
    pub async fn wait_until_settled(&self) -> ReadinessState {
        let mut rx = self.tx.subscribe();
        let settled = rx
            .wait_for(|snapshot| snapshot.current.is_terminal())
            .await
            .map(|snapshot| snapshot.current);
        settled.unwrap_or_else(|_| self.current())
    }
}
