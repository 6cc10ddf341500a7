//! Per-project training status table.
//!
//! Each project id owns one record behind its own async mutex. Holding a
//! [`StatusGuard`] is what serializes every status and project-record
//! mutation for that id; different ids never contend.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

use crate::error::OrchestratorError;
use crate::metrics::MetricsCollector;

/// Training lifecycle of one project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrainingStatus {
    NotTraining,
    Preparing,
    Training,
    Paused,
}

impl TrainingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrainingStatus::NotTraining => "NOT_TRAINING",
            TrainingStatus::Preparing => "PREPARING",
            TrainingStatus::Training => "TRAINING",
            TrainingStatus::Paused => "PAUSED",
        }
    }

    /// Check if a transition between two statuses is allowed.
    ///
    /// Valid transitions:
    /// - NotTraining -> Preparing (pipeline start)
    /// - Preparing -> Training (container launched)
    /// - Training <-> Paused
    /// - any -> NotTraining (completion or halt)
    pub fn can_transition_to(&self, next: TrainingStatus) -> bool {
        matches!(
            (self, next),
            (_, TrainingStatus::NotTraining)
                | (TrainingStatus::NotTraining, TrainingStatus::Preparing)
                | (TrainingStatus::Preparing, TrainingStatus::Training)
                | (TrainingStatus::Training, TrainingStatus::Paused)
                | (TrainingStatus::Paused, TrainingStatus::Training)
        )
    }
}

impl fmt::Display for TrainingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live training state of one project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub training_status: TrainingStatus,
    pub current_epoch: u32,
    /// Epoch target of the current or most recent run.
    pub last_epoch: u32,
}

impl StatusRecord {
    pub fn new(last_epoch: u32) -> Self {
        Self {
            training_status: TrainingStatus::NotTraining,
            current_epoch: 0,
            last_epoch,
        }
    }
}

/// Published after every change to a status record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEvent {
    pub project_id: String,
    pub record: StatusRecord,
}

/// Keyed store of status records, one async mutex per project id.
pub struct StatusTable {
    records: RwLock<HashMap<String, Arc<Mutex<StatusRecord>>>>,
    events: broadcast::Sender<StatusEvent>,
    metrics: MetricsCollector,
}

impl StatusTable {
    pub fn new(channel_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            records: RwLock::new(HashMap::new()),
            events,
            metrics: MetricsCollector::new(),
        }
    }

    /// Seeds a `NotTraining` record for `project_id` unless one exists.
    ///
    /// Returns `true` when a record was created.
    pub async fn add_status(&self, project_id: &str, last_epoch: u32) -> bool {
        let mut records = self.records.write().await;
        if records.contains_key(project_id) {
            return false;
        }

        let record = StatusRecord::new(last_epoch);
        records.insert(project_id.to_string(), Arc::new(Mutex::new(record)));
        drop(records);

        self.metrics
            .record_status_change(None, record.training_status.as_str());
        let _ = self.events.send(StatusEvent {
            project_id: project_id.to_string(),
            record,
        });
        debug!(project_id, last_epoch, "Status record created");
        true
    }

    pub async fn contains(&self, project_id: &str) -> bool {
        self.records.read().await.contains_key(project_id)
    }

    /// Locks the record of `project_id`, waiting for any other holder.
    pub async fn lock(&self, project_id: &str) -> Option<StatusGuard> {
        let cell = self.records.read().await.get(project_id).cloned()?;
        let record = cell.lock_owned().await;
        Some(StatusGuard {
            project_id: project_id.to_string(),
            record,
            events: self.events.clone(),
            metrics: self.metrics,
        })
    }

    pub async fn snapshot(&self, project_id: &str) -> Option<StatusRecord> {
        let cell = self.records.read().await.get(project_id).cloned()?;
        let record = *cell.lock().await;
        Some(record)
    }

    /// Snapshots every record, sorted by project id.
    pub async fn snapshot_all(&self) -> Vec<(String, StatusRecord)> {
        let cells: Vec<_> = self
            .records
            .read()
            .await
            .iter()
            .map(|(id, cell)| (id.clone(), cell.clone()))
            .collect();

        let mut out = Vec::with_capacity(cells.len());
        for (id, cell) in cells {
            let record = *cell.lock().await;
            out.push((id, record));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }
}

/// Exclusive access to one project's status record.
///
/// Every mutation publishes a [`StatusEvent`].
pub struct StatusGuard {
    project_id: String,
    record: OwnedMutexGuard<StatusRecord>,
    events: broadcast::Sender<StatusEvent>,
    metrics: MetricsCollector,
}

impl StatusGuard {
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn record(&self) -> StatusRecord {
        *self.record
    }

    pub fn status(&self) -> TrainingStatus {
        self.record.training_status
    }

    /// Fails unless the current status may move to `next`.
    pub fn check_transition(&self, next: TrainingStatus) -> Result<(), OrchestratorError> {
        let from = self.status();
        if from.can_transition_to(next) {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidTransition { from, to: next })
        }
    }

    pub fn transition(&mut self, next: TrainingStatus) -> Result<(), OrchestratorError> {
        self.check_transition(next)?;
        let from = self.status();
        self.record.training_status = next;
        if from != next {
            self.metrics
                .record_status_change(Some(from.as_str()), next.as_str());
        }
        debug!(project_id = %self.project_id, from = %from, to = %next, "Training status changed");
        self.publish();
        Ok(())
    }

    pub fn set_last_epoch(&mut self, last_epoch: u32) {
        self.record.last_epoch = last_epoch;
        self.publish();
    }

    pub fn reset_epoch(&mut self) {
        self.record.current_epoch = 0;
        self.publish();
    }

    /// Moves `current_epoch` forward to `epoch` while training.
    ///
    /// Returns `true` if the epoch changed.
    pub fn advance_epoch(&mut self, epoch: u32) -> bool {
        if self.status() != TrainingStatus::Training || epoch <= self.record.current_epoch {
            return false;
        }
        self.record.current_epoch = epoch;
        self.publish();
        true
    }

    fn publish(&self) {
        let _ = self.events.send(StatusEvent {
            project_id: self.project_id.clone(),
            record: *self.record,
        });
    }
}
