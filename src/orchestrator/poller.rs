//! Background checkpoint poller.
//!
//! While a project is training, its checkpoints only show up on disk. The
//! poller reconciles them into the project record every `interval` so that
//! `current_epoch` tracks the run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::service::Orchestrator;
use super::status::TrainingStatus;

/// A background task that polls checkpoints of every training project.
///
/// Call [`CheckpointPoller::stop`] to cancel.
pub struct CheckpointPoller {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CheckpointPoller {
    /// Start polling every `interval`. The first poll happens one interval
    /// after start.
    pub fn start(orchestrator: Arc<Orchestrator>, interval: Duration) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick

            loop {
                tick.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }
                poll_once(&orchestrator).await;
            }
        });

        Self {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Signal the poller to stop and wait for it to finish.
    pub async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for CheckpointPoller {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }
}

/// Runs one reconciliation pass and returns how many projects were polled.
pub async fn poll_once(orchestrator: &Orchestrator) -> usize {
    let training: Vec<String> = orchestrator
        .list_statuses()
        .await
        .into_iter()
        .filter(|(_, record)| record.training_status == TrainingStatus::Training)
        .map(|(id, _)| id)
        .collect();

    for project_id in &training {
        match orchestrator.update_checkpoints(project_id).await {
            Ok(latest) => {
                tracing::debug!(project_id = %project_id, latest_epoch = ?latest, "Checkpoints polled")
            }
            Err(e) => {
                tracing::warn!(project_id = %project_id, error = %e, "Checkpoint poll failed")
            }
        }
    }

    training.len()
}
