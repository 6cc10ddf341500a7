//! The orchestration service.
//!
//! [`Orchestrator`] owns the readiness state machine and the status table and
//! sequences the train, export and test pipelines through the stage
//! executors. It is also the only component that touches the container
//! handle cached on a project record.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::{ImageSet, ServiceConfig};
use crate::error::{OrchestratorError, RuntimeError, StageError};
use crate::metrics::{MetricsCollector, RunOutcome};
use crate::runtime::{ContainerHandle, ContainerRuntime};
use crate::stages::{ExportStep, PipelineStep, StageSet, TestStep, TrainStep};
use crate::store::{Checkpoint, Export, Project, ProjectStore, TestRun, Video};

use super::readiness::{Readiness, ReadinessState};
use super::status::{StatusEvent, StatusGuard, StatusRecord, StatusTable, TrainingStatus};

/// Converts a step's error into the error the caller sees.
trait StepFailure {
    fn into_step_error(self, step: &'static str) -> OrchestratorError;
}

impl StepFailure for StageError {
    fn into_step_error(self, step: &'static str) -> OrchestratorError {
        OrchestratorError::Stage { step, source: self }
    }
}

impl StepFailure for OrchestratorError {
    fn into_step_error(self, _step: &'static str) -> OrchestratorError {
        self
    }
}

/// Marks a project as having a training pipeline in flight.
struct RunGuard {
    active: Arc<StdMutex<HashSet<String>>>,
    project_id: String,
}

impl RunGuard {
    fn acquire(
        active: &Arc<StdMutex<HashSet<String>>>,
        project_id: &str,
    ) -> Result<Self, OrchestratorError> {
        let mut runs = active.lock().unwrap_or_else(PoisonError::into_inner);
        if !runs.insert(project_id.to_string()) {
            return Err(OrchestratorError::AlreadyRunning(project_id.to_string()));
        }
        Ok(Self {
            active: active.clone(),
            project_id: project_id.to_string(),
        })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.project_id);
    }
}

fn outcome<T>(result: &Result<T, OrchestratorError>) -> RunOutcome {
    if result.is_ok() {
        RunOutcome::Success
    } else {
        RunOutcome::Failure
    }
}

/// Coordinates training, export and test workloads across projects.
pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn ProjectStore>,
    stages: StageSet,
    images: ImageSet,
    readiness: Readiness,
    statuses: StatusTable,
    active_runs: Arc<StdMutex<HashSet<String>>>,
    metrics: MetricsCollector,
}

impl Orchestrator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn ProjectStore>,
        stages: StageSet,
        config: &ServiceConfig,
    ) -> Self {
        Self {
            runtime,
            store,
            stages,
            images: config.images.clone(),
            readiness: Readiness::new(),
            statuses: StatusTable::new(config.status_channel_capacity),
            active_runs: Arc::new(StdMutex::new(HashSet::new())),
            metrics: MetricsCollector::new(),
        }
    }

    /// Builds a service whose stages run in containers on `runtime`.
    pub fn containerized(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn ProjectStore>,
        config: &ServiceConfig,
    ) -> Self {
        let stages = StageSet::containerized(runtime.clone(), config);
        Self::new(runtime, store, stages, config)
    }

    // ------------------------------------------------------------------
    // Boot
    // ------------------------------------------------------------------

    /// Runs the boot sequence once: probe the runtime, seed the status table
    /// from the store, then pull every pipeline image in order.
    ///
    /// # Errors
    ///
    /// - `RuntimeUnavailable` if the runtime does not answer; readiness ends
    ///   at `NO_RUNTIME` and nothing is pulled
    /// - the pull error if an image cannot be pulled; readiness stays at that
    ///   pull state
    /// - `InvalidReadinessTransition` if boot already ran
    pub async fn boot(&self) -> Result<(), OrchestratorError> {
        info!("Probing container runtime");
        if !self.runtime.test_daemon().await {
            self.readiness.advance(ReadinessState::NoRuntime)?;
            error!("Container runtime unreachable");
            return Err(OrchestratorError::RuntimeUnavailable);
        }

        self.readiness.advance(ReadinessState::ScanningProjects)?;
        let projects = self.store.retrieve_all().await?;
        for project in &projects {
            self.statuses
                .add_status(&project.id, project.hyperparameters.epochs)
                .await;
            if let Some(handle) = &project.container_ids.train {
                warn!(
                    project_id = %project.id,
                    container = %handle,
                    "Project holds a training container from an earlier run; halt it before training again"
                );
            }
        }
        info!(projects = projects.len(), "Projects scanned");

        for (state, image) in self.images.pull_plan() {
            self.readiness.advance(state)?;
            info!(image, readiness = %state, "Pulling image");
            self.runtime.pull(image).await?;
        }

        self.readiness.advance(ReadinessState::Ready)?;
        info!("Service ready");
        Ok(())
    }

    pub fn readiness(&self) -> ReadinessState {
        self.readiness.current()
    }

    /// Every readiness state entered so far, oldest first.
    pub fn readiness_history(&self) -> Vec<ReadinessState> {
        self.readiness.history()
    }

    pub async fn wait_until_settled(&self) -> ReadinessState {
        self.readiness.wait_until_settled().await
    }

    fn ensure_ready(&self) -> Result<(), OrchestratorError> {
        match self.readiness.current() {
            ReadinessState::Ready => Ok(()),
            ReadinessState::NoRuntime => Err(OrchestratorError::RuntimeUnavailable),
            other => Err(OrchestratorError::NotReady(other)),
        }
    }

    // ------------------------------------------------------------------
    // Shared plumbing
    // ------------------------------------------------------------------

    /// Seeds a status record for `project_id` if none exists.
    pub async fn add_status(&self, project_id: &str, last_epoch: u32) -> bool {
        self.statuses.add_status(project_id, last_epoch).await
    }

    /// Locks the status record of `project_id`, seeding it from the store on
    /// first sight.
    async fn lock_status(&self, project_id: &str) -> Result<StatusGuard, OrchestratorError> {
        if let Some(guard) = self.statuses.lock(project_id).await {
            return Ok(guard);
        }

        let project = self.store.retrieve_by_id(project_id).await?;
        self.statuses
            .add_status(&project.id, project.hyperparameters.epochs)
            .await;
        self.statuses
            .lock(project_id)
            .await
            .ok_or_else(|| OrchestratorError::not_found("Project", project_id))
    }

    /// Applies `apply` to a fresh copy of the project and persists it. The
    /// caller's guard keeps the read-modify-write exclusive.
    async fn update_project<T, F>(&self, guard: &StatusGuard, apply: F) -> Result<T, OrchestratorError>
    where
        F: FnOnce(&mut Project) -> Result<T, OrchestratorError>,
    {
        let mut project = self.store.retrieve_by_id(guard.project_id()).await?;
        let value = apply(&mut project)?;
        self.store.persist(&project).await?;
        Ok(value)
    }

    /// [`update_project`](Self::update_project) under a freshly taken lock.
    async fn modify_project<T, F>(&self, project_id: &str, apply: F) -> Result<T, OrchestratorError>
    where
        F: FnOnce(&mut Project) -> Result<T, OrchestratorError>,
    {
        let guard = self.lock_status(project_id).await?;
        self.update_project(&guard, apply).await
    }

    /// Runs one named pipeline step with logging, timing and error wrapping.
    async fn run_step<S, T, E, Fut>(
        &self,
        project_id: &str,
        step: S,
        work: Fut,
    ) -> Result<T, OrchestratorError>
    where
        S: PipelineStep,
        E: StepFailure + std::fmt::Display,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        debug!(pipeline = S::PIPELINE, step = step.name(), project_id, "Step started");

        let result = work.await;
        let elapsed = started.elapsed();
        self.metrics.record_step(S::PIPELINE, step.name(), elapsed);

        match result {
            Ok(value) => {
                debug!(
                    pipeline = S::PIPELINE,
                    step = step.name(),
                    project_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Step completed"
                );
                Ok(value)
            }
            Err(e) => {
                warn!(
                    pipeline = S::PIPELINE,
                    step = step.name(),
                    project_id,
                    error = %e,
                    "Step failed"
                );
                Err(e.into_step_error(step.name()))
            }
        }
    }

    /// Force-removes a finished or killed container. A container that is
    /// already gone counts as removed; other failures are logged.
    async fn discard_container(&self, project_id: &str, handle: &ContainerHandle) {
        match self.runtime.remove_container(handle).await {
            Ok(()) | Err(RuntimeError::ContainerNotFound { .. }) => {}
            Err(e) => {
                warn!(project_id, container = %handle, error = %e, "Failed to remove training container")
            }
        }
    }

    async fn train_handle(&self, project_id: &str) -> Result<ContainerHandle, OrchestratorError> {
        let project = self.store.retrieve_by_id(project_id).await?;
        project
            .container_ids
            .train
            .ok_or_else(|| OrchestratorError::NoTrainJob(project_id.to_string()))
    }

    // ------------------------------------------------------------------
    // Training pipeline
    // ------------------------------------------------------------------

    /// Runs the full training pipeline for `project_id` and returns once the
    /// training container has exited and checkpoints are reconciled.
    ///
    /// # Errors
    ///
    /// - `AlreadyRunning` if a training pipeline for this project is in flight
    /// - `StaleTrainJob` if the project still records a training container
    ///   from an earlier run that was never halted
    /// - `Stage` for the first failing step; the status table keeps the last
    ///   state it reached
    pub async fn start(&self, project_id: &str) -> Result<(), OrchestratorError> {
        self.ensure_ready()?;
        let _run = RunGuard::acquire(&self.active_runs, project_id)?;

        info!(project_id, "Training pipeline started");
        let result = self.run_training(project_id).await;
        self.metrics.record_run(TrainStep::PIPELINE, outcome(&result));

        match &result {
            Ok(()) => info!(project_id, "Training pipeline finished"),
            Err(e) => error!(project_id, error = %e, "Training pipeline failed"),
        }
        result
    }

    async fn run_training(&self, project_id: &str) -> Result<(), OrchestratorError> {
        let trainer = self.stages.trainer.clone();

        let project = {
            let mut status = self.lock_status(project_id).await?;
            let project = self.store.retrieve_by_id(project_id).await?;
            // The run guard is held, so a recorded handle belongs to an earlier run.
            if let Some(handle) = &project.container_ids.train {
                return Err(OrchestratorError::StaleTrainJob {
                    project: project_id.to_string(),
                    container: handle.to_string(),
                });
            }

            let stale = matches!(
                status.status(),
                TrainingStatus::Preparing | TrainingStatus::Training
            );
            if stale {
                warn!(project_id, status = %status.status(), "Recovering status of an abandoned run");
                status.transition(TrainingStatus::NotTraining)?;
            }
            status.transition(TrainingStatus::Preparing)?;
            status.set_last_epoch(project.hyperparameters.epochs);
            project
        };

        self.run_step(
            project_id,
            TrainStep::WriteHyperparameters,
            trainer.write_hyperparameters(&project),
        )
        .await?;

        let project = {
            let _status = self.lock_status(project_id).await?;
            self.run_step(project_id, TrainStep::ClearStaleRun, async {
                let mut fresh = self.store.retrieve_by_id(project_id).await?;
                trainer.clear_stale_run(&mut fresh).await?;
                self.store.persist(&fresh).await?;
                Ok::<_, StageError>(fresh)
            })
            .await?
        };

        self.run_step(project_id, TrainStep::StageDataset, trainer.stage_dataset(&project))
            .await?;
        self.run_step(project_id, TrainStep::ExtractDataset, trainer.extract_dataset(&project))
            .await?;

        let handle = {
            let mut status = self.lock_status(project_id).await?;
            let handle = self
                .run_step(project_id, TrainStep::LaunchTraining, trainer.launch_training(&project))
                .await?;

            let recorded = self
                .update_project(&status, |p| {
                    p.container_ids.train = Some(handle.clone());
                    Ok(())
                })
                .await;
            if let Err(e) = recorded {
                if let Err(kill_err) = self.runtime.kill_container(&handle).await {
                    warn!(project_id, container = %handle, error = %kill_err, "Failed to kill unrecorded training container");
                }
                self.discard_container(project_id, &handle).await;
                return Err(e);
            }

            status.transition(TrainingStatus::Training)?;
            status.reset_epoch();
            info!(project_id, container = %handle, "Training container running");
            handle
        };

        self.run_step(
            project_id,
            TrainStep::TrainModel,
            trainer.await_training(&project, &handle),
        )
        .await?;

        let mut status = self.lock_status(project_id).await?;
        let latest = self
            .run_step(project_id, TrainStep::UpdateCheckpoints, async {
                let mut fresh = self.store.retrieve_by_id(project_id).await?;
                let latest = trainer.update_checkpoints(&mut fresh).await?;
                fresh.container_ids.train = None;
                self.store.persist(&fresh).await?;
                Ok::<_, StageError>(latest)
            })
            .await?;
        self.discard_container(project_id, &handle).await;

        if let Some(epoch) = latest {
            status.advance_epoch(epoch);
        }
        status.transition(TrainingStatus::NotTraining)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Live container control
    // ------------------------------------------------------------------

    /// Kills and removes the project's training container.
    ///
    /// # Errors
    ///
    /// Returns `NoTrainJob` if the project has no training container.
    pub async fn halt(&self, project_id: &str) -> Result<(), OrchestratorError> {
        let mut status = self.lock_status(project_id).await?;
        let handle = self.train_handle(project_id).await?;

        match self.runtime.kill_container(&handle).await {
            Ok(()) => {}
            Err(RuntimeError::ContainerNotFound { id }) => {
                warn!(project_id, container = %id, "Training container already gone");
            }
            Err(e) => return Err(e.into()),
        }
        self.discard_container(project_id, &handle).await;

        self.update_project(&status, |p| {
            p.container_ids.train = None;
            Ok(())
        })
        .await?;
        status.transition(TrainingStatus::NotTraining)?;

        info!(project_id, container = %handle, "Training halted");
        Ok(())
    }

    /// Pauses the project's training container.
    ///
    /// # Errors
    ///
    /// - `AlreadyPaused` if training is already paused
    /// - `NoTrainJob` if the project has no training container
    /// - `StaleTrainJob` if the container is left over from an earlier run
    pub async fn pause_training(&self, project_id: &str) -> Result<(), OrchestratorError> {
        let mut status = self.lock_status(project_id).await?;
        if status.status() == TrainingStatus::Paused {
            return Err(OrchestratorError::AlreadyPaused(project_id.to_string()));
        }
        let handle = self.train_handle(project_id).await?;
        if status.status() == TrainingStatus::NotTraining {
            return Err(OrchestratorError::StaleTrainJob {
                project: project_id.to_string(),
                container: handle.to_string(),
            });
        }
        status.check_transition(TrainingStatus::Paused)?;

        self.runtime.pause_container(&handle).await?;
        status.transition(TrainingStatus::Paused)?;

        info!(project_id, container = %handle, "Training paused");
        Ok(())
    }

    /// Resumes the project's paused training container.
    ///
    /// # Errors
    ///
    /// - `NotPaused` if training is not paused
    /// - `NoTrainJob` if the project has no training container
    pub async fn resume_training(&self, project_id: &str) -> Result<(), OrchestratorError> {
        let mut status = self.lock_status(project_id).await?;
        if status.status() != TrainingStatus::Paused {
            return Err(OrchestratorError::NotPaused(project_id.to_string()));
        }
        let handle = self.train_handle(project_id).await?;

        self.runtime.resume_container(&handle).await?;
        status.transition(TrainingStatus::Training)?;

        info!(project_id, container = %handle, "Training resumed");
        Ok(())
    }

    /// Reconciles on-disk checkpoints into the project record and moves the
    /// current epoch forward while training. Returns the latest checkpoint
    /// epoch. Safe to call repeatedly.
    pub async fn update_checkpoints(&self, project_id: &str) -> Result<Option<u32>, OrchestratorError> {
        let mut status = self.lock_status(project_id).await?;
        let trainer = self.stages.trainer.clone();

        let latest = self
            .run_step(project_id, TrainStep::UpdateCheckpoints, async {
                let mut project = self.store.retrieve_by_id(project_id).await?;
                let before = project.checkpoints.clone();
                let latest = trainer.update_checkpoints(&mut project).await?;
                if project.checkpoints != before {
                    self.store.persist(&project).await?;
                }
                Ok::<_, StageError>(latest)
            })
            .await?;

        if let Some(epoch) = latest {
            if status.advance_epoch(epoch) {
                debug!(project_id, epoch, "Training epoch advanced");
            }
        }
        Ok(latest)
    }

    // ------------------------------------------------------------------
    // Export pipeline
    // ------------------------------------------------------------------

    /// Converts the checkpoint written at epoch `checkpoint` into an export.
    ///
    /// The checkpoint is marked in use for the duration of the export and
    /// released afterwards whether or not the export succeeded.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the project or checkpoint does not exist
    /// - `CheckpointInUse` if another export is reading the checkpoint
    /// - `Stage` for the first failing step
    pub async fn export(
        &self,
        project_id: &str,
        checkpoint: u32,
        name: &str,
    ) -> Result<Export, OrchestratorError> {
        self.ensure_ready()?;

        info!(project_id, checkpoint, name, "Export pipeline started");
        let result = self.run_export(project_id, checkpoint, name).await;
        self.metrics.record_run(ExportStep::PIPELINE, outcome(&result));

        match &result {
            Ok(export) => info!(project_id, export_id = %export.id, "Export pipeline finished"),
            Err(e) => error!(project_id, error = %e, "Export pipeline failed"),
        }
        result
    }

    async fn run_export(
        &self,
        project_id: &str,
        step: u32,
        name: &str,
    ) -> Result<Export, OrchestratorError> {
        let exporter = self.stages.exporter.clone();
        let project = self.store.retrieve_by_id(project_id).await?;
        let checkpoint = project
            .checkpoint_at(step)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found("Checkpoint", format!("{project_id}/{step}")))?;
        if checkpoint.in_use {
            return Err(OrchestratorError::CheckpointInUse {
                project: project_id.to_string(),
                checkpoint: checkpoint.id,
            });
        }

        let export = self
            .run_step(
                project_id,
                ExportStep::CreateExport,
                exporter.create_export(&project, &checkpoint, name),
            )
            .await?;
        self.run_step(
            project_id,
            ExportStep::CreateDirectory,
            exporter.create_export_dir(&export),
        )
        .await?;
        self.run_step(
            project_id,
            ExportStep::MarkCheckpoint,
            self.set_checkpoint_in_use(project_id, &checkpoint.id, true),
        )
        .await?;

        let exported = self.export_marked(&project, &checkpoint, &export).await;
        let released = self
            .run_step(
                project_id,
                ExportStep::ReleaseCheckpoint,
                self.set_checkpoint_in_use(project_id, &checkpoint.id, false),
            )
            .await;

        match (exported, released) {
            (Err(e), released) => {
                if let Err(release_err) = released {
                    error!(project_id, checkpoint = %checkpoint.id, error = %release_err, "Checkpoint left marked in use");
                }
                Err(e)
            }
            (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(export),
        }
    }

    /// Export steps that run while the checkpoint is marked in use.
    async fn export_marked(
        &self,
        project: &Project,
        checkpoint: &Checkpoint,
        export: &Export,
    ) -> Result<(), OrchestratorError> {
        let exporter = self.stages.exporter.clone();
        let project_id = project.id.as_str();

        self.run_step(
            project_id,
            ExportStep::WriteParameters,
            exporter.write_export_params(project, checkpoint, export),
        )
        .await?;
        self.run_step(
            project_id,
            ExportStep::RunContainer,
            exporter.run_export(project, export),
        )
        .await?;
        self.run_step(
            project_id,
            ExportStep::SaveExport,
            self.modify_project(project_id, |p| {
                p.exports.insert(export.id.clone(), export.clone());
                Ok(())
            }),
        )
        .await
    }

    async fn set_checkpoint_in_use(
        &self,
        project_id: &str,
        checkpoint_id: &str,
        in_use: bool,
    ) -> Result<(), OrchestratorError> {
        self.modify_project(project_id, |p| match p.checkpoints.get_mut(checkpoint_id) {
            Some(c) if in_use && c.in_use => Err(OrchestratorError::CheckpointInUse {
                project: project_id.to_string(),
                checkpoint: checkpoint_id.to_string(),
            }),
            Some(c) => {
                c.in_use = in_use;
                Ok(())
            }
            None if in_use => Err(OrchestratorError::not_found(
                "Checkpoint",
                format!("{project_id}/{checkpoint_id}"),
            )),
            None => Ok(()),
        })
        .await
    }

    // ------------------------------------------------------------------
    // Test pipeline
    // ------------------------------------------------------------------

    /// Runs an export against one of the project's videos.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the project, export or video does not exist
    /// - `Stage` for the first failing step
    pub async fn test(
        &self,
        name: &str,
        project_id: &str,
        export_id: &str,
        video_id: &str,
    ) -> Result<TestRun, OrchestratorError> {
        self.ensure_ready()?;

        info!(project_id, export_id, video_id, name, "Test pipeline started");
        let result = self.run_test(name, project_id, export_id, video_id).await;
        self.metrics.record_run(TestStep::PIPELINE, outcome(&result));

        match &result {
            Ok(test) => info!(project_id, test_id = %test.id, "Test pipeline finished"),
            Err(e) => error!(project_id, error = %e, "Test pipeline failed"),
        }
        result
    }

    async fn run_test(
        &self,
        name: &str,
        project_id: &str,
        export_id: &str,
        video_id: &str,
    ) -> Result<TestRun, OrchestratorError> {
        let tester = self.stages.tester.clone();

        let mut test = self
            .run_step(
                project_id,
                TestStep::CreateTest,
                tester.create_test(name, project_id, export_id, video_id),
            )
            .await?;

        let project = self.store.retrieve_by_id(project_id).await?;
        let export = project
            .exports
            .get(export_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found("Export", export_id))?;
        let video = project
            .videos
            .get(video_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found("Video", video_id))?;

        self.run_step(
            project_id,
            TestStep::MountInputs,
            tester.mount_inputs(&project, &test, &export, &video),
        )
        .await?;
        self.run_step(
            project_id,
            TestStep::WriteParameters,
            tester.write_test_params(&project, &test, &video),
        )
        .await?;
        self.run_step(project_id, TestStep::RunContainer, tester.run_test(&project, &test))
            .await?;

        let output = self
            .run_step(project_id, TestStep::SaveOutputVideo, async {
                let output = tester
                    .collect_output(&project, &test)
                    .await
                    .map_err(|e| e.into_step_error(TestStep::SaveOutputVideo.name()))?;
                self.modify_project(project_id, |p| {
                    p.videos.insert(output.id.clone(), output.clone());
                    Ok(())
                })
                .await?;
                Ok::<_, OrchestratorError>(output)
            })
            .await?;

        test.output_video_id = Some(output.id);
        self.run_step(
            project_id,
            TestStep::SaveTest,
            self.modify_project(project_id, |p| {
                p.tests.insert(test.id.clone(), test.clone());
                Ok(())
            }),
        )
        .await?;

        Ok(test)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Returns the status record of a project the service has seen.
    pub async fn get_status(&self, project_id: &str) -> Result<StatusRecord, OrchestratorError> {
        self.statuses
            .snapshot(project_id)
            .await
            .ok_or_else(|| OrchestratorError::not_found("Project", project_id))
    }

    /// Every status record, sorted by project id.
    pub async fn list_statuses(&self) -> Vec<(String, StatusRecord)> {
        self.statuses.snapshot_all().await
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.statuses.subscribe()
    }

    /// Checkpoints of a project, oldest epoch first.
    pub async fn get_checkpoints(&self, project_id: &str) -> Result<Vec<Checkpoint>, OrchestratorError> {
        let project = self.store.retrieve_by_id(project_id).await?;
        let mut checkpoints: Vec<_> = project.checkpoints.into_values().collect();
        checkpoints.sort_by_key(|c| c.step);
        Ok(checkpoints)
    }

    pub async fn get_exports(&self, project_id: &str) -> Result<Vec<Export>, OrchestratorError> {
        let project = self.store.retrieve_by_id(project_id).await?;
        let mut exports: Vec<_> = project.exports.into_values().collect();
        exports.sort_by_key(|e| e.created_at);
        Ok(exports)
    }

    pub async fn get_videos(&self, project_id: &str) -> Result<Vec<Video>, OrchestratorError> {
        let project = self.store.retrieve_by_id(project_id).await?;
        Ok(project.videos.into_values().collect())
    }

    pub async fn get_tests(&self, project_id: &str) -> Result<Vec<TestRun>, OrchestratorError> {
        let project = self.store.retrieve_by_id(project_id).await?;
        let mut tests: Vec<_> = project.tests.into_values().collect();
        tests.sort_by_key(|t| t.created_at);
        Ok(tests)
    }
}
