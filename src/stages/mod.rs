//! Stage executors for the train, export and test pipelines.
//!
//! Each pipeline is a fixed, ordered list of named steps. The step names live
//! in [`TrainStep`], [`ExportStep`] and [`TestStep`]; the work behind each
//! step is provided by a [`Trainer`], [`Exporter`] or [`Tester`]
//! implementation. The orchestrator owns the ordering and every status or
//! record update between steps, so executors only touch files and containers.
//!
//! # Host layout
//!
//! ```text
//! <data_dir>/projects/<project>/train/            mounted at /train
//!     hyperparameters.json
//!     dataset/                                  staged + extracted dataset
//!     checkpoints/ckpt-<epoch>.{index,data-*}   written by the train image
//! <data_dir>/projects/<project>/exports/<export>/  mounted at /export
//! <data_dir>/projects/<project>/tests/<test>/     mounted at /test
//! ```

pub mod exporter;
pub mod layout;
pub mod tester;
pub mod trainer;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::config::ServiceConfig;
use crate::error::StageError;
use crate::runtime::{ContainerHandle, ContainerRuntime, ContainerSpec};
use crate::store::{Checkpoint, Export, Project, TestRun, Video};

pub use exporter::ContainerExporter;
pub use layout::StageLayout;
pub use tester::ContainerTester;
pub use trainer::ContainerTrainer;

/// A named step of one pipeline.
pub trait PipelineStep: Copy + fmt::Debug + Send {
    /// Pipeline the step belongs to, used as a log field and metric label.
    const PIPELINE: &'static str;

    fn name(&self) -> &'static str;
}

/// Steps of the training pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainStep {
    WriteHyperparameters,
    ClearStaleRun,
    StageDataset,
    ExtractDataset,
    LaunchTraining,
    TrainModel,
    UpdateCheckpoints,
}

impl TrainStep {
    pub const ALL: [TrainStep; 7] = [
        TrainStep::WriteHyperparameters,
        TrainStep::ClearStaleRun,
        TrainStep::StageDataset,
        TrainStep::ExtractDataset,
        TrainStep::LaunchTraining,
        TrainStep::TrainModel,
        TrainStep::UpdateCheckpoints,
    ];
}

impl PipelineStep for TrainStep {
    const PIPELINE: &'static str = "train";

    fn name(&self) -> &'static str {
        match self {
            TrainStep::WriteHyperparameters => "write_hyperparameters",
            TrainStep::ClearStaleRun => "clear_stale_run",
            TrainStep::StageDataset => "stage_dataset",
            TrainStep::ExtractDataset => "extract_dataset",
            TrainStep::LaunchTraining => "launch_training",
            TrainStep::TrainModel => "train_model",
            TrainStep::UpdateCheckpoints => "update_checkpoints",
        }
    }
}

/// Steps of the export pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportStep {
    CreateExport,
    CreateDirectory,
    MarkCheckpoint,
    WriteParameters,
    RunContainer,
    SaveExport,
    ReleaseCheckpoint,
}

impl ExportStep {
    pub const ALL: [ExportStep; 7] = [
        ExportStep::CreateExport,
        ExportStep::CreateDirectory,
        ExportStep::MarkCheckpoint,
        ExportStep::WriteParameters,
        ExportStep::RunContainer,
        ExportStep::SaveExport,
        ExportStep::ReleaseCheckpoint,
    ];
}

impl PipelineStep for ExportStep {
    const PIPELINE: &'static str = "export";

    fn name(&self) -> &'static str {
        match self {
            ExportStep::CreateExport => "create_export",
            ExportStep::CreateDirectory => "create_directory",
            ExportStep::MarkCheckpoint => "mark_checkpoint",
            ExportStep::WriteParameters => "write_parameters",
            ExportStep::RunContainer => "run_container",
            ExportStep::SaveExport => "save_export",
            ExportStep::ReleaseCheckpoint => "release_checkpoint",
        }
    }
}

/// Steps of the test pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStep {
    CreateTest,
    MountInputs,
    WriteParameters,
    RunContainer,
    SaveOutputVideo,
    SaveTest,
}

impl TestStep {
    pub const ALL: [TestStep; 6] = [
        TestStep::CreateTest,
        TestStep::MountInputs,
        TestStep::WriteParameters,
        TestStep::RunContainer,
        TestStep::SaveOutputVideo,
        TestStep::SaveTest,
    ];
}

impl PipelineStep for TestStep {
    const PIPELINE: &'static str = "test";

    fn name(&self) -> &'static str {
        match self {
            TestStep::CreateTest => "create_test",
            TestStep::MountInputs => "mount_inputs",
            TestStep::WriteParameters => "write_parameters",
            TestStep::RunContainer => "run_container",
            TestStep::SaveOutputVideo => "save_output_video",
            TestStep::SaveTest => "save_test",
        }
    }
}

/// Work behind the training pipeline.
#[async_trait]
pub trait Trainer: Send + Sync {
    /// Writes the project's hyperparameters where the train image reads them.
    async fn write_hyperparameters(&self, project: &Project) -> Result<(), StageError>;

    /// Removes leftovers of a previous run. Checkpoints still referenced by an
    /// export or marked in use are kept; the rest are dropped from `project`.
    async fn clear_stale_run(&self, project: &mut Project) -> Result<(), StageError>;

    /// Copies the dataset archive into the training mount.
    async fn stage_dataset(&self, project: &Project) -> Result<(), StageError>;

    /// Unpacks the staged dataset archive.
    async fn extract_dataset(&self, project: &Project) -> Result<(), StageError>;

    /// Starts the training container and returns its handle.
    async fn launch_training(&self, project: &Project) -> Result<ContainerHandle, StageError>;

    /// Waits for the training container to finish. A container that is killed
    /// or exits with a nonzero code is a failure.
    async fn await_training(
        &self,
        project: &Project,
        handle: &ContainerHandle,
    ) -> Result<(), StageError>;

    /// Reconciles on-disk checkpoints into `project.checkpoints` and returns
    /// the latest completed epoch, if any.
    async fn update_checkpoints(&self, project: &mut Project) -> Result<Option<u32>, StageError>;
}

/// Work behind the export pipeline.
#[async_trait]
pub trait Exporter: Send + Sync {
    async fn create_export(
        &self,
        project: &Project,
        checkpoint: &Checkpoint,
        name: &str,
    ) -> Result<Export, StageError>;

    async fn create_export_dir(&self, export: &Export) -> Result<(), StageError>;

    async fn write_export_params(
        &self,
        project: &Project,
        checkpoint: &Checkpoint,
        export: &Export,
    ) -> Result<(), StageError>;

    /// Runs the conversion container to completion.
    async fn run_export(&self, project: &Project, export: &Export) -> Result<(), StageError>;
}

/// Work behind the test pipeline.
#[async_trait]
pub trait Tester: Send + Sync {
    async fn create_test(
        &self,
        name: &str,
        project_id: &str,
        export_id: &str,
        video_id: &str,
    ) -> Result<TestRun, StageError>;

    /// Places the export's model and the input video where the test image expects them.
    async fn mount_inputs(
        &self,
        project: &Project,
        test: &TestRun,
        export: &Export,
        video: &Video,
    ) -> Result<(), StageError>;

    async fn write_test_params(
        &self,
        project: &Project,
        test: &TestRun,
        video: &Video,
    ) -> Result<(), StageError>;

    /// Runs the test container to completion.
    async fn run_test(&self, project: &Project, test: &TestRun) -> Result<(), StageError>;

    /// Returns the video the test container produced.
    async fn collect_output(&self, project: &Project, test: &TestRun) -> Result<Video, StageError>;
}

/// The three executors the orchestrator drives.
#[derive(Clone)]
pub struct StageSet {
    pub trainer: Arc<dyn Trainer>,
    pub exporter: Arc<dyn Exporter>,
    pub tester: Arc<dyn Tester>,
}

impl StageSet {
    /// Builds the container-backed executors from service configuration.
    pub fn containerized(runtime: Arc<dyn ContainerRuntime>, config: &ServiceConfig) -> Self {
        let layout = StageLayout::new(&config.data_dir);
        Self {
            trainer: Arc::new(ContainerTrainer::new(
                runtime.clone(),
                layout.clone(),
                config,
            )),
            exporter: Arc::new(ContainerExporter::new(
                runtime.clone(),
                layout.clone(),
                config.images.export.clone(),
            )),
            tester: Arc::new(ContainerTester::new(runtime, layout, config)),
        }
    }
}

/// Launches a short-lived pipeline container, waits for it to exit cleanly and
/// removes it.
pub(crate) async fn run_to_completion(
    runtime: &dyn ContainerRuntime,
    role: &str,
    spec: &ContainerSpec,
) -> Result<(), StageError> {
    let handle = runtime.launch(spec).await?;
    let waited = runtime.wait(&handle).await;
    if let Err(e) = runtime.remove_container(&handle).await {
        warn!(role, container = %handle, error = %e, "Failed to remove container");
    }

    let code = waited?;
    if code != 0 {
        return Err(StageError::ContainerExited {
            role: role.to_string(),
            code,
        });
    }
    Ok(())
}

/// Short random suffix for container names.
pub(crate) fn name_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Runs blocking filesystem work off the async runtime.
pub(crate) async fn blocking<T, F>(work: F) -> Result<T, StageError>
where
    F: FnOnce() -> Result<T, StageError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| StageError::Io(std::io::Error::other(e)))?
}
