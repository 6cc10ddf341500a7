//! End-to-end tests of the orchestration service against an in-process
//! container runtime.
//!
//! The fake runtime keeps training containers running until a test finishes
//! or kills them, plays the export and test images by writing their expected
//! output files into the bind-mounted directories, and tracks which
//! containers were removed.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::TempDir;
use tokio::sync::watch;

use trainforge::config::ServiceConfig;
use trainforge::error::{OrchestratorError, RuntimeError, StageError};
use trainforge::orchestrator::poller::poll_once;
use trainforge::orchestrator::{CheckpointPoller, Orchestrator, ReadinessState, TrainingStatus};
use trainforge::runtime::{ContainerHandle, ContainerRuntime, ContainerSpec};
use trainforge::stages::StageLayout;
use trainforge::store::{MemoryProjectStore, Project, ProjectStore, Video};

const KILLED_EXIT_CODE: i64 = 137;

// ============================================================================
// Fake runtime
// ============================================================================

struct FakeRuntime {
    daemon_up: bool,
    failing_image: Option<String>,
    export_exit_code: i64,
    pulls: Mutex<Vec<String>>,
    launched: Mutex<Vec<ContainerSpec>>,
    exits: Mutex<HashMap<String, watch::Sender<Option<i64>>>>,
    killed: Mutex<Vec<String>>,
    paused: Mutex<HashSet<String>>,
    removed: Mutex<HashSet<String>>,
}

impl FakeRuntime {
    fn new() -> Self {
        Self {
            daemon_up: true,
            failing_image: None,
            export_exit_code: 0,
            pulls: Mutex::new(Vec::new()),
            launched: Mutex::new(Vec::new()),
            exits: Mutex::new(HashMap::new()),
            killed: Mutex::new(Vec::new()),
            paused: Mutex::new(HashSet::new()),
            removed: Mutex::new(HashSet::new()),
        }
    }

    fn unreachable() -> Self {
        Self {
            daemon_up: false,
            ..Self::new()
        }
    }

    fn with_failing_pull(mut self, image: &str) -> Self {
        self.failing_image = Some(image.to_string());
        self
    }

    fn with_export_exit_code(mut self, code: i64) -> Self {
        self.export_exit_code = code;
        self
    }

    fn pulls(&self) -> Vec<String> {
        self.pulls.lock().unwrap().clone()
    }

    fn killed(&self) -> Vec<String> {
        self.killed.lock().unwrap().clone()
    }

    fn launch_count(&self) -> usize {
        self.launched.lock().unwrap().len()
    }

    /// Launched containers that were never removed, in launch order.
    fn leftover_containers(&self) -> Vec<String> {
        let removed = self.removed.lock().unwrap();
        self.launched
            .lock()
            .unwrap()
            .iter()
            .map(|spec| spec.name.clone())
            .filter(|name| !removed.contains(name))
            .collect()
    }

    /// Fails with `ContainerNotFound` unless the container exists and was
    /// not removed.
    fn ensure_exists(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        let known = self.exits.lock().unwrap().contains_key(handle.as_str());
        let removed = self.removed.lock().unwrap().contains(handle.as_str());
        if known && !removed {
            Ok(())
        } else {
            Err(RuntimeError::ContainerNotFound {
                id: handle.to_string(),
            })
        }
    }

    fn is_paused(&self, handle: &ContainerHandle) -> bool {
        self.paused.lock().unwrap().contains(handle.as_str())
    }

    /// Most recently launched training container.
    fn train_handle(&self) -> Option<ContainerHandle> {
        self.launched
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|spec| spec.name.starts_with("trainforge-train-"))
            .map(|spec| ContainerHandle::new(spec.name.clone()))
    }

    /// Lets a running container exit with `code`.
    fn finish(&self, handle: &ContainerHandle, code: i64) {
        let exits = self.exits.lock().unwrap();
        let exit = exits.get(handle.as_str()).expect("container exists");
        exit.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(code);
            true
        });
    }

    fn host_path(spec: &ContainerSpec, target: &str) -> Option<PathBuf> {
        spec.binds.iter().find_map(|bind| {
            let mut parts = bind.split(':');
            let host = parts.next()?;
            (parts.next()? == target).then(|| PathBuf::from(host))
        })
    }

    /// Plays the role of the short-lived images and returns their exit code.
    fn simulate(&self, spec: &ContainerSpec) -> Option<i64> {
        if spec.name.starts_with("trainforge-export-") {
            if self.export_exit_code == 0 {
                let dir = Self::host_path(spec, "/export").expect("export mount");
                std::fs::create_dir_all(dir.join("model")).unwrap();
                std::fs::write(dir.join("model/saved_model.pb"), b"graph").unwrap();
            }
            return Some(self.export_exit_code);
        }
        if spec.name.starts_with("trainforge-test-") {
            let dir = Self::host_path(spec, "/test").expect("test mount");
            std::fs::create_dir_all(dir.join("output")).unwrap();
            std::fs::write(dir.join("output/labeled.mp4"), b"labeled").unwrap();
            return Some(0);
        }
        None
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn test_daemon(&self) -> bool {
        self.daemon_up
    }

    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        self.pulls.lock().unwrap().push(image.to_string());
        if self.failing_image.as_deref() == Some(image) {
            return Err(RuntimeError::PullFailed {
                image: image.to_string(),
                reason: "manifest unknown".to_string(),
            });
        }
        Ok(())
    }

    async fn launch(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        let exit = self.simulate(spec);
        let (tx, _) = watch::channel(exit);
        self.exits.lock().unwrap().insert(spec.name.clone(), tx);
        self.launched.lock().unwrap().push(spec.clone());
        Ok(ContainerHandle::new(spec.name.clone()))
    }

    async fn wait(&self, handle: &ContainerHandle) -> Result<i64, RuntimeError> {
        let mut rx = self
            .exits
            .lock()
            .unwrap()
            .get(handle.as_str())
            .ok_or_else(|| RuntimeError::ContainerNotFound {
                id: handle.to_string(),
            })?
            .subscribe();

        let code = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|e| RuntimeError::RunFailed(e.to_string()))?;
        Ok((*code).unwrap_or_default())
    }

    async fn kill_container(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.ensure_exists(handle)?;
        self.killed.lock().unwrap().push(handle.to_string());
        self.finish(handle, KILLED_EXIT_CODE);
        Ok(())
    }

    async fn pause_container(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.paused.lock().unwrap().insert(handle.to_string());
        Ok(())
    }

    async fn resume_container(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.paused.lock().unwrap().remove(handle.as_str());
        Ok(())
    }

    async fn remove_container(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.ensure_exists(handle)?;
        // Force removal stops a container that is still running.
        self.finish(handle, KILLED_EXIT_CODE);
        self.removed.lock().unwrap().insert(handle.to_string());
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    _dir: TempDir,
    config: ServiceConfig,
    layout: StageLayout,
    runtime: Arc<FakeRuntime>,
    store: Arc<MemoryProjectStore>,
    orchestrator: Arc<Orchestrator>,
    video_id: String,
}

fn write_dataset(path: &Path) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let file = std::fs::File::create(path).unwrap();
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

    let contents = b"frame-0001.png 12 40 88 120 mouse\n";
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "labels/frame-0001.txt", &contents[..])
        .unwrap();
    builder.into_inner().unwrap().finish().unwrap();
}

impl Harness {
    /// `mice` (50 epochs, with dataset and one video) and `rats` (10 epochs,
    /// no dataset).
    fn new(runtime: FakeRuntime) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = ServiceConfig {
            data_dir: dir.path().join("data"),
            store_dir: dir.path().join("store"),
            gpus: false,
            shm_size_mb: None,
            ..ServiceConfig::default()
        };

        let archive = dir.path().join("datasets/mice.tar.gz");
        write_dataset(&archive);
        let video_path = dir.path().join("videos/cage-3.mp4");
        std::fs::create_dir_all(video_path.parent().unwrap()).unwrap();
        std::fs::write(&video_path, b"raw video").unwrap();
        let video = Video::new("cage 3", &video_path);
        let video_id = video.id.clone();

        let store = Arc::new(MemoryProjectStore::with_projects([
            Project::new("mice", "Mouse pose", 50)
                .with_dataset(&archive)
                .with_video(video),
            Project::new("rats", "Rat pose", 10),
        ]));
        let runtime = Arc::new(runtime);
        let orchestrator = Arc::new(Orchestrator::containerized(
            runtime.clone(),
            store.clone(),
            &config,
        ));

        Self {
            layout: StageLayout::new(&config.data_dir),
            _dir: dir,
            config,
            runtime,
            store,
            orchestrator,
            video_id,
        }
    }

    async fn booted() -> Self {
        Self::booted_with(FakeRuntime::new()).await
    }

    async fn booted_with(runtime: FakeRuntime) -> Self {
        let harness = Self::new(runtime);
        harness.orchestrator.boot().await.expect("boot succeeds");
        harness
    }

    async fn project(&self, id: &str) -> Project {
        self.store.retrieve_by_id(id).await.expect("project exists")
    }

    async fn status(&self, id: &str) -> trainforge::orchestrator::StatusRecord {
        self.orchestrator.get_status(id).await.expect("status exists")
    }

    fn spawn_start(&self, id: &str) -> tokio::task::JoinHandle<Result<(), OrchestratorError>> {
        let orchestrator = self.orchestrator.clone();
        let id = id.to_string();
        tokio::spawn(async move { orchestrator.start(&id).await })
    }

    async fn wait_for_status(&self, id: &str, status: TrainingStatus) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if matches!(self.orchestrator.get_status(id).await, Ok(r) if r.training_status == status)
                {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{id} never reached {status}"));
    }

    /// Writes the files the train image produces for a completed epoch.
    fn write_checkpoint(&self, id: &str, epoch: u32) {
        let dir = self.layout.checkpoints_dir(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("ckpt-{epoch}.data-00000-of-00001")), b"weights").unwrap();
        std::fs::write(dir.join(format!("ckpt-{epoch}.index")), b"index").unwrap();
    }

    /// Runs `mice` to completion, writing a checkpoint for each epoch in `epochs`.
    async fn train_mice(&self, epochs: &[u32]) {
        let run = self.spawn_start("mice");
        self.wait_for_status("mice", TrainingStatus::Training).await;
        for epoch in epochs {
            self.write_checkpoint("mice", *epoch);
        }
        let handle = self.runtime.train_handle().expect("train container launched");
        self.runtime.finish(&handle, 0);
        run.await.expect("join").expect("training succeeds");
    }
}

// ============================================================================
// Readiness
// ============================================================================

#[tokio::test]
async fn test_boot_pulls_every_image_in_order() {
    let harness = Harness::booted().await;

    assert_eq!(harness.orchestrator.readiness(), ReadinessState::Ready);
    assert_eq!(
        harness.orchestrator.readiness_history(),
        vec![
            ReadinessState::ScanningRuntime,
            ReadinessState::ScanningProjects,
            ReadinessState::PullDatasetImage,
            ReadinessState::PullMetricsImage,
            ReadinessState::PullTrainImage,
            ReadinessState::PullExportImage,
            ReadinessState::PullTestImage,
            ReadinessState::Ready,
        ]
    );

    let images = &harness.config.images;
    assert_eq!(
        harness.runtime.pulls(),
        vec![
            images.dataset.clone(),
            images.metrics.clone(),
            images.train.clone(),
            images.export.clone(),
            images.test.clone(),
        ]
    );
}

#[tokio::test]
async fn test_boot_without_runtime_stops_at_no_runtime() {
    let harness = Harness::new(FakeRuntime::unreachable());

    let result = harness.orchestrator.boot().await;
    assert!(matches!(result, Err(OrchestratorError::RuntimeUnavailable)));
    assert_eq!(harness.orchestrator.readiness(), ReadinessState::NoRuntime);
    assert_eq!(
        harness.orchestrator.readiness_history(),
        vec![ReadinessState::ScanningRuntime, ReadinessState::NoRuntime]
    );
    assert!(harness.runtime.pulls().is_empty());
    assert_eq!(
        harness.orchestrator.wait_until_settled().await,
        ReadinessState::NoRuntime
    );

    let start = harness.orchestrator.start("mice").await;
    assert!(matches!(start, Err(OrchestratorError::RuntimeUnavailable)));
}

#[tokio::test]
async fn test_pull_failure_leaves_readiness_at_pull_state() {
    let train_image = ServiceConfig::default().images.train;
    let harness = Harness::new(FakeRuntime::new().with_failing_pull(&train_image));

    let result = harness.orchestrator.boot().await;
    assert!(matches!(
        result,
        Err(OrchestratorError::Runtime(RuntimeError::PullFailed { .. }))
    ));
    assert_eq!(harness.orchestrator.readiness(), ReadinessState::PullTrainImage);
    assert_eq!(harness.runtime.pulls().len(), 3);

    let export = harness.orchestrator.export("mice", 10, "early").await;
    assert!(matches!(
        export,
        Err(OrchestratorError::NotReady(ReadinessState::PullTrainImage))
    ));
}

#[tokio::test]
async fn test_boot_runs_once() {
    let harness = Harness::booted().await;
    let again = harness.orchestrator.boot().await;
    assert!(matches!(
        again,
        Err(OrchestratorError::InvalidReadinessTransition {
            from: ReadinessState::Ready,
            ..
        })
    ));
    assert_eq!(harness.runtime.pulls().len(), 5);
}

#[tokio::test]
async fn test_boot_seeds_status_records() {
    let harness = Harness::booted().await;

    let mice = harness.status("mice").await;
    assert_eq!(mice.training_status, TrainingStatus::NotTraining);
    assert_eq!(mice.current_epoch, 0);
    assert_eq!(mice.last_epoch, 50);
    assert_eq!(harness.status("rats").await.last_epoch, 10);

    assert!(!harness.orchestrator.add_status("mice", 999).await);
    assert_eq!(harness.status("mice").await.last_epoch, 50);

    let missing = harness.orchestrator.get_status("hamsters").await;
    assert!(matches!(
        missing,
        Err(OrchestratorError::NotFound { kind: "Project", .. })
    ));
}

// ============================================================================
// Training pipeline
// ============================================================================

#[tokio::test]
async fn test_full_training_run() {
    let harness = Harness::booted().await;
    let mut events = harness.orchestrator.subscribe_status();

    let run = harness.spawn_start("mice");
    harness.wait_for_status("mice", TrainingStatus::Training).await;

    let handle = harness.runtime.train_handle().expect("train container launched");
    assert_eq!(
        harness.project("mice").await.container_ids.train,
        Some(handle.clone())
    );
    assert!(harness.layout.hyperparameters_file("mice").exists());
    assert!(harness
        .layout
        .dataset_dir("mice")
        .join("labels/frame-0001.txt")
        .exists());

    harness.write_checkpoint("mice", 10);
    let latest = harness
        .orchestrator
        .update_checkpoints("mice")
        .await
        .expect("poll checkpoints");
    assert_eq!(latest, Some(10));
    assert_eq!(harness.status("mice").await.current_epoch, 10);

    let before = harness.project("mice").await;
    let again = harness
        .orchestrator
        .update_checkpoints("mice")
        .await
        .expect("poll checkpoints again");
    assert_eq!(again, Some(10));
    assert_eq!(harness.project("mice").await, before);
    assert_eq!(harness.status("mice").await.current_epoch, 10);

    harness.write_checkpoint("mice", 50);
    harness.runtime.finish(&handle, 0);
    run.await.expect("join").expect("training succeeds");

    let status = harness.status("mice").await;
    assert_eq!(status.training_status, TrainingStatus::NotTraining);
    assert_eq!(status.current_epoch, 50);
    assert_eq!(status.last_epoch, 50);

    let project = harness.project("mice").await;
    assert!(project.container_ids.train.is_none());
    assert!(harness.runtime.leftover_containers().is_empty());
    let steps: Vec<u32> = project.checkpoints.values().map(|c| c.step).collect();
    assert_eq!(steps.len(), 2);
    assert!(steps.contains(&10) && steps.contains(&50));

    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.project_id == "mice" && statuses.last() != Some(&event.record.training_status) {
            statuses.push(event.record.training_status);
        }
    }
    assert_eq!(
        statuses,
        vec![
            TrainingStatus::Preparing,
            TrainingStatus::Training,
            TrainingStatus::NotTraining,
        ]
    );
}

#[tokio::test]
async fn test_second_start_is_rejected_while_running() {
    let harness = Harness::booted().await;
    let run = harness.spawn_start("mice");
    harness.wait_for_status("mice", TrainingStatus::Training).await;

    let second = harness.orchestrator.start("mice").await;
    assert!(matches!(second, Err(OrchestratorError::AlreadyRunning(ref id)) if id == "mice"));
    assert_eq!(
        harness.status("mice").await.training_status,
        TrainingStatus::Training
    );

    harness.orchestrator.halt("mice").await.expect("halt");
    assert!(run.await.expect("join").is_err());
}

#[tokio::test]
async fn test_failed_preparation_is_recovered_by_next_start() {
    let harness = Harness::booted().await;

    let first = harness.orchestrator.start("rats").await;
    assert!(matches!(
        first,
        Err(OrchestratorError::Stage {
            step: "stage_dataset",
            source: StageError::MissingDataset(_),
        })
    ));
    assert_eq!(
        harness.status("rats").await.training_status,
        TrainingStatus::Preparing
    );
    assert!(matches!(
        harness.orchestrator.halt("rats").await,
        Err(OrchestratorError::NoTrainJob(_))
    ));

    let archive = harness.project("mice").await.dataset.expect("mice dataset");
    let rats = harness.project("rats").await.with_dataset(archive);
    harness.store.persist(&rats).await.expect("persist");

    let run = harness.spawn_start("rats");
    harness.wait_for_status("rats", TrainingStatus::Training).await;
    let handle = harness.runtime.train_handle().expect("train container launched");
    harness.runtime.finish(&handle, 0);
    run.await.expect("join").expect("second run succeeds");

    assert_eq!(
        harness.status("rats").await.training_status,
        TrainingStatus::NotTraining
    );
}

#[tokio::test]
async fn test_crashed_training_container_surfaces_failure() {
    let harness = Harness::booted().await;
    let run = harness.spawn_start("mice");
    harness.wait_for_status("mice", TrainingStatus::Training).await;

    let handle = harness.runtime.train_handle().expect("train container launched");
    harness.runtime.finish(&handle, 1);

    let result = run.await.expect("join");
    assert!(matches!(
        result,
        Err(OrchestratorError::Stage {
            step: "train_model",
            source: StageError::ContainerExited { code: 1, .. },
        })
    ));

    // The handle stays cached so the run can be cleaned up with halt.
    assert_eq!(
        harness.status("mice").await.training_status,
        TrainingStatus::Training
    );
    assert_eq!(harness.runtime.leftover_containers(), vec![handle.to_string()]);

    let restart = harness.orchestrator.start("mice").await;
    assert!(matches!(restart, Err(OrchestratorError::StaleTrainJob { .. })));

    harness.orchestrator.halt("mice").await.expect("halt cleans up");
    assert!(harness.project("mice").await.container_ids.train.is_none());
    assert!(harness.runtime.leftover_containers().is_empty());
}

// ============================================================================
// Live container control
// ============================================================================

#[tokio::test]
async fn test_controls_without_a_training_job() {
    let harness = Harness::booted().await;

    let halt = harness.orchestrator.halt("mice").await;
    assert!(matches!(halt, Err(OrchestratorError::NoTrainJob(ref id)) if id == "mice"));
    assert_eq!(
        halt.unwrap_err().to_string(),
        "No trainjob found for project 'mice'"
    );

    let pause = harness.orchestrator.pause_training("mice").await;
    assert!(matches!(pause, Err(OrchestratorError::NoTrainJob(_))));

    let resume = harness.orchestrator.resume_training("mice").await;
    assert!(matches!(resume, Err(OrchestratorError::NotPaused(_))));

    assert_eq!(
        harness.status("mice").await.training_status,
        TrainingStatus::NotTraining
    );
    assert!(harness.runtime.killed().is_empty());
}

#[tokio::test]
async fn test_pause_and_resume() {
    let harness = Harness::booted().await;
    let run = harness.spawn_start("mice");
    harness.wait_for_status("mice", TrainingStatus::Training).await;
    let handle = harness.runtime.train_handle().expect("train container launched");

    harness.orchestrator.pause_training("mice").await.expect("pause");
    assert!(harness.runtime.is_paused(&handle));
    assert_eq!(
        harness.status("mice").await.training_status,
        TrainingStatus::Paused
    );

    let twice = harness.orchestrator.pause_training("mice").await;
    assert!(matches!(twice, Err(OrchestratorError::AlreadyPaused(_))));
    assert_eq!(
        harness.status("mice").await.training_status,
        TrainingStatus::Paused
    );

    harness.orchestrator.resume_training("mice").await.expect("resume");
    assert!(!harness.runtime.is_paused(&handle));
    assert_eq!(
        harness.status("mice").await.training_status,
        TrainingStatus::Training
    );

    let again = harness.orchestrator.resume_training("mice").await;
    assert!(matches!(again, Err(OrchestratorError::NotPaused(_))));

    harness.runtime.finish(&handle, 0);
    run.await.expect("join").expect("training succeeds");
}

#[tokio::test]
async fn test_halt_kills_and_clears_handle() {
    let harness = Harness::booted().await;
    let run = harness.spawn_start("mice");
    harness.wait_for_status("mice", TrainingStatus::Training).await;
    let handle = harness.runtime.train_handle().expect("train container launched");

    harness.orchestrator.halt("mice").await.expect("halt");

    assert_eq!(harness.runtime.killed(), vec![handle.to_string()]);
    assert!(harness.runtime.leftover_containers().is_empty());
    assert_eq!(
        harness.status("mice").await.training_status,
        TrainingStatus::NotTraining
    );
    assert!(harness.project("mice").await.container_ids.train.is_none());

    let result = run.await.expect("join");
    assert!(matches!(
        result,
        Err(OrchestratorError::Stage {
            step: "train_model",
            source: StageError::ContainerExited {
                code: KILLED_EXIT_CODE,
                ..
            },
        })
    ));
    assert_eq!(
        harness.status("mice").await.training_status,
        TrainingStatus::NotTraining
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_halt_and_resume_stay_consistent() {
    let harness = Harness::booted().await;

    for _ in 0..5 {
        let run = harness.spawn_start("mice");
        harness.wait_for_status("mice", TrainingStatus::Training).await;
        harness.orchestrator.pause_training("mice").await.expect("pause");

        let halt = {
            let orchestrator = harness.orchestrator.clone();
            tokio::spawn(async move { orchestrator.halt("mice").await })
        };
        let resume = {
            let orchestrator = harness.orchestrator.clone();
            tokio::spawn(async move { orchestrator.resume_training("mice").await })
        };

        halt.await.expect("join").expect("halt succeeds");
        let resumed = resume.await.expect("join");
        assert!(matches!(resumed, Ok(()) | Err(OrchestratorError::NotPaused(_))));

        assert_eq!(
            harness.status("mice").await.training_status,
            TrainingStatus::NotTraining
        );
        assert!(harness.project("mice").await.container_ids.train.is_none());
        assert!(run.await.expect("join").is_err());
    }
}

#[tokio::test]
async fn test_restart_keeps_earlier_container_reachable() {
    let harness = Harness::booted().await;
    let run = harness.spawn_start("mice");
    harness.wait_for_status("mice", TrainingStatus::Training).await;
    let handle = harness.runtime.train_handle().expect("train container launched");

    // A second service on the same store and runtime, as after a restart.
    let restarted = Arc::new(Orchestrator::containerized(
        harness.runtime.clone(),
        harness.store.clone(),
        &harness.config,
    ));
    restarted.boot().await.expect("boot succeeds");
    assert_eq!(
        restarted.get_status("mice").await.expect("status").training_status,
        TrainingStatus::NotTraining
    );
    assert_eq!(
        harness.project("mice").await.container_ids.train,
        Some(handle.clone())
    );

    let pause = restarted.pause_training("mice").await;
    assert!(matches!(
        pause,
        Err(OrchestratorError::StaleTrainJob { ref container, .. }) if *container == handle.to_string()
    ));

    let launched = harness.runtime.launch_count();
    let start = restarted.start("mice").await;
    assert!(matches!(start, Err(OrchestratorError::StaleTrainJob { .. })));
    assert_eq!(harness.runtime.launch_count(), launched);
    assert_eq!(
        harness.project("mice").await.container_ids.train,
        Some(handle.clone())
    );

    restarted.halt("mice").await.expect("halt reaches the earlier container");
    assert_eq!(harness.runtime.killed(), vec![handle.to_string()]);
    assert!(harness.project("mice").await.container_ids.train.is_none());
    assert!(harness.runtime.leftover_containers().is_empty());
    assert!(run.await.expect("join").is_err());

    let rerun = {
        let restarted = restarted.clone();
        tokio::spawn(async move { restarted.start("mice").await })
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.runtime.launch_count() == launched {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("restarted service launches a new container");
    let fresh = harness.runtime.train_handle().expect("new train container");
    assert_ne!(fresh, handle);
    harness.runtime.finish(&fresh, 0);
    rerun.await.expect("join").expect("training succeeds after halt");
}

// ============================================================================
// Checkpoint polling
// ============================================================================

#[tokio::test]
async fn test_poller_advances_epoch_while_training() {
    let harness = Harness::booted().await;
    let run = harness.spawn_start("mice");
    harness.wait_for_status("mice", TrainingStatus::Training).await;

    harness.write_checkpoint("mice", 5);
    assert_eq!(poll_once(&harness.orchestrator).await, 1);
    assert_eq!(harness.status("mice").await.current_epoch, 5);

    let poller = CheckpointPoller::start(harness.orchestrator.clone(), Duration::from_millis(10));
    harness.write_checkpoint("mice", 20);
    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.status("mice").await.current_epoch < 20 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("poller picks up the new checkpoint");
    poller.stop().await;

    harness.orchestrator.halt("mice").await.expect("halt");
    let _ = run.await;
    assert_eq!(poll_once(&harness.orchestrator).await, 0);
}

// ============================================================================
// Export and test pipelines
// ============================================================================

#[tokio::test]
async fn test_export_and_test_pipelines() {
    let harness = Harness::booted().await;
    harness.train_mice(&[25, 50]).await;

    let export = harness
        .orchestrator
        .export("mice", 50, "release")
        .await
        .expect("export succeeds");
    assert_eq!(export.checkpoint_id, "50");
    assert!(export.model_dir().join("saved_model.pb").exists());
    assert!(export.directory.join("export_params.json").exists());

    let project = harness.project("mice").await;
    assert!(project.exports.contains_key(&export.id));
    assert!(project.checkpoints.values().all(|c| !c.in_use));

    let test = harness
        .orchestrator
        .test("night shift", "mice", &export.id, &harness.video_id)
        .await
        .expect("test succeeds");

    let project = harness.project("mice").await;
    let output_id = test.output_video_id.clone().expect("output video recorded");
    let output = project.videos.get(&output_id).expect("output video stored");
    assert!(output.path.ends_with("labeled.mp4"));
    assert_eq!(project.tests.get(&test.id), Some(&test));

    let tests = harness.orchestrator.get_tests("mice").await.expect("tests");
    assert_eq!(tests.len(), 1);
    let exports = harness.orchestrator.get_exports("mice").await.expect("exports");
    assert_eq!(exports.len(), 1);
    let checkpoints = harness
        .orchestrator
        .get_checkpoints("mice")
        .await
        .expect("checkpoints");
    assert_eq!(
        checkpoints.iter().map(|c| c.step).collect::<Vec<_>>(),
        vec![25, 50]
    );
    assert_eq!(
        harness.orchestrator.get_videos("mice").await.expect("videos").len(),
        2
    );
    assert_eq!(harness.runtime.launch_count(), 3);
    assert!(harness.runtime.leftover_containers().is_empty());
}

#[tokio::test]
async fn test_export_rejections() {
    let harness = Harness::booted().await;
    harness.train_mice(&[50]).await;

    let missing = harness.orchestrator.export("mice", 7, "nope").await;
    assert!(matches!(
        missing,
        Err(OrchestratorError::NotFound { kind: "Checkpoint", .. })
    ));

    let mut project = harness.project("mice").await;
    project
        .checkpoints
        .get_mut("50")
        .expect("checkpoint 50")
        .in_use = true;
    harness.store.persist(&project).await.expect("persist");

    let busy = harness.orchestrator.export("mice", 50, "busy").await;
    assert!(matches!(busy, Err(OrchestratorError::CheckpointInUse { .. })));
}

#[tokio::test]
async fn test_failed_export_releases_checkpoint() {
    let harness = Harness::booted_with(FakeRuntime::new().with_export_exit_code(2)).await;
    harness.train_mice(&[50]).await;

    let result = harness.orchestrator.export("mice", 50, "broken").await;
    assert!(matches!(
        result,
        Err(OrchestratorError::Stage {
            step: "run_container",
            source: StageError::ContainerExited { code: 2, .. },
        })
    ));

    let project = harness.project("mice").await;
    assert!(project.exports.is_empty());
    assert!(!project.checkpoints["50"].in_use);
    assert!(harness.runtime.leftover_containers().is_empty());
}

#[tokio::test]
async fn test_test_pipeline_requires_known_inputs() {
    let harness = Harness::booted().await;
    harness.train_mice(&[50]).await;
    let export = harness
        .orchestrator
        .export("mice", 50, "release")
        .await
        .expect("export succeeds");

    let unknown_video = harness
        .orchestrator
        .test("smoke", "mice", &export.id, "no-such-video")
        .await;
    assert!(matches!(
        unknown_video,
        Err(OrchestratorError::NotFound { kind: "Video", .. })
    ));

    let unknown_export = harness
        .orchestrator
        .test("smoke", "mice", "no-such-export", &harness.video_id)
        .await;
    assert!(matches!(
        unknown_export,
        Err(OrchestratorError::NotFound { kind: "Export", .. })
    ));
    assert!(harness.project("mice").await.tests.is_empty());
}

#[tokio::test]
async fn test_pipelines_wait_for_boot() {
    let harness = Harness::new(FakeRuntime::new());

    let start = harness.orchestrator.start("mice").await;
    assert!(matches!(
        start,
        Err(OrchestratorError::NotReady(ReadinessState::ScanningRuntime))
    ));
    assert!(harness.runtime.train_handle().is_none());
}
