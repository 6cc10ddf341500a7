//! Container-backed training stage.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use tokio::fs;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::ServiceConfig;
use crate::error::StageError;
use crate::runtime::{ContainerHandle, ContainerRuntime, ContainerSpec};
use crate::store::{Checkpoint, Project};

use super::{blocking, name_suffix, StageLayout, Trainer};

/// Runs training inside the configured train image.
pub struct ContainerTrainer {
    runtime: Arc<dyn ContainerRuntime>,
    layout: StageLayout,
    image: String,
    gpus: bool,
    shm_size_mb: Option<u64>,
}

impl ContainerTrainer {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, layout: StageLayout, config: &ServiceConfig) -> Self {
        Self {
            runtime,
            layout,
            image: config.images.train.clone(),
            gpus: config.gpus,
            shm_size_mb: config.shm_size_mb,
        }
    }

    fn container_spec(&self, project: &Project) -> ContainerSpec {
        let train_dir = self.layout.train_dir(&project.id);
        let spec = ContainerSpec::new(
            format!("trainforge-train-{}-{}", project.id, name_suffix()),
            &self.image,
        )
        .with_bind(format!("{}:/train", train_dir.display()))
        .with_env("EPOCHS", project.hyperparameters.epochs)
        .with_env("HYPERPARAMETERS_FILE", "/train/hyperparameters.json")
        .with_env("DATASET_DIR", "/train/dataset")
        .with_env("CHECKPOINT_DIR", "/train/checkpoints")
        .with_gpus(self.gpus);

        match self.shm_size_mb {
            Some(mb) => spec.with_shm_size_mb(mb),
            None => spec,
        }
    }

    async fn scan(&self, project_id: &str) -> Result<BTreeMap<u32, PathBuf>, StageError> {
        let dir = self.layout.checkpoints_dir(project_id);
        blocking(move || scan_checkpoints(&dir)).await
    }
}

/// Parses the epoch out of a checkpoint index file name (`ckpt-<epoch>.index`).
///
/// The index file is written last, so its presence marks a completed checkpoint.
fn checkpoint_step(file_name: &str) -> Option<u32> {
    file_name
        .strip_prefix("ckpt-")?
        .strip_suffix(".index")?
        .parse()
        .ok()
}

/// Returns completed checkpoints in `dir` keyed by epoch, mapped to their path prefix.
fn scan_checkpoints(dir: &Path) -> Result<BTreeMap<u32, PathBuf>, StageError> {
    let mut found = BTreeMap::new();
    if !dir.exists() {
        return Ok(found);
    }

    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| StageError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(step) = entry.file_name().to_str().and_then(checkpoint_step) else {
            continue;
        };
        found.insert(step, dir.join(format!("ckpt-{step}")));
    }

    Ok(found)
}

/// Deletes every file belonging to the given checkpoint epochs.
fn remove_checkpoint_files(dir: &Path, steps: &[u32]) -> Result<usize, StageError> {
    let prefixes: Vec<String> = steps.iter().map(|s| format!("ckpt-{s}.")).collect();
    let mut removed = 0;

    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| StageError::Io(e.into()))?;
        let name = entry.file_name().to_string_lossy();
        if entry.file_type().is_file() && prefixes.iter().any(|p| name.starts_with(p)) {
            std::fs::remove_file(entry.path())?;
            removed += 1;
        }
    }

    Ok(removed)
}

/// Brings `project.checkpoints` in line with what is on disk.
///
/// Checkpoints marked in use survive even when their files are gone.
fn reconcile(project: &mut Project, found: &BTreeMap<u32, PathBuf>) {
    project
        .checkpoints
        .retain(|_, c| c.in_use || found.contains_key(&c.step));

    for (step, path) in found {
        if project.checkpoint_at(*step).is_none() {
            let checkpoint = Checkpoint::new(*step, path.clone());
            project.checkpoints.insert(checkpoint.id.clone(), checkpoint);
        }
    }
}

fn extract_archive(archive: &Path, dest: &Path) -> Result<(), StageError> {
    let file = std::fs::File::open(archive)?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    tar.unpack(dest)
        .map_err(|e| StageError::Archive(format!("{}: {e}", archive.display())))
}

#[async_trait]
impl Trainer for ContainerTrainer {
    async fn write_hyperparameters(&self, project: &Project) -> Result<(), StageError> {
        fs::create_dir_all(self.layout.train_dir(&project.id)).await?;
        let json = serde_json::to_string_pretty(&project.hyperparameters)?;
        fs::write(self.layout.hyperparameters_file(&project.id), json).await?;
        Ok(())
    }

    async fn clear_stale_run(&self, project: &mut Project) -> Result<(), StageError> {
        let found = self.scan(&project.id).await?;
        reconcile(project, &found);

        let referenced: HashSet<&str> = project
            .exports
            .values()
            .map(|e| e.checkpoint_id.as_str())
            .collect();
        let keep: HashSet<u32> = project
            .checkpoints
            .values()
            .filter(|c| c.in_use || referenced.contains(c.id.as_str()))
            .map(|c| c.step)
            .collect();
        let stale: Vec<u32> = found.keys().filter(|s| !keep.contains(s)).copied().collect();

        let dir = self.layout.checkpoints_dir(&project.id);
        let steps = stale.clone();
        let removed = blocking(move || {
            if dir.exists() {
                remove_checkpoint_files(&dir, &steps)
            } else {
                Ok(0)
            }
        })
        .await?;
        project.checkpoints.retain(|_, c| keep.contains(&c.step));

        for dir in [
            self.layout.logs_dir(&project.id),
            self.layout.dataset_dir(&project.id),
        ] {
            if dir.exists() {
                fs::remove_dir_all(&dir).await?;
            }
        }

        info!(
            project_id = %project.id,
            stale_checkpoints = stale.len(),
            files_removed = removed,
            kept = keep.len(),
            "Cleared previous run data"
        );
        Ok(())
    }

    async fn stage_dataset(&self, project: &Project) -> Result<(), StageError> {
        let source = project
            .dataset
            .as_ref()
            .ok_or_else(|| StageError::MissingDataset(project.id.clone()))?;

        fs::create_dir_all(self.layout.dataset_dir(&project.id)).await?;
        let bytes = fs::copy(source, self.layout.staged_archive(&project.id)).await?;
        debug!(project_id = %project.id, bytes, "Dataset archive staged");
        Ok(())
    }

    async fn extract_dataset(&self, project: &Project) -> Result<(), StageError> {
        let archive = self.layout.staged_archive(&project.id);
        let dest = self.layout.dataset_dir(&project.id);
        blocking(move || extract_archive(&archive, &dest)).await
    }

    async fn launch_training(&self, project: &Project) -> Result<ContainerHandle, StageError> {
        fs::create_dir_all(self.layout.checkpoints_dir(&project.id)).await?;
        let spec = self.container_spec(project);
        Ok(self.runtime.launch(&spec).await?)
    }

    async fn await_training(
        &self,
        project: &Project,
        handle: &ContainerHandle,
    ) -> Result<(), StageError> {
        let code = self.runtime.wait(handle).await?;
        if code != 0 {
            return Err(StageError::ContainerExited {
                role: "train".to_string(),
                code,
            });
        }
        info!(project_id = %project.id, container = %handle, "Training container finished");
        Ok(())
    }

    async fn update_checkpoints(&self, project: &mut Project) -> Result<Option<u32>, StageError> {
        let found = self.scan(&project.id).await?;
        reconcile(project, &found);
        Ok(project.latest_step())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;
    use crate::store::Export;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::TempDir;

    struct IdleRuntime;

    #[async_trait]
    impl ContainerRuntime for IdleRuntime {
        async fn test_daemon(&self) -> bool {
            true
        }
        async fn pull(&self, _image: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn launch(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
            Ok(ContainerHandle::new(spec.name.clone()))
        }
        async fn wait(&self, _handle: &ContainerHandle) -> Result<i64, RuntimeError> {
            Ok(0)
        }
        async fn kill_container(&self, _handle: &ContainerHandle) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn pause_container(&self, _handle: &ContainerHandle) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn resume_container(&self, _handle: &ContainerHandle) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn remove_container(&self, _handle: &ContainerHandle) -> Result<(), RuntimeError> {
            Ok(())
        }
    }

    fn trainer(dir: &TempDir) -> (ContainerTrainer, StageLayout) {
        let config = ServiceConfig {
            data_dir: dir.path().to_path_buf(),
            ..ServiceConfig::default()
        };
        let layout = StageLayout::new(&config.data_dir);
        (
            ContainerTrainer::new(Arc::new(IdleRuntime), layout.clone(), &config),
            layout,
        )
    }

    fn write_checkpoint(layout: &StageLayout, project_id: &str, step: u32) {
        let dir = layout.checkpoints_dir(project_id);
        std::fs::create_dir_all(&dir).expect("create checkpoint dir");
        std::fs::write(dir.join(format!("ckpt-{step}.data-00000-of-00001")), b"w").expect("write");
        std::fs::write(dir.join(format!("ckpt-{step}.index")), b"i").expect("write");
    }

    fn build_archive(path: &Path) {
        let file = std::fs::File::create(path).expect("create archive");
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        let data = b"frame,x,y\n1,10,20\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "labels/points.csv", &data[..])
            .expect("append");
        builder
            .into_inner()
            .expect("finish tar")
            .finish()
            .expect("finish gzip");
    }

    #[test]
    fn test_checkpoint_step_parsing() {
        assert_eq!(checkpoint_step("ckpt-12.index"), Some(12));
        assert_eq!(checkpoint_step("ckpt-12.data-00000-of-00001"), None);
        assert_eq!(checkpoint_step("ckpt-x.index"), None);
        assert_eq!(checkpoint_step("checkpoint"), None);
    }

    #[tokio::test]
    async fn test_write_hyperparameters() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (trainer, layout) = trainer(&dir);
        let mut project = Project::new("p1", "mice", 50);
        project
            .hyperparameters
            .extra
            .insert("batch_size".to_string(), serde_json::json!(4));

        trainer
            .write_hyperparameters(&project)
            .await
            .expect("write hyperparameters");

        let written = std::fs::read_to_string(layout.hyperparameters_file("p1")).expect("read");
        let value: serde_json::Value = serde_json::from_str(&written).expect("json");
        assert_eq!(value["epochs"], 50);
        assert_eq!(value["batch_size"], 4);
    }

    #[tokio::test]
    async fn test_stage_and_extract_dataset() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (trainer, layout) = trainer(&dir);
        let archive = dir.path().join("upload.tar.gz");
        build_archive(&archive);
        let project = Project::new("p1", "mice", 5).with_dataset(&archive);

        trainer.stage_dataset(&project).await.expect("stage");
        trainer.extract_dataset(&project).await.expect("extract");

        let extracted = layout.dataset_dir("p1").join("labels/points.csv");
        assert!(extracted.exists());
    }

    #[tokio::test]
    async fn test_stage_dataset_requires_archive() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (trainer, _) = trainer(&dir);
        let project = Project::new("p1", "mice", 5);

        let result = trainer.stage_dataset(&project).await;
        assert!(matches!(result, Err(StageError::MissingDataset(_))));
    }

    #[tokio::test]
    async fn test_update_checkpoints_is_idempotent() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (trainer, layout) = trainer(&dir);
        let mut project = Project::new("p1", "mice", 50);

        assert_eq!(trainer.update_checkpoints(&mut project).await.expect("scan"), None);

        write_checkpoint(&layout, "p1", 5);
        write_checkpoint(&layout, "p1", 10);
        let first = trainer.update_checkpoints(&mut project).await.expect("scan");
        let snapshot = project.checkpoints.clone();
        let second = trainer.update_checkpoints(&mut project).await.expect("scan");

        assert_eq!(first, Some(10));
        assert_eq!(second, Some(10));
        assert_eq!(project.checkpoints, snapshot);
        assert_eq!(project.checkpoints.len(), 2);
    }

    #[tokio::test]
    async fn test_clear_stale_run_keeps_exported_checkpoints() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (trainer, layout) = trainer(&dir);
        write_checkpoint(&layout, "p1", 1);
        write_checkpoint(&layout, "p1", 10);
        std::fs::create_dir_all(layout.logs_dir("p1")).expect("logs dir");

        let mut project = Project::new("p1", "mice", 50);
        trainer.update_checkpoints(&mut project).await.expect("scan");
        let export = Export::new("v1", "10", layout.export_dir("p1", "e1"));
        project.exports.insert(export.id.clone(), export);

        trainer.clear_stale_run(&mut project).await.expect("clear");

        assert!(project.checkpoint_at(1).is_none());
        assert!(project.checkpoint_at(10).is_some());
        let ckpt_dir = layout.checkpoints_dir("p1");
        assert!(!ckpt_dir.join("ckpt-1.index").exists());
        assert!(ckpt_dir.join("ckpt-10.index").exists());
        assert!(!layout.logs_dir("p1").exists());
    }

    #[tokio::test]
    async fn test_launch_uses_train_mount() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (trainer, layout) = trainer(&dir);
        let project = Project::new("p1", "mice", 7);

        let spec = trainer.container_spec(&project);
        assert!(spec.name.starts_with("trainforge-train-p1-"));
        assert!(spec.env.contains(&"EPOCHS=7".to_string()));
        assert_eq!(
            spec.binds,
            vec![format!("{}:/train", layout.train_dir("p1").display())]
        );

        let handle = trainer.launch_training(&project).await.expect("launch");
        trainer
            .await_training(&project, &handle)
            .await
            .expect("await");
        assert!(layout.checkpoints_dir("p1").exists());
    }
}
