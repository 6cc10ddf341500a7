//! Host directory layout shared by the stage executors.

use std::path::{Path, PathBuf};

/// Resolves per-project directories under the service data directory.
#[derive(Debug, Clone)]
pub struct StageLayout {
    root: PathBuf,
}

impl StageLayout {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: data_dir.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.root.join("projects").join(project_id)
    }

    pub fn train_dir(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join("train")
    }

    pub fn hyperparameters_file(&self, project_id: &str) -> PathBuf {
        self.train_dir(project_id).join("hyperparameters.json")
    }

    pub fn dataset_dir(&self, project_id: &str) -> PathBuf {
        self.train_dir(project_id).join("dataset")
    }

    pub fn staged_archive(&self, project_id: &str) -> PathBuf {
        self.dataset_dir(project_id).join("dataset.tar.gz")
    }

    pub fn checkpoints_dir(&self, project_id: &str) -> PathBuf {
        self.train_dir(project_id).join("checkpoints")
    }

    pub fn logs_dir(&self, project_id: &str) -> PathBuf {
        self.train_dir(project_id).join("logs")
    }

    pub fn export_dir(&self, project_id: &str, export_id: &str) -> PathBuf {
        self.project_dir(project_id).join("exports").join(export_id)
    }

    pub fn test_dir(&self, project_id: &str, test_id: &str) -> PathBuf {
        self.project_dir(project_id).join("tests").join(test_id)
    }
}
