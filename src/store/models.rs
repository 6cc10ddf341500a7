//! Project records and the artifacts hanging off them.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::runtime::ContainerHandle;

/// Training hyperparameters for a project.
///
/// `epochs` drives the status table; every other key is forwarded verbatim to
/// the training container through the hyperparameter file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub epochs: u32,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Hyperparameters {
    pub fn with_epochs(epochs: u32) -> Self {
        Self {
            epochs,
            extra: serde_json::Map::new(),
        }
    }
}

/// Live container handles cached on a project, keyed by role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerIds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train: Option<ContainerHandle>,
}

/// A saved training snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    /// Epoch at which the snapshot was written.
    pub step: u32,
    /// Checkpoint path prefix on the host.
    pub path: PathBuf,
    /// Set while an export reads from this checkpoint.
    #[serde(default)]
    pub in_use: bool,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(step: u32, path: impl Into<PathBuf>) -> Self {
        Self {
            id: step.to_string(),
            step,
            path: path.into(),
            in_use: false,
            created_at: Utc::now(),
        }
    }
}

/// A deployable model converted from a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Export {
    pub id: String,
    pub name: String,
    pub checkpoint_id: String,
    pub directory: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl Export {
    pub fn new(name: impl Into<String>, checkpoint_id: impl Into<String>, directory: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            checkpoint_id: checkpoint_id.into(),
            directory,
            created_at: Utc::now(),
        }
    }

    /// Directory the export container writes the converted model into.
    pub fn model_dir(&self) -> PathBuf {
        self.directory.join("model")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Video {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
}

impl Video {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            path: path.into(),
        }
    }
}

/// An evaluation run of an export against one input video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRun {
    pub id: String,
    pub name: String,
    pub project_id: String,
    pub export_id: String,
    pub video_id: String,
    #[serde(default)]
    pub output_video_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TestRun {
    pub fn new(
        name: impl Into<String>,
        project_id: impl Into<String>,
        export_id: impl Into<String>,
        video_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            project_id: project_id.into(),
            export_id: export_id.into(),
            video_id: video_id.into(),
            output_video_id: None,
            created_at: Utc::now(),
        }
    }
}

/// A training project as persisted by the project store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub hyperparameters: Hyperparameters,
    #[serde(default)]
    pub container_ids: ContainerIds,
    /// Dataset archive (`.tar.gz`) on the host.
    #[serde(default)]
    pub dataset: Option<PathBuf>,
    #[serde(default)]
    pub checkpoints: BTreeMap<String, Checkpoint>,
    #[serde(default)]
    pub exports: BTreeMap<String, Export>,
    #[serde(default)]
    pub videos: BTreeMap<String, Video>,
    #[serde(default)]
    pub tests: BTreeMap<String, TestRun>,
}

impl Project {
    pub fn new(id: impl Into<String>, name: impl Into<String>, epochs: u32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            hyperparameters: Hyperparameters::with_epochs(epochs),
            container_ids: ContainerIds::default(),
            dataset: None,
            checkpoints: BTreeMap::new(),
            exports: BTreeMap::new(),
            videos: BTreeMap::new(),
            tests: BTreeMap::new(),
        }
    }

    pub fn with_dataset(mut self, archive: impl Into<PathBuf>) -> Self {
        self.dataset = Some(archive.into());
        self
    }

    pub fn with_video(mut self, video: Video) -> Self {
        self.videos.insert(video.id.clone(), video);
        self
    }

    /// Finds the checkpoint written at `step`.
    pub fn checkpoint_at(&self, step: u32) -> Option<&Checkpoint> {
        self.checkpoints.values().find(|c| c.step == step)
    }

    /// Latest checkpoint step, if any checkpoint exists.
    pub fn latest_step(&self) -> Option<u32> {
        self.checkpoints.values().map(|c| c.step).max()
    }
}
