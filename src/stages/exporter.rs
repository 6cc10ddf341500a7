//! Container-backed export stage: converts a checkpoint into a deployable model.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::fs;
use tracing::info;

use crate::error::StageError;
use crate::runtime::{ContainerRuntime, ContainerSpec};
use crate::store::{Checkpoint, Export, Hyperparameters, Project};

use super::{name_suffix, run_to_completion, Exporter, StageLayout};

const PARAMS_FILE: &str = "export_params.json";

/// Contents of `export_params.json`, as seen from inside the export container.
#[derive(Debug, Serialize)]
struct ExportParams<'a> {
    name: &'a str,
    checkpoint_step: u32,
    checkpoint_path: String,
    output_dir: &'static str,
    hyperparameters: &'a Hyperparameters,
}

pub struct ContainerExporter {
    runtime: Arc<dyn ContainerRuntime>,
    layout: StageLayout,
    image: String,
}

impl ContainerExporter {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, layout: StageLayout, image: String) -> Self {
        Self {
            runtime,
            layout,
            image,
        }
    }

    /// Maps a host checkpoint prefix to its location under the `/train` mount.
    fn container_checkpoint_path(&self, project_id: &str, checkpoint: &Checkpoint) -> String {
        let train_dir = self.layout.train_dir(project_id);
        match checkpoint.path.strip_prefix(&train_dir) {
            Ok(relative) => PathBuf::from("/train").join(relative).display().to_string(),
            Err(_) => format!("/train/checkpoints/ckpt-{}", checkpoint.step),
        }
    }
}

#[async_trait]
impl Exporter for ContainerExporter {
    async fn create_export(
        &self,
        project: &Project,
        checkpoint: &Checkpoint,
        name: &str,
    ) -> Result<Export, StageError> {
        let mut export = Export::new(name, checkpoint.id.clone(), PathBuf::new());
        export.directory = self.layout.export_dir(&project.id, &export.id);
        Ok(export)
    }

    async fn create_export_dir(&self, export: &Export) -> Result<(), StageError> {
        fs::create_dir_all(export.model_dir()).await?;
        Ok(())
    }

    async fn write_export_params(
        &self,
        project: &Project,
        checkpoint: &Checkpoint,
        export: &Export,
    ) -> Result<(), StageError> {
        let params = ExportParams {
            name: &export.name,
            checkpoint_step: checkpoint.step,
            checkpoint_path: self.container_checkpoint_path(&project.id, checkpoint),
            output_dir: "/export/model",
            hyperparameters: &project.hyperparameters,
        };
        let json = serde_json::to_string_pretty(&params)?;
        fs::write(export.directory.join(PARAMS_FILE), json).await?;
        Ok(())
    }

    async fn run_export(&self, project: &Project, export: &Export) -> Result<(), StageError> {
        let spec = ContainerSpec::new(
            format!("trainforge-export-{}-{}", project.id, name_suffix()),
            &self.image,
        )
        .with_bind(format!(
            "{}:/train:ro",
            self.layout.train_dir(&project.id).display()
        ))
        .with_bind(format!("{}:/export", export.directory.display()))
        .with_env("EXPORT_PARAMS_FILE", format!("/export/{PARAMS_FILE}"));

        run_to_completion(self.runtime.as_ref(), "export", &spec).await?;
        info!(project_id = %project.id, export_id = %export.id, "Export container finished");
        Ok(())
    }
}
