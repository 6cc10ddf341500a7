//! File-backed project store.
//!
//! Projects are stored as pretty-printed JSON files in a directory, one file
//! per project named after its id.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::error::StoreError;

use super::{Project, ProjectStore};

/// Directory of `<project id>.json` files.
pub struct JsonProjectStore {
    base_path: PathBuf,
}

impl JsonProjectStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    async fn ensure_directory(&self) -> Result<(), StoreError> {
        if !self.base_path.exists() {
            fs::create_dir_all(&self.base_path).await.map_err(|e| {
                StoreError::DirectoryCreationFailed(format!(
                    "Failed to create directory {:?}: {}",
                    self.base_path, e
                ))
            })?;
        }
        Ok(())
    }

    fn project_path(&self, id: &str) -> PathBuf {
        self.base_path.join(format!("{id}.json"))
    }

    async fn load(&self, path: &Path) -> Result<Project, StoreError> {
        let contents = fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&contents)?)
    }
}

/// Project ids become file names; reject anything that could escape the directory.
fn validate_id(id: &str) -> Result<(), StoreError> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidData(format!("invalid project id '{id}'")))
    }
}

#[async_trait]
impl ProjectStore for JsonProjectStore {
    async fn retrieve_all(&self) -> Result<Vec<Project>, StoreError> {
        self.ensure_directory().await?;

        let mut projects = Vec::new();
        let mut entries = fs::read_dir(&self.base_path).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            match self.load(&path).await {
                Ok(project) => projects.push(project),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable project file"),
            }
        }

        projects.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(projects)
    }

    async fn retrieve_by_id(&self, id: &str) -> Result<Project, StoreError> {
        validate_id(id)?;
        let path = self.project_path(id);

        if !path.exists() {
            return Err(StoreError::ProjectNotFound(id.to_string()));
        }

        let project = self.load(&path).await?;
        if project.id != id {
            return Err(StoreError::InvalidData(format!(
                "Project ID mismatch: expected {}, got {}",
                id, project.id
            )));
        }

        Ok(project)
    }

    async fn persist(&self, project: &Project) -> Result<(), StoreError> {
        validate_id(&project.id)?;
        self.ensure_directory().await?;

        let json = serde_json::to_string_pretty(project)?;

        // Write to a sibling temp file, then rename over the record.
        let path = self.project_path(&project.id);
        let tmp = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        fs::rename(&tmp, &path).await?;

        Ok(())
    }
}
