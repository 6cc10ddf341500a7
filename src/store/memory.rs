//! In-memory project store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;

use super::{Project, ProjectStore};

/// Keeps projects in a map; nothing survives the process.
#[derive(Default)]
pub struct MemoryProjectStore {
    projects: RwLock<BTreeMap<String, Project>>,
}

impl MemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `projects`.
    pub fn with_projects(projects: impl IntoIterator<Item = Project>) -> Self {
        let map = projects.into_iter().map(|p| (p.id.clone(), p)).collect();
        Self {
            projects: RwLock::new(map),
        }
    }
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn retrieve_all(&self) -> Result<Vec<Project>, StoreError> {
        Ok(self.projects.read().await.values().cloned().collect())
    }

    async fn retrieve_by_id(&self, id: &str) -> Result<Project, StoreError> {
        self.projects
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::ProjectNotFound(id.to_string()))
    }

    async fn persist(&self, project: &Project) -> Result<(), StoreError> {
        self.projects
            .write()
            .await
            .insert(project.id.clone(), project.clone());
        Ok(())
    }
}
