//! Project storage.
//!
//! The orchestrator only needs three operations from durable storage: list
//! every project at boot, fetch one authoritative record by id, and persist a
//! record back. Two implementations are provided:
//!
//! - [`JsonProjectStore`]: one JSON file per project under a directory
//! - [`MemoryProjectStore`]: an in-process map, for tests and dry runs

pub mod json_store;
pub mod memory;
pub mod models;

use async_trait::async_trait;

use crate::error::StoreError;

pub use json_store::JsonProjectStore;
pub use memory::MemoryProjectStore;
pub use models::{Checkpoint, ContainerIds, Export, Hyperparameters, Project, TestRun, Video};

/// Retrieves and persists project records.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Returns every stored project.
    async fn retrieve_all(&self) -> Result<Vec<Project>, StoreError>;

    /// Returns the project with the given id.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ProjectNotFound` if no such project exists.
    async fn retrieve_by_id(&self, id: &str) -> Result<Project, StoreError>;

    /// Inserts or replaces a project record.
    async fn persist(&self, project: &Project) -> Result<(), StoreError>;
}
