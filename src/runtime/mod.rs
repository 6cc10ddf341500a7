//! Container runtime adapter.
//!
//! The orchestrator only needs a narrow control surface over the container
//! runtime: a liveness probe, image pulls, launching a container, waiting
//! for it and removing it afterwards, and the kill / pause / resume controls
//! used against live training jobs. [`ContainerRuntime`] captures that surface; [`DockerRuntime`] is the
//! bollard-backed implementation.

pub mod docker;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;

pub use docker::DockerRuntime;

/// Opaque reference to a container created by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerHandle(String);

impl ContainerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything needed to create and start a pipeline container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Environment variables in `KEY=value` form.
    pub env: Vec<String>,
    /// Bind mounts in `host:container[:mode]` form.
    pub binds: Vec<String>,
    /// Request every available GPU from the runtime.
    pub gpus: bool,
    /// Size of `/dev/shm` in megabytes.
    pub shm_size_mb: Option<u64>,
}

impl ContainerSpec {
    /// Creates a spec with the given name and image and no mounts.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            env: Vec::new(),
            binds: Vec::new(),
            gpus: false,
            shm_size_mb: None,
        }
    }

    /// Adds one environment variable.
    pub fn with_env(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.env.push(format!("{key}={value}"));
        self
    }

    /// Adds one bind mount.
    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.binds.push(bind.into());
        self
    }

    /// Requests GPU access.
    pub fn with_gpus(mut self, gpus: bool) -> Self {
        self.gpus = gpus;
        self
    }

    /// Sets the shared memory size.
    pub fn with_shm_size_mb(mut self, mb: u64) -> Self {
        self.shm_size_mb = Some(mb);
        self
    }
}

/// Narrow control interface over a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Liveness probe; `false` when the daemon cannot be reached.
    async fn test_daemon(&self) -> bool;

    /// Pulls an image. Succeeds immediately when the image is already present.
    async fn pull(&self, image: &str) -> Result<(), RuntimeError>;

    /// Creates and starts a container, returning its handle.
    async fn launch(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError>;

    /// Waits until the container stops and returns its exit code.
    ///
    /// A container killed out-of-band resolves with its (nonzero) exit code
    /// rather than hanging.
    async fn wait(&self, handle: &ContainerHandle) -> Result<i64, RuntimeError>;

    async fn kill_container(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;

    async fn pause_container(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;

    async fn resume_container(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;

    /// Force-removes a stopped or running container.
    ///
    /// Returns `ContainerNotFound` if the container no longer exists.
    async fn remove_container(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;
}
