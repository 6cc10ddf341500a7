//! Docker implementation of the container runtime adapter using bollard.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{DeviceRequest, HostConfig};
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::error::RuntimeError;

use super::{ContainerHandle, ContainerRuntime, ContainerSpec};

/// Container runtime backed by the local Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects to the local Docker daemon using the platform defaults.
    ///
    /// Connecting does not contact the daemon; use
    /// [`ContainerRuntime::test_daemon`] to probe liveness.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::DaemonUnavailable` if the connection settings are invalid.
    pub fn new() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::DaemonUnavailable(format!("Failed to connect: {e}")))?;

        Ok(Self { docker })
    }

    /// Checks if an image exists locally.
    pub async fn image_exists(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    fn host_config(spec: &ContainerSpec) -> HostConfig {
        let device_requests = spec.gpus.then(|| {
            vec![DeviceRequest {
                driver: Some("nvidia".to_string()),
                count: Some(-1),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }]
        });

        HostConfig {
            binds: if spec.binds.is_empty() {
                None
            } else {
                Some(spec.binds.clone())
            },
            device_requests,
            shm_size: spec.shm_size_mb.and_then(shm_bytes),
            ..Default::default()
        }
    }
}

/// Converts a `/dev/shm` size in megabytes to bytes, or `None` if it does not
/// fit the daemon's signed byte count.
fn shm_bytes(mb: u64) -> Option<i64> {
    mb.checked_mul(1024 * 1024)
        .and_then(|bytes| i64::try_from(bytes).ok())
}

/// Maps "already stopped" responses to success so kill stays idempotent.
fn is_not_running(err: &BollardError) -> bool {
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => *status_code == 409 && message.contains("is not running"),
        _ => false,
    }
}

fn is_missing(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn control_error(handle: &ContainerHandle, err: BollardError) -> RuntimeError {
    if is_missing(&err) {
        RuntimeError::ContainerNotFound {
            id: handle.to_string(),
        }
    } else {
        RuntimeError::ControlFailed {
            id: handle.to_string(),
            reason: err.to_string(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn test_daemon(&self) -> bool {
        match self.docker.ping().await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Docker daemon ping failed");
                false
            }
        }
    }

    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        if self.image_exists(image).await {
            debug!(image = %image, "Image already present, skipping pull");
            return Ok(());
        }

        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            result.map_err(|e| RuntimeError::PullFailed {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
        }

        Ok(())
    }

    async fn launch(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        let config = Config {
            image: Some(spec.image.clone()),
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            host_config: Some(Self::host_config(spec)),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| RuntimeError::RunFailed(format!("Failed to create container: {e}")))?;

        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RuntimeError::RunFailed(format!("Failed to start container: {e}")))?;

        info!(container = %response.id, name = %spec.name, image = %spec.image, "Container started");
        Ok(ContainerHandle::new(response.id))
    }

    async fn wait(&self, handle: &ContainerHandle) -> Result<i64, RuntimeError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.docker.wait_container(handle.as_str(), Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports nonzero exits as errors; they are ordinary results here
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) if is_missing(&e) => Err(RuntimeError::ContainerNotFound {
                id: handle.to_string(),
            }),
            Some(Err(e)) => Err(RuntimeError::RunFailed(format!(
                "Error waiting for container: {e}"
            ))),
            None => Err(RuntimeError::RunFailed(
                "Wait stream ended without an exit status".to_string(),
            )),
        }
    }

    async fn kill_container(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        let options = KillContainerOptions { signal: "SIGKILL" };

        match self
            .docker
            .kill_container(handle.as_str(), Some(options))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_running(&e) => {
                debug!(container = %handle, "Container already stopped");
                Ok(())
            }
            Err(e) => Err(control_error(handle, e)),
        }
    }

    async fn pause_container(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.docker
            .pause_container(handle.as_str())
            .await
            .map_err(|e| control_error(handle, e))
    }

    async fn resume_container(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.docker
            .unpause_container(handle.as_str())
            .await
            .map_err(|e| control_error(handle, e))
    }

    async fn remove_container(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        self.docker
            .remove_container(handle.as_str(), Some(options))
            .await
            .map_err(|e| control_error(handle, e))?;

        debug!(container = %handle, "Container removed");
        Ok(())
    }
}
