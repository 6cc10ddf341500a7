//! Service configuration.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then `TRAINFORGE_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::orchestrator::readiness::ReadinessState;

/// Largest accepted `/dev/shm` size (1 TiB).
pub const MAX_SHM_SIZE_MB: u64 = 1024 * 1024;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// The configuration file could not be parsed.
    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Images pulled at boot, in pull order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSet {
    pub dataset: String,
    pub metrics: String,
    pub train: String,
    pub export: String,
    pub test: String,
}

impl Default for ImageSet {
    fn default() -> Self {
        Self {
            dataset: "trainforge/dataset:latest".to_string(),
            metrics: "trainforge/metrics:latest".to_string(),
            train: "trainforge/train:latest".to_string(),
            export: "trainforge/export:latest".to_string(),
            test: "trainforge/test:latest".to_string(),
        }
    }
}

impl ImageSet {
    /// Pairs each image with the readiness state entered before pulling it.
    pub fn pull_plan(&self) -> [(ReadinessState, &str); 5] {
        [
            (ReadinessState::PullDatasetImage, self.dataset.as_str()),
            (ReadinessState::PullMetricsImage, self.metrics.as_str()),
            (ReadinessState::PullTrainImage, self.train.as_str()),
            (ReadinessState::PullExportImage, self.export.as_str()),
            (ReadinessState::PullTestImage, self.test.as_str()),
        ]
    }
}

/// Configuration for the orchestration service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Root of the per-project working directories. Must be absolute because
    /// it is bind-mounted into containers.
    pub data_dir: PathBuf,
    /// Directory holding one JSON record per project.
    pub store_dir: PathBuf,
    /// Pipeline images.
    pub images: ImageSet,
    /// Give training and test containers access to every GPU.
    pub gpus: bool,
    /// Shared memory size for the training container, in MB.
    pub shm_size_mb: Option<u64>,
    /// Seconds between checkpoint polls of running projects.
    pub checkpoint_poll_secs: u64,
    /// Buffered status events per subscriber before the slowest one lags.
    pub status_channel_capacity: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/trainforge"),
            store_dir: PathBuf::from("/var/lib/trainforge/store"),
            images: ImageSet::default(),
            gpus: true,
            shm_size_mb: Some(2048),
            checkpoint_poll_secs: 30,
            status_channel_capacity: 256,
        }
    }
}

impl ServiceConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a YAML configuration file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Loads the optional file, then applies environment overrides and validates.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = config.with_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Creates configuration from environment variables on top of the defaults.
    ///
    /// # Environment Variables
    ///
    /// - `TRAINFORGE_DATA_DIR`: Project working directories (default: /var/lib/trainforge)
    /// - `TRAINFORGE_STORE_DIR`: Project records (default: /var/lib/trainforge/store)
    /// - `TRAINFORGE_DATASET_IMAGE`, `TRAINFORGE_METRICS_IMAGE`, `TRAINFORGE_TRAIN_IMAGE`,
    ///   `TRAINFORGE_EXPORT_IMAGE`, `TRAINFORGE_TEST_IMAGE`: Image references
    /// - `TRAINFORGE_GPUS`: Request GPUs for train/test containers (default: true)
    /// - `TRAINFORGE_SHM_SIZE_MB`: Shared memory for training, 0 disables (default: 2048)
    /// - `TRAINFORGE_CHECKPOINT_POLL_SECS`: Checkpoint poll interval (default: 30)
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::default().with_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies overrides from `lookup`, which maps a variable name to its value.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("TRAINFORGE_DATA_DIR") {
            self.data_dir = PathBuf::from(val);
        }
        if let Some(val) = lookup("TRAINFORGE_STORE_DIR") {
            self.store_dir = PathBuf::from(val);
        }

        let images = [
            ("TRAINFORGE_DATASET_IMAGE", &mut self.images.dataset),
            ("TRAINFORGE_METRICS_IMAGE", &mut self.images.metrics),
            ("TRAINFORGE_TRAIN_IMAGE", &mut self.images.train),
            ("TRAINFORGE_EXPORT_IMAGE", &mut self.images.export),
            ("TRAINFORGE_TEST_IMAGE", &mut self.images.test),
        ];
        for (key, slot) in images {
            if let Some(val) = lookup(key) {
                *slot = val;
            }
        }

        if let Some(val) = lookup("TRAINFORGE_GPUS") {
            self.gpus = parse_env_bool(&val, "TRAINFORGE_GPUS")?;
        }
        if let Some(val) = lookup("TRAINFORGE_SHM_SIZE_MB") {
            let mb: u64 = parse_env_value(&val, "TRAINFORGE_SHM_SIZE_MB")?;
            self.shm_size_mb = (mb > 0).then_some(mb);
        }
        if let Some(val) = lookup("TRAINFORGE_CHECKPOINT_POLL_SECS") {
            self.checkpoint_poll_secs = parse_env_value(&val, "TRAINFORGE_CHECKPOINT_POLL_SECS")?;
        }

        Ok(self)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.data_dir.is_absolute() {
            return Err(ConfigError::ValidationFailed(format!(
                "data_dir must be an absolute path (got {})",
                self.data_dir.display()
            )));
        }

        for (state, image) in self.images.pull_plan() {
            if image.trim().is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "image for {state} must not be empty"
                )));
            }
        }

        if let Some(mb) = self.shm_size_mb.filter(|mb| *mb > MAX_SHM_SIZE_MB) {
            return Err(ConfigError::ValidationFailed(format!(
                "shm_size_mb must be at most {MAX_SHM_SIZE_MB} (got {mb})"
            )));
        }

        if self.checkpoint_poll_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "checkpoint_poll_secs must be greater than 0".to_string(),
            ));
        }

        if self.status_channel_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "status_channel_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn checkpoint_poll_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_poll_secs)
    }
}

/// Parses an environment variable value into the target type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Parses a boolean environment variable value.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean, got '{}'", value),
        }),
    }
}
