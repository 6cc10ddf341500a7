//! Container-backed test stage: runs an export against a video.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::fs;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::ServiceConfig;
use crate::error::StageError;
use crate::runtime::{ContainerRuntime, ContainerSpec};
use crate::store::{Export, Project, TestRun, Video};

use super::{blocking, name_suffix, run_to_completion, StageLayout, Tester};

const PARAMS_FILE: &str = "test_params.json";

#[derive(Debug, Serialize)]
struct TestParams<'a> {
    name: &'a str,
    model_dir: &'static str,
    input_video: String,
    output_dir: &'static str,
}

pub struct ContainerTester {
    runtime: Arc<dyn ContainerRuntime>,
    layout: StageLayout,
    image: String,
    gpus: bool,
}

impl ContainerTester {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, layout: StageLayout, config: &ServiceConfig) -> Self {
        Self {
            runtime,
            layout,
            image: config.images.test.clone(),
            gpus: config.gpus,
        }
    }

    fn test_dir(&self, test: &TestRun) -> PathBuf {
        self.layout.test_dir(&test.project_id, &test.id)
    }
}

fn video_file_name(video: &Video) -> String {
    video
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("{}.mp4", video.id))
}

/// Recursively copies `src` into `dest`.
fn copy_dir(src: &Path, dest: &Path) -> Result<u64, StageError> {
    let mut copied = 0;
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| StageError::Io(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| StageError::Io(std::io::Error::other(e)))?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            copied += std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(copied)
}

#[async_trait]
impl Tester for ContainerTester {
    async fn create_test(
        &self,
        name: &str,
        project_id: &str,
        export_id: &str,
        video_id: &str,
    ) -> Result<TestRun, StageError> {
        Ok(TestRun::new(name, project_id, export_id, video_id))
    }

    async fn mount_inputs(
        &self,
        project: &Project,
        test: &TestRun,
        export: &Export,
        video: &Video,
    ) -> Result<(), StageError> {
        let test_dir = self.test_dir(test);
        let model_src = export.model_dir();
        if !model_src.exists() {
            return Err(StageError::MissingOutput(format!(
                "export '{}' has no model at {}",
                export.id,
                model_src.display()
            )));
        }

        let model_dest = test_dir.join("model");
        let bytes = blocking(move || copy_dir(&model_src, &model_dest)).await?;

        let input_dir = test_dir.join("input");
        fs::create_dir_all(&input_dir).await?;
        fs::create_dir_all(test_dir.join("output")).await?;
        fs::copy(&video.path, input_dir.join(video_file_name(video))).await?;

        debug!(project_id = %project.id, test_id = %test.id, model_bytes = bytes, "Test inputs mounted");
        Ok(())
    }

    async fn write_test_params(
        &self,
        _project: &Project,
        test: &TestRun,
        video: &Video,
    ) -> Result<(), StageError> {
        let params = TestParams {
            name: &test.name,
            model_dir: "/test/model",
            input_video: format!("/test/input/{}", video_file_name(video)),
            output_dir: "/test/output",
        };
        let json = serde_json::to_string_pretty(&params)?;
        fs::write(self.test_dir(test).join(PARAMS_FILE), json).await?;
        Ok(())
    }

    async fn run_test(&self, project: &Project, test: &TestRun) -> Result<(), StageError> {
        let spec = ContainerSpec::new(
            format!("trainforge-test-{}-{}", project.id, name_suffix()),
            &self.image,
        )
        .with_bind(format!("{}:/test", self.test_dir(test).display()))
        .with_env("TEST_PARAMS_FILE", format!("/test/{PARAMS_FILE}"))
        .with_gpus(self.gpus);

        run_to_completion(self.runtime.as_ref(), "test", &spec).await?;
        info!(project_id = %project.id, test_id = %test.id, "Test container finished");
        Ok(())
    }

    async fn collect_output(&self, _project: &Project, test: &TestRun) -> Result<Video, StageError> {
        let output_dir = self.test_dir(test).join("output");
        let mut outputs = Vec::new();
        let mut entries = fs::read_dir(&output_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                outputs.push(entry.path());
            }
        }
        outputs.sort();

        let path = outputs.into_iter().next().ok_or_else(|| {
            StageError::MissingOutput(format!("no output video in {}", output_dir.display()))
        })?;
        Ok(Video::new(format!("{} (output)", test.name), path))
    }
}
