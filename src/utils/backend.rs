// src/utils/backend.rs: turning a stage into a concrete command

use std::path::{Path, PathBuf};

use crate::config::defs::{
    BackendKind, RunConfig, CONTAINER_OUTPUTS_DIR, CONTAINER_SCRIPTS_DIR, CONTAINER_UPLOADS_DIR, CONTAINER_WORK_DIR,
    PYTHON_TAG,
};
use crate::pipelines::params::StageArgument;
use crate::pipelines::stages::StageDefinition;
use crate::utils::command::CommandSpec;
use crate::utils::file::StorageLayout;

/// Builds the command that executes one stage. Implementations only describe the
/// command; spawning and streaming stay with the command runner.
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &str;

    fn command_for(&self, stage: &StageDefinition, args: &[StageArgument], storage: &StorageLayout) -> CommandSpec;
}

/// Runs stage scripts inside a container with the uploads and outputs roots mounted.
#[derive(Debug, Clone)]
pub struct ContainerBackend {
    pub runtime: String,
    pub image: String,
}

impl ContainerBackend {
    pub fn new(runtime: impl Into<String>, image: impl Into<String>) -> Self {
        ContainerBackend {
            runtime: runtime.into(),
            image: image.into(),
        }
    }
}

impl ExecutionBackend for ContainerBackend {
    fn name(&self) -> &str {
        &self.runtime
    }

    fn command_for(&self, stage: &StageDefinition, args: &[StageArgument], storage: &StorageLayout) -> CommandSpec {
        let uploads_mount = format!("{}:{}", storage.uploads_root.display(), CONTAINER_UPLOADS_DIR);
        let outputs_mount = format!("{}:{}", storage.outputs_root.display(), CONTAINER_OUTPUTS_DIR);
        let script = format!("{}/{}", CONTAINER_SCRIPTS_DIR, stage.script_ref);

        let mut spec = CommandSpec::new(self.runtime.clone(), storage.work_root())
            .args(["run", "--rm"])
            .args(["-v", uploads_mount.as_str()])
            .args(["-v", outputs_mount.as_str()])
            .args(["-w", CONTAINER_WORK_DIR])
            .arg(self.image.clone())
            .args([PYTHON_TAG, "-u"])
            .arg(script);
        for arg in args {
            spec = spec.arg(render_arg(arg, Path::new(CONTAINER_UPLOADS_DIR)));
        }
        spec
    }
}

/// Runs stage scripts directly with a local interpreter, working in the parent of the outputs root.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    pub interpreter: String,
    pub script_root: PathBuf,
}

impl LocalBackend {
    pub fn new(interpreter: impl Into<String>, script_root: impl Into<PathBuf>) -> Self {
        LocalBackend {
            interpreter: interpreter.into(),
            script_root: script_root.into(),
        }
    }
}

impl ExecutionBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    fn command_for(&self, stage: &StageDefinition, args: &[StageArgument], storage: &StorageLayout) -> CommandSpec {
        let script = self.script_root.join(&stage.script_ref);
        let mut spec = CommandSpec::new(self.interpreter.clone(), storage.work_root())
            .arg(script.to_string_lossy().into_owned())
            .env("PYTHONUNBUFFERED", "1");
        for arg in args {
            spec = spec.arg(render_arg(arg, &storage.uploads_root));
        }
        spec
    }
}

fn render_arg(arg: &StageArgument, uploads_root: &Path) -> String {
    match arg {
        StageArgument::InputFile { file_name, .. } => uploads_root.join(file_name).to_string_lossy().into_owned(),
        StageArgument::Integer { value, .. } => value.to_string(),
    }
}

/// Backend selected by the run configuration.
pub fn backend_from_config(config: &RunConfig) -> Box<dyn ExecutionBackend> {
    match config.backend {
        BackendKind::Container => Box::new(ContainerBackend::new(config.runtime.clone(), config.image.clone())),
        BackendKind::Local => Box::new(LocalBackend::new(config.interpreter.clone(), config.script_root.clone())),
    }
}
