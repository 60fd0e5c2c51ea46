use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::defs::PipelineError;
use crate::pipelines::stages::{InputKey, InputKind, StageDefinition};
use crate::utils::file::{is_plain_file_name, StorageLayout};

/// User-supplied values keyed by InputKey. File keys hold a name inside the uploads root;
/// integer keys hold the decimal text as entered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisParameters {
    values: BTreeMap<InputKey, String>,
}

/// A resolved positional argument, rendered to a path or number by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageArgument {
    InputFile { key: InputKey, file_name: String },
    Integer { key: InputKey, value: i64 },
}

impl AnalysisParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: InputKey, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: InputKey, value: impl Into<String>) {
        self.values.insert(key, value.into().trim().to_string());
    }

    pub fn get(&self, key: InputKey) -> Option<&str> {
        self.values.get(&key).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &InputKey> {
        self.values.keys()
    }

    /// Checks every input required by `stages`, in table order, stopping at the first problem.
    ///
    /// # Arguments
    ///
    /// * `stages` - The stage table the run will execute.
    /// * `storage` - Where uploaded files must already exist.
    ///
    /// # Returns
    /// Ok(()) or PipelineError::Validation naming the offending stage and key.
    pub fn validate(&self, stages: &[StageDefinition], storage: &StorageLayout) -> Result<(), PipelineError> {
        for stage in stages {
            for key in &stage.required_inputs {
                let raw = self.get(*key).filter(|v| !v.is_empty()).ok_or_else(|| {
                    PipelineError::Validation(format!("Missing {} (required by stage {})", key, stage.name))
                })?;
                match key.kind() {
                    InputKind::File => {
                        if !is_plain_file_name(raw) {
                            return Err(PipelineError::Validation(format!(
                                "{} must be a file name inside the uploads area, got '{}'",
                                key, raw
                            )));
                        }
                        let path = storage.input_path(raw);
                        if !path.is_file() {
                            return Err(PipelineError::Validation(format!(
                                "{} file not found: {}",
                                key,
                                path.display()
                            )));
                        }
                    }
                    InputKind::Integer => {
                        parse_integer(*key, raw)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn parse_integer(key: InputKey, raw: &str) -> Result<i64, PipelineError> {
    let value: i64 = raw
        .parse()
        .map_err(|_| PipelineError::Validation(format!("{} must be an integer, got '{}'", key, raw)))?;
    if let Some((min, max)) = key.range() {
        if value < min || value > max {
            return Err(PipelineError::Validation(format!(
                "{} must be between {} and {}, got {}",
                key, min, max, value
            )));
        }
    }
    Ok(value)
}

/// Maps a stage's required inputs to positional arguments. Pure: no filesystem access.
///
/// # Arguments
///
/// * `stage` - Stage whose inputs are resolved.
/// * `params` - Parameters of the current run.
///
/// # Returns
/// Arguments in `required_inputs` order.
pub fn resolve_stage_args(
    stage: &StageDefinition,
    params: &AnalysisParameters,
) -> Result<Vec<StageArgument>, PipelineError> {
    stage
        .required_inputs
        .iter()
        .map(|key| {
            let raw = params
                .get(*key)
                .ok_or_else(|| PipelineError::Validation(format!("Missing {} for stage {}", key, stage.name)))?;
            Ok(match key.kind() {
                InputKind::File => StageArgument::InputFile {
                    key: *key,
                    file_name: raw.to_string(),
                },
                InputKind::Integer => StageArgument::Integer {
                    key: *key,
                    value: parse_integer(*key, raw)?,
                },
            })
        })
        .collect()
}
