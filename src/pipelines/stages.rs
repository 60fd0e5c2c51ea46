// src/pipelines/stages.rs: the fixed stage table

use std::fmt;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::config::defs::{
    BLAST_SCRIPT, CLASSIFIER_SCRIPT, COPY_NUMBER_RANGE, IDENTITY_RANGE, LEN_FILTER_SCRIPT,
    LOC_HAP_TABLE_SCRIPT, MAFFT_SCRIPT, MIN_LENGTH_RANGE, PEAR_SCRIPT, RENAME_TRIM_SCRIPT,
    SEPARATE_SCRIPT, TAB_FORMATTER_SCRIPT, TRIM_GAPS_SCRIPT,
};

/// Every parameter the orchestrator knows how to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InputKey {
    ReadFile1,
    ReadFile2,
    BarcodeFile,
    ReferenceFile,
    MinLength,
    Identity,
    CopyNumber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    File,
    Integer,
}

impl InputKey {
    pub const ALL: [InputKey; 7] = [
        InputKey::ReadFile1,
        InputKey::ReadFile2,
        InputKey::BarcodeFile,
        InputKey::ReferenceFile,
        InputKey::MinLength,
        InputKey::Identity,
        InputKey::CopyNumber,
    ];

    pub fn kind(&self) -> InputKind {
        match self {
            InputKey::ReadFile1 | InputKey::ReadFile2 | InputKey::BarcodeFile | InputKey::ReferenceFile => {
                InputKind::File
            }
            InputKey::MinLength | InputKey::Identity | InputKey::CopyNumber => InputKind::Integer,
        }
    }

    /// Inclusive bounds for integer keys.
    pub fn range(&self) -> Option<(i64, i64)> {
        match self {
            InputKey::MinLength => Some(MIN_LENGTH_RANGE),
            InputKey::Identity => Some(IDENTITY_RANGE),
            InputKey::CopyNumber => Some(COPY_NUMBER_RANGE),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InputKey::ReadFile1 => "read-file-1",
            InputKey::ReadFile2 => "read-file-2",
            InputKey::BarcodeFile => "barcode-file",
            InputKey::ReferenceFile => "reference-file",
            InputKey::MinLength => "min-length",
            InputKey::Identity => "identity",
            InputKey::CopyNumber => "copy-number",
        }
    }
}

impl fmt::Display for InputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pipeline stage: the script it runs and the inputs it consumes, in argument order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageDefinition {
    pub name: String,
    pub script_ref: String,
    pub required_inputs: Vec<InputKey>,
    pub label: String,
}

impl StageDefinition {
    /// Builds a stage; repeated input keys keep their first position.
    pub fn new(name: &str, script_ref: &str, required_inputs: &[InputKey], label: &str) -> Self {
        let mut inputs: Vec<InputKey> = Vec::with_capacity(required_inputs.len());
        for key in required_inputs {
            if !inputs.contains(key) {
                inputs.push(*key);
            }
        }
        StageDefinition {
            name: name.to_string(),
            script_ref: script_ref.to_string(),
            required_inputs: inputs,
            label: label.to_string(),
        }
    }
}

lazy_static! {
    pub static ref DEFAULT_STAGES: Vec<StageDefinition> = vec![
        StageDefinition::new(
            "rename_trim",
            RENAME_TRIM_SCRIPT,
            &[InputKey::ReadFile1, InputKey::ReadFile2, InputKey::BarcodeFile],
            "Renaming and trimming reads",
        ),
        StageDefinition::new("assemble", PEAR_SCRIPT, &[], "Assembling paired reads (PEAR)"),
        StageDefinition::new("length_filter", LEN_FILTER_SCRIPT, &[InputKey::MinLength], "Filtering by length"),
        StageDefinition::new("blast", BLAST_SCRIPT, &[InputKey::ReferenceFile], "Running BLAST"),
        StageDefinition::new("classify_species", CLASSIFIER_SCRIPT, &[InputKey::Identity], "Assigning species"),
        StageDefinition::new("align", MAFFT_SCRIPT, &[], "Multiple sequence alignment (MAFFT)"),
        StageDefinition::new("tab_format", TAB_FORMATTER_SCRIPT, &[], "Formatting alignment"),
        StageDefinition::new("trim_gaps", TRIM_GAPS_SCRIPT, &[], "Trimming alignment gaps"),
        StageDefinition::new(
            "separate_haplotypes",
            SEPARATE_SCRIPT,
            &[InputKey::CopyNumber],
            "Separating haplotypes",
        ),
        StageDefinition::new(
            "loc_hap_table",
            LOC_HAP_TABLE_SCRIPT,
            &[InputKey::BarcodeFile],
            "Building location x haplotype table",
        ),
    ];
}

/// The default table, cloned for an orchestrator to own.
pub fn default_stages() -> Vec<StageDefinition> {
    DEFAULT_STAGES.clone()
}
