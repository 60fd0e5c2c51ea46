use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

// Execution environment
pub const DOCKER_TAG: &str = "docker";
pub const PYTHON_TAG: &str = "python3";
pub const KILL_TAG: &str = "kill";
pub const DEFAULT_IMAGE: &str = "hapflow/pipeline:latest";

// Container mount points. Stages run from CONTAINER_WORK_DIR and write `outputs/<category>`.
pub const CONTAINER_WORK_DIR: &str = "/app/data";
pub const CONTAINER_UPLOADS_DIR: &str = "/app/data/uploads";
pub const CONTAINER_OUTPUTS_DIR: &str = "/app/data/outputs";
pub const CONTAINER_SCRIPTS_DIR: &str = "/app/python_scripts";

// Pipeline scripts
pub const RENAME_TRIM_SCRIPT: &str = "integrated_pipeline.py";
pub const PEAR_SCRIPT: &str = "Step2/joinPear.py";
pub const LEN_FILTER_SCRIPT: &str = "Step2/lenFilter.py";
pub const BLAST_SCRIPT: &str = "Step3/joinBlast.py";
pub const CLASSIFIER_SCRIPT: &str = "Step3/speciesClassifier.py";
pub const MAFFT_SCRIPT: &str = "Step4/joinMAFFT.py";
pub const TAB_FORMATTER_SCRIPT: &str = "Step4/tabFormatter.py";
pub const TRIM_GAPS_SCRIPT: &str = "Step4/trim_gaps.py";
pub const SEPARATE_SCRIPT: &str = "Step5/separate_reads.py";
pub const LOC_HAP_TABLE_SCRIPT: &str = "Step6/get_loc_hap_table.py";

// Timing
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(3);
pub const SUBSCRIBER_CLOSE_DELAY: Duration = Duration::from_millis(500);

// Static Parameters
pub const MIN_LENGTH_RANGE: (i64, i64) = (1, 10_000);
pub const IDENTITY_RANGE: (i64, i64) = (0, 100);
pub const COPY_NUMBER_RANGE: (i64, i64) = (1, 1_000);
pub const DEFAULT_MIN_LENGTH: i64 = 200;
pub const DEFAULT_IDENTITY: i64 = 98;
pub const DEFAULT_COPY_NUMBER: i64 = 2;

pub const USER_STOP_MESSAGE: &str = "Analysis stopped by user";

/// Output directories written by the stages, in pipeline order.
pub const OUTPUT_CATEGORIES: &[&'static str] = &[
    "rename",
    "trim",
    "pear",
    "filter",
    "filter_del",
    "blast",
    "assign",
    "classifier",
    "mafft",
    "tab_formatter",
    "trimmed",
    "separated",
    "table",
];

/// Categories whose files follow `<sample>.<f|r>.<ext>`.
pub const PAIRED_CATEGORIES: &[&'static str] = &["trim"];

/// Categories holding one subdirectory per sample/species.
pub const NESTED_CATEGORIES: &[&'static str] = &["separated", "table"];

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid analysis parameters: {0}")]
    Validation(String),

    #[error("An analysis is already running")]
    Conflict,

    #[error("Execution environment not ready: {0}")]
    Environment(String),

    #[error("No running analysis")]
    NoRunningAnalysis,

    #[error("Analysis results are not ready")]
    NotReady,

    #[error("No analysis")]
    NoAnalysis,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Container,
    Local,
}

/// Run-wide settings assembled once in main.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub uploads_root: PathBuf,
    pub outputs_root: PathBuf,
    pub backend: BackendKind,
    pub runtime: String,
    pub image: String,
    pub script_root: PathBuf,
    pub interpreter: String,
    pub grace_period: Duration,
    pub close_delay: Duration,
}

impl RunConfig {
    pub fn new(uploads_root: PathBuf, outputs_root: PathBuf) -> Self {
        RunConfig {
            uploads_root,
            outputs_root,
            backend: BackendKind::Container,
            runtime: DOCKER_TAG.to_string(),
            image: DEFAULT_IMAGE.to_string(),
            script_root: PathBuf::from(CONTAINER_SCRIPTS_DIR),
            interpreter: PYTHON_TAG.to_string(),
            grace_period: STOP_GRACE_PERIOD,
            close_delay: SUBSCRIBER_CLOSE_DELAY,
        }
    }
}
