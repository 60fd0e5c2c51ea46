use clap::{Parser, ValueEnum};

use crate::config::defs::{DEFAULT_COPY_NUMBER, DEFAULT_IDENTITY, DEFAULT_IMAGE, DEFAULT_MIN_LENGTH, DOCKER_TAG, PYTHON_TAG};

#[derive(Debug, Clone, ValueEnum, Default, PartialEq)]
pub enum Backend {
    #[default]
    Container,
    Local,
}

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "hapflow", version, about = "Haplotype pipeline orchestrator")]
pub struct Arguments {

    #[arg(short, long, default_value = "run", help = "One of: run, check_env, pull_image, collate, stages")]
    pub module: String,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(short = 'i', long = "r1", help = "Forward reads file name inside the uploads directory")]
    pub r1: Option<String>,

    #[arg(short = 'I', long = "r2", help = "Reverse reads file name inside the uploads directory")]
    pub r2: Option<String>,

    #[arg(short = 'b', long = "barcode", help = "Barcode CSV file name inside the uploads directory")]
    pub barcode: Option<String>,

    #[arg(short = 'r', long = "reference", help = "Reference sequence file name inside the uploads directory")]
    pub reference: Option<String>,

    #[arg(long, default_value_t = DEFAULT_MIN_LENGTH)]
    pub min_length: i64,

    #[arg(long, default_value_t = DEFAULT_IDENTITY)]
    pub identity: i64,

    #[arg(long, default_value_t = DEFAULT_COPY_NUMBER)]
    pub copy_number: i64,

    #[arg(short = 'u', long = "uploads", default_value = "data/uploads")]
    pub uploads_dir: String,

    #[arg(short = 'o', long = "out", default_value = "data/outputs")]
    pub out_dir: String,

    #[arg(long, default_value = "container", value_enum)]
    pub backend: Backend,

    #[arg(long, default_value = DOCKER_TAG, help = "Container runtime binary")]
    pub runtime: String,

    #[arg(long, default_value = DEFAULT_IMAGE)]
    pub image: String,

    #[arg(long, default_value = "python_scripts", help = "Stage script directory for the local backend")]
    pub scripts_dir: String,

    #[arg(long, default_value = PYTHON_TAG, help = "Interpreter for the local backend")]
    pub interpreter: String,

    #[arg(long, default_value_t = 3, help = "Seconds between the graceful and forceful stop signals")]
    pub grace_secs: u64,

    #[arg(long, default_value_t = false, help = "Skip the container environment check before running")]
    pub skip_env_check: bool,
}
