// src/lib.rs
pub mod config;
pub mod utils;
pub mod pipelines;
pub mod cli;
pub use cli::{Arguments, Backend};
pub use pipelines::orchestrator::{AnalysisStatus, Orchestrator};
