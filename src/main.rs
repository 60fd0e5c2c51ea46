use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use env_logger::Builder;
use log::{LevelFilter, debug, error, info, warn};

use hapflow::cli::{parse, Arguments, Backend};
use hapflow::config::defs::{BackendKind, PipelineError, RunConfig};
use hapflow::pipelines::barcode::detect_species;
use hapflow::pipelines::orchestrator::{AnalysisStatus, Orchestrator};
use hapflow::pipelines::params::AnalysisParameters;
use hapflow::pipelines::stages::{default_stages, InputKey};
use hapflow::utils::collate::collate;
use hapflow::utils::environment::Gatekeeper;
use hapflow::utils::file::StorageLayout;
use hapflow::utils::streams::EventType;


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    println!("\n-------------\n HapFlow\n-------------\n");

    let dir = env::current_dir()?;
    info!("The current directory is {:?}\n", dir);

    let run_config = build_run_config(&args, &dir);
    debug!("Run configuration: {:?}", run_config);

    let module = args.module.clone();
    if let Err(e) = match module.as_str() {
        "run" => analysis_run(&args, &run_config).await,
        "check_env" => check_env_run(&run_config).await,
        "pull_image" => pull_image_run(&run_config).await,
        "collate" => collate_run(&run_config),
        "stages" => stages_run(),
        _ => Err(PipelineError::InvalidConfig(format!("Invalid module: {}", module)).into()),
    } {
        error!("{} failed: {} at {} milliseconds.", module, e, run_start.elapsed().as_millis());
        std::process::exit(1);
    }

    println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}


/// Resolves CLI paths against the working directory and assembles the RunConfig.
///
/// # Arguments
/// * `args` - The parsed command-line arguments.
/// * `cwd` - The current working directory.
/// # Returns
/// RunConfig
fn build_run_config(args: &Arguments, cwd: &Path) -> RunConfig {
    let absolute = |p: &str| -> PathBuf {
        let path = PathBuf::from(p);
        if path.is_absolute() { path } else { cwd.join(path) }
    };

    let mut config = RunConfig::new(absolute(&args.uploads_dir), absolute(&args.out_dir));
    config.backend = match args.backend {
        Backend::Container => BackendKind::Container,
        Backend::Local => BackendKind::Local,
    };
    config.runtime = args.runtime.clone();
    config.image = args.image.clone();
    config.script_root = absolute(&args.scripts_dir);
    config.interpreter = args.interpreter.clone();
    config.grace_period = Duration::from_secs(args.grace_secs);
    config
}


fn analysis_params(args: &Arguments) -> AnalysisParameters {
    let mut params = AnalysisParameters::new()
        .with(InputKey::MinLength, args.min_length.to_string())
        .with(InputKey::Identity, args.identity.to_string())
        .with(InputKey::CopyNumber, args.copy_number.to_string());
    let files = [
        (InputKey::ReadFile1, &args.r1),
        (InputKey::ReadFile2, &args.r2),
        (InputKey::BarcodeFile, &args.barcode),
        (InputKey::ReferenceFile, &args.reference),
    ];
    for (key, value) in files {
        if let Some(value) = value {
            params.set(key, value.clone());
        }
    }
    params
}


async fn analysis_run(args: &Arguments, config: &RunConfig) -> Result<()> {
    let storage = StorageLayout::new(config.uploads_root.clone(), config.outputs_root.clone());
    storage.ensure()?;

    let params = analysis_params(args);
    if let Some(barcode) = params.get(InputKey::BarcodeFile) {
        match detect_species(&storage.input_path(barcode)) {
            Ok(species) => info!("Species in barcode sheet: {}", species.join(", ")),
            Err(e) => warn!("Could not read species from barcode sheet: {}", e),
        }
    }

    let orchestrator = Orchestrator::from_config(config, default_stages());
    let run_id = if config.backend == BackendKind::Container && !args.skip_env_check {
        let gatekeeper = Gatekeeper::new(config.runtime.clone(), config.image.clone());
        orchestrator.start_when_ready(params, &gatekeeper).await?
    } else {
        orchestrator.start(params)?
    };
    info!("Analysis {} accepted", run_id);

    let mut progress = orchestrator.subscribe_progress();
    let mut stop_requested = false;
    loop {
        tokio::select! {
            event = progress.recv() => match event {
                Some(event) => {
                    let step = event.step_name.as_deref().unwrap_or("pipeline");
                    match event.kind {
                        EventType::Error => warn!("[{}] {}", step, event.message),
                        _ => info!("[{}] {}", step, event.message),
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !stop_requested => {
                stop_requested = true;
                warn!("Interrupt received, stopping analysis");
                if let Ok(stop) = orchestrator.stop().await {
                    if let Some(teardown) = stop.teardown {
                        match teardown.await {
                            Ok(phase) => info!("Stage process teardown: {:?}", phase),
                            Err(e) => warn!("Teardown task failed: {}", e),
                        }
                    }
                }
            }
        }
    }

    let snapshot = orchestrator.status()?;
    println!("{}", serde_json::to_string_pretty(&snapshot.stage_results)?);
    match snapshot.status {
        AnalysisStatus::Completed => {
            let results = orchestrator.results()?;
            println!("{}", serde_json::to_string_pretty(&results)?);
            Ok(())
        }
        status => Err(anyhow!(
            "Analysis {:?}: {}",
            status,
            snapshot.error.unwrap_or_default()
        )),
    }
}


async fn check_env_run(config: &RunConfig) -> Result<()> {
    let gatekeeper = Gatekeeper::new(config.runtime.clone(), config.image.clone());
    let report = gatekeeper.full_environment_check().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.is_ready() {
        Ok(())
    } else {
        Err(PipelineError::Environment(report.message).into())
    }
}


async fn pull_image_run(config: &RunConfig) -> Result<()> {
    let gatekeeper = Gatekeeper::new(config.runtime.clone(), config.image.clone());
    if !gatekeeper.is_runtime_installed().await {
        return Err(anyhow!("{} is not installed", gatekeeper.runtime()));
    }
    if gatekeeper.ensure_image_available(gatekeeper.image()).await {
        info!("Image {} is available", gatekeeper.image());
        Ok(())
    } else {
        Err(anyhow!("Could not pull image {}", gatekeeper.image()))
    }
}


fn collate_run(config: &RunConfig) -> Result<()> {
    let storage = StorageLayout::new(config.uploads_root.clone(), config.outputs_root.clone());
    let result = collate(&storage);
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}


fn stages_run() -> Result<()> {
    for (index, stage) in default_stages().iter().enumerate() {
        let inputs: Vec<&str> = stage.required_inputs.iter().map(|k| k.as_str()).collect();
        println!("{:>2}. {:<20} {:<28} [{}]  {}", index + 1, stage.name, stage.script_ref, inputs.join(", "), stage.label);
    }
    Ok(())
}
