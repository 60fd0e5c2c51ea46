use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tempfile::TempDir;

use hapflow::config::defs::PipelineError;
use hapflow::pipelines::orchestrator::{AnalysisStatus, Orchestrator};
use hapflow::pipelines::params::AnalysisParameters;
use hapflow::utils::backend::LocalBackend;
use hapflow::utils::environment::Gatekeeper;
use hapflow::utils::file::StorageLayout;

/// Writes an executable shell script standing in for the container runtime.
fn fake_runtime(dir: &Path, body: &str) -> Result<PathBuf> {
    let path = dir.join("fake-runtime");
    fs::write(&path, format!("#!/bin/sh\n{}", body))?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

fn gatekeeper(runtime: &Path, image: &str) -> Gatekeeper {
    Gatekeeper::new(runtime.to_string_lossy().into_owned(), image)
}

#[tokio::test]
async fn test_missing_runtime_reports_not_installed() -> Result<()> {
    let gk = Gatekeeper::new("hapflow-no-such-runtime", "hapflow/pipeline:latest");
    let report = gk.full_environment_check().await;
    assert!(!report.installed);
    assert!(!report.live);
    assert!(!report.image_available);
    assert!(!report.is_ready());
    assert!(report.message.contains("not installed"), "{}", report.message);
    assert!(!gk.ensure_image_available("hapflow/pipeline:latest").await);
    Ok(())
}

#[tokio::test]
async fn test_installed_but_not_running() -> Result<()> {
    let dir = TempDir::new()?;
    let runtime = fake_runtime(
        dir.path(),
        "case \"$1\" in\n  --version) echo 'Fake 1.0'; exit 0 ;;\n  info) echo 'daemon down' >&2; exit 1 ;;\n  *) exit 0 ;;\nesac\n",
    )?;
    let report = gatekeeper(&runtime, "img").full_environment_check().await;
    assert!(report.installed);
    assert!(!report.live);
    assert!(!report.image_available);
    assert!(report.message.contains("not running"), "{}", report.message);
    Ok(())
}

#[tokio::test]
async fn test_missing_image_is_reported_last() -> Result<()> {
    let dir = TempDir::new()?;
    let runtime = fake_runtime(
        dir.path(),
        "if [ \"$1\" = image ]; then echo 'No such image' >&2; exit 1; fi\nexit 0\n",
    )?;
    let report = gatekeeper(&runtime, "hapflow/pipeline:latest").full_environment_check().await;
    assert!(report.installed);
    assert!(report.live);
    assert!(!report.image_available);
    assert!(report.message.contains("hapflow/pipeline:latest"), "{}", report.message);
    Ok(())
}

#[tokio::test]
async fn test_ready_environment() -> Result<()> {
    let gk = Gatekeeper::new("true", "anything");
    let report = gk.full_environment_check().await;
    assert!(report.is_ready());
    assert_eq!(report.message, "Execution environment ready");
    Ok(())
}

#[tokio::test]
async fn test_ensure_image_pulls_once_then_is_noop() -> Result<()> {
    let dir = TempDir::new()?;
    let marker = dir.path().join("pulled");
    let pull_log = dir.path().join("pulls.log");
    let runtime = fake_runtime(
        dir.path(),
        &format!(
            "case \"$1\" in\n  image) [ -f '{marker}' ] ;;\n  pull) echo \"$2\" >> '{log}'; touch '{marker}' ;;\n  *) exit 0 ;;\nesac\n",
            marker = marker.display(),
            log = pull_log.display()
        ),
    )?;
    let gk = gatekeeper(&runtime, "hapflow/pipeline:latest");

    assert!(!gk.is_required_image_available("hapflow/pipeline:latest").await);
    assert!(gk.ensure_image_available("hapflow/pipeline:latest").await);
    assert!(gk.ensure_image_available("hapflow/pipeline:latest").await);

    let pulls = fs::read_to_string(&pull_log)?;
    assert_eq!(pulls.lines().collect::<Vec<_>>(), vec!["hapflow/pipeline:latest"]);
    assert!(gk.full_environment_check().await.is_ready());
    Ok(())
}

#[tokio::test]
async fn test_failed_pull_reports_unavailable() -> Result<()> {
    let dir = TempDir::new()?;
    let runtime = fake_runtime(
        dir.path(),
        "case \"$1\" in\n  image) exit 1 ;;\n  pull) echo 'denied' >&2; exit 1 ;;\n  *) exit 0 ;;\nesac\n",
    )?;
    let started = Instant::now();
    assert!(!gatekeeper(&runtime, "img").ensure_image_available("img").await);
    assert!(started.elapsed() < Duration::from_secs(5));
    Ok(())
}

#[tokio::test]
async fn test_start_when_ready_rejects_unready_environment() -> Result<()> {
    let dir = TempDir::new()?;
    let storage = StorageLayout::new(dir.path().join("uploads"), dir.path().join("outputs"));
    storage.ensure()?;
    let orchestrator = Orchestrator::new(
        Vec::new(),
        storage,
        Arc::new(LocalBackend::new("sh", dir.path())),
    );
    let gk = Gatekeeper::new("hapflow-no-such-runtime", "img");

    match orchestrator.start_when_ready(AnalysisParameters::new(), &gk).await {
        Err(PipelineError::Environment(message)) => assert!(message.contains("not installed")),
        other => panic!("expected environment error, got {:?}", other),
    }
    assert_eq!(orchestrator.current_status(), AnalysisStatus::Idle);

    let ready = Gatekeeper::new("true", "img");
    let run_id = orchestrator.start_when_ready(AnalysisParameters::new(), &ready).await?;
    assert_eq!(run_id, 1);
    Ok(())
}
