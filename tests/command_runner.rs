use std::fs;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use hapflow::utils::command::{self, capture, CommandSpec, ExitOutcome, TerminationPhase};

fn sh(script: &str, cwd: &TempDir) -> CommandSpec {
    CommandSpec::new("sh", cwd.path()).args(["-c", script])
}

#[tokio::test]
async fn test_success_collects_stdout_lines_in_order() -> Result<()> {
    let dir = TempDir::new()?;
    let mut seen = Vec::new();
    let outcome = command::run(
        &sh("echo one; echo two; printf three", &dir),
        |line| seen.push(line.to_string()),
        |_| {},
    )
    .await;

    assert_eq!(seen, vec!["one", "two", "three"]);
    assert_eq!(outcome, ExitOutcome::Success { stdout: "one\ntwo\nthree".to_string() });
    assert!(outcome.failure_message().is_none());
    Ok(())
}

#[tokio::test]
async fn test_nonzero_exit_carries_code_and_stderr() -> Result<()> {
    let dir = TempDir::new()?;
    let mut errors = Vec::new();
    let outcome = command::run(
        &sh("echo partial; echo 'bad input' >&2; exit 3", &dir),
        |_| {},
        |line| errors.push(line.to_string()),
    )
    .await;

    assert_eq!(errors, vec!["bad input"]);
    assert_eq!(outcome, ExitOutcome::NonZeroExit { code: 3, stderr: "bad input".to_string() });
    assert_eq!(outcome.failure_message().as_deref(), Some("bad input"));

    let silent = capture(&sh("exit 4", &dir)).await;
    assert_eq!(silent.failure_message().as_deref(), Some("exited with status 4"));
    Ok(())
}

#[tokio::test]
async fn test_missing_program_is_spawn_failure() -> Result<()> {
    let dir = TempDir::new()?;
    let outcome = capture(&CommandSpec::new("hapflow-no-such-tool", dir.path())).await;
    match outcome {
        ExitOutcome::SpawnFailed { reason } => assert!(reason.contains("hapflow-no-such-tool")),
        other => return Err(anyhow!("expected spawn failure, got {:?}", other)),
    }
    Ok(())
}

#[tokio::test]
async fn test_signal_death_is_reported() -> Result<()> {
    let dir = TempDir::new()?;
    let outcome = capture(&sh("kill -KILL $$", &dir)).await;
    assert_eq!(outcome, ExitOutcome::KilledBySignal { signal: 9 });
    assert!(!outcome.is_success());
    Ok(())
}

#[tokio::test]
async fn test_working_dir_and_env_are_applied() -> Result<()> {
    let dir = TempDir::new()?;
    let spec = sh("pwd; echo \"$HAPFLOW_TEST_VALUE\"", &dir).env("HAPFLOW_TEST_VALUE", "seen");
    let mut lines = Vec::new();
    let outcome = command::run(&spec, |line| lines.push(line.to_string()), |_| {}).await;
    assert!(outcome.is_success());
    assert_eq!(lines.len(), 2);
    assert!(lines[0].ends_with(&*dir.path().file_name().unwrap_or_default().to_string_lossy()));
    assert_eq!(lines[1], "seen");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lines_arrive_before_process_exits() -> Result<()> {
    let dir = TempDir::new()?;
    let started = Instant::now();
    let mut first_line_at = None;
    let outcome = command::run(
        &sh("echo early; sleep 1; echo late", &dir),
        |line| {
            if line == "early" {
                first_line_at = Some(started.elapsed());
            }
        },
        |_| {},
    )
    .await;
    let total = started.elapsed();

    assert!(outcome.is_success());
    let first = first_line_at.ok_or_else(|| anyhow!("first line never delivered"))?;
    eprintln!("first line after {:?}, exit after {:?}", first, total);
    assert!(first < Duration::from_millis(800));
    assert!(total >= Duration::from_secs(1));
    Ok(())
}

/// Spawns `script`, waits for its first stdout line, and returns the handle plus the waiter.
async fn spawn_until_ready(
    script: &str,
    dir: &TempDir,
) -> Result<(command::ProcessHandle, tokio::task::JoinHandle<ExitOutcome>)> {
    let running = command::spawn(&sh(script, dir)).map_err(|e| anyhow!(e))?;
    let handle = running.handle();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let waiter = tokio::spawn(async move {
        running
            .wait(move |line| { let _ = tx.send(line.to_string()); }, |_| {})
            .await
    });
    let ready = timeout(Duration::from_secs(5), rx.recv()).await?;
    assert_eq!(ready.as_deref(), Some("ready"));
    Ok((handle, waiter))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_terminate_cooperative_process_exits_gracefully() -> Result<()> {
    let dir = TempDir::new()?;
    let (handle, waiter) = spawn_until_ready("echo ready; exec sleep 30", &dir).await?;
    assert!(handle.pid().is_some());
    assert!(!handle.has_exited());

    let started = Instant::now();
    let phase = handle.terminate(Duration::from_secs(3)).await;
    assert_eq!(phase, TerminationPhase::ExitedGracefully);
    assert!(started.elapsed() < Duration::from_secs(2));

    let outcome = timeout(Duration::from_secs(2), waiter).await??;
    assert_eq!(outcome, ExitOutcome::KilledBySignal { signal: 15 });
    assert!(handle.has_exited());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_terminate_escalates_when_term_is_ignored() -> Result<()> {
    let dir = TempDir::new()?;
    let (handle, waiter) = spawn_until_ready("trap '' TERM; echo ready; sleep 30; echo done", &dir).await?;

    let grace = Duration::from_secs(3);
    let started = Instant::now();
    let teardown = handle.begin_termination(grace).await;
    assert!(started.elapsed() < Duration::from_secs(1));

    let phase = timeout(Duration::from_secs(6), teardown).await??;
    let elapsed = started.elapsed();
    eprintln!("force kill after {:?}", elapsed);
    assert_eq!(phase, TerminationPhase::ForceKilled);
    assert!(elapsed >= grace);
    assert!(elapsed < grace + Duration::from_secs(2));

    let outcome = timeout(Duration::from_secs(2), waiter).await??;
    assert_eq!(outcome, ExitOutcome::KilledBySignal { signal: 9 });
    Ok(())
}

async fn pid_alive(pid: &str) -> bool {
    tokio::process::Command::new("kill")
        .args(["-0", pid])
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_terminate_kills_grandchild_ignoring_term() -> Result<()> {
    let dir = TempDir::new()?;
    // The leader dies on TERM; its background child ignores TERM and keeps stdout open.
    let script = "sh -c 'trap \"\" TERM; echo $$ > inner.pid; echo ready; sleep 3; touch survived' & wait";
    let (handle, waiter) = spawn_until_ready(script, &dir).await?;

    let started = Instant::now();
    let phase = handle.terminate(Duration::from_secs(1)).await;
    eprintln!("teardown {:?} after {:?}", phase, started.elapsed());
    assert_eq!(phase, TerminationPhase::ForceKilled);

    let outcome = timeout(Duration::from_secs(3), waiter).await??;
    assert_eq!(outcome, ExitOutcome::KilledBySignal { signal: 15 });
    assert!(started.elapsed() < Duration::from_secs(3));

    let inner = fs::read_to_string(dir.path().join("inner.pid"))?.trim().to_string();
    let mut gone = false;
    for _ in 0..40 {
        if !pid_alive(&inner).await {
            gone = true;
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert!(gone, "grandchild {} still alive", inner);

    sleep(Duration::from_millis(3_500).saturating_sub(started.elapsed())).await;
    assert!(!dir.path().join("survived").exists());
    Ok(())
}

#[tokio::test]
async fn test_terminate_after_exit_is_noop() -> Result<()> {
    let dir = TempDir::new()?;
    let running = command::spawn(&sh("exit 0", &dir)).map_err(|e| anyhow!(e))?;
    let handle = running.handle();
    assert!(running.wait(|_| {}, |_| {}).await.is_success());
    assert_eq!(handle.terminate(Duration::from_secs(3)).await, TerminationPhase::ExitedGracefully);
    Ok(())
}

#[test]
fn test_command_line_rendering() {
    let spec = CommandSpec::new("python3", "/tmp").arg("-u").args(["Step2/lenFilter.py", "200"]);
    assert_eq!(spec.command_line(), "python3 -u Step2/lenFilter.py 200");
}
