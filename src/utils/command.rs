/// Spawning external commands, streaming their output, and tearing them down.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

use crate::config::defs::KILL_TAG;

/// How often the grace window re-checks whether the process group is empty.
const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One external command: program, arguments, working directory and extra environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        CommandSpec {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Shell-like rendering for logs.
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// How a command ended. A non-zero exit is an ordinary outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Success { stdout: String },
    NonZeroExit { code: i32, stderr: String },
    KilledBySignal { signal: i32 },
    SpawnFailed { reason: String },
}

impl ExitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitOutcome::Success { .. })
    }

    /// Human-readable failure text, `None` on success.
    pub fn failure_message(&self) -> Option<String> {
        match self {
            ExitOutcome::Success { .. } => None,
            ExitOutcome::NonZeroExit { code, stderr } => {
                if stderr.trim().is_empty() {
                    Some(format!("exited with status {}", code))
                } else {
                    Some(stderr.clone())
                }
            }
            ExitOutcome::KilledBySignal { signal } => Some(format!("killed by signal {}", signal)),
            ExitOutcome::SpawnFailed { reason } => Some(reason.clone()),
        }
    }
}

/// Phases of the two-phase teardown: `SignalSent -> (ExitedGracefully | TimeoutElapsed -> ForceKilled)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationPhase {
    SignalSent,
    ExitedGracefully,
    TimeoutElapsed,
    ForceKilled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStream {
    Stdout,
    Stderr,
}

#[derive(Debug)]
struct ChildChunk {
    stream: ChildStream,
    text: String,
}

/// Cloneable reference to a running command, used to request its termination.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    tool: String,
    exited: watch::Receiver<bool>,
    force: Arc<Notify>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Waits up to `within` for the process to be reaped. Returns true if it exited.
    pub async fn wait_exit(&self, within: Duration) -> bool {
        let mut exited = self.exited.clone();
        match timeout(within, exited.wait_for(|done| *done)).await {
            Ok(_) => true,
            Err(_) => false,
        }
    }

    /// Sends SIGTERM to the command's process group.
    pub async fn signal_graceful(&self) -> TerminationPhase {
        if let Some(pid) = self.pid {
            info!("Sending TERM to {} (pgid {})", self.tool, pid);
            signal_group("TERM", pid).await;
        }
        TerminationPhase::SignalSent
    }

    /// Sends SIGKILL to the process group and asks the waiter to kill the direct child.
    pub async fn force_kill(&self) -> TerminationPhase {
        if let Some(pid) = self.pid {
            warn!("Force killing {} (pgid {})", self.tool, pid);
            signal_group("KILL", pid).await;
        }
        self.force.notify_one();
        TerminationPhase::ForceKilled
    }

    /// True once the direct child is reaped and nothing else is left in its process group.
    pub async fn tree_exited(&self) -> bool {
        if !self.has_exited() {
            return false;
        }
        match self.pid {
            Some(pgid) => !group_alive(pgid).await,
            None => true,
        }
    }

    /// Full two-phase teardown, resolving once the final phase is known.
    pub async fn terminate(&self, grace: Duration) -> TerminationPhase {
        if self.tree_exited().await {
            return TerminationPhase::ExitedGracefully;
        }
        self.signal_graceful().await;
        self.escalate(grace).await
    }

    /// Issues the graceful signal, then leaves the grace-window timer running in the background.
    ///
    /// # Arguments
    ///
    /// * `grace` - How long the process tree gets to exit before it is force killed.
    ///
    /// # Returns
    /// JoinHandle resolving to the final TerminationPhase.
    pub async fn begin_termination(&self, grace: Duration) -> JoinHandle<TerminationPhase> {
        if self.tree_exited().await {
            return tokio::spawn(async { TerminationPhase::ExitedGracefully });
        }
        self.signal_graceful().await;
        let handle = self.clone();
        tokio::spawn(async move { handle.escalate(grace).await })
    }

    /// Waits out the grace window for the whole group, not just the direct child:
    /// a descendant that ignores TERM still gets the KILL.
    async fn escalate(&self, grace: Duration) -> TerminationPhase {
        let deadline = Instant::now() + grace;
        loop {
            if self.tree_exited().await {
                debug!("{} exited within the grace window", self.tool);
                return TerminationPhase::ExitedGracefully;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let step = (deadline - now).min(GROUP_POLL_INTERVAL);
            if self.has_exited() {
                sleep(step).await;
            } else if self.wait_exit(step).await && !self.has_exited() {
                // Waiter dropped without recording an exit.
                sleep(step).await;
            }
        }
        debug!("{}: {:?} after {:?}", self.tool, TerminationPhase::TimeoutElapsed, grace);
        self.force_kill().await
    }
}

/// `kill -0 -- -<pgid>`: succeeds while any member of the group still exists.
#[cfg(unix)]
async fn group_alive(pgid: u32) -> bool {
    Command::new(KILL_TAG)
        .arg("-0")
        .arg("--")
        .arg(format!("-{}", pgid))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(not(unix))]
async fn group_alive(_pgid: u32) -> bool {
    false
}

async fn signal_group(signal: &str, pgid: u32) {
    let result = Command::new(KILL_TAG)
        .arg(format!("-{}", signal))
        .arg("--")
        .arg(format!("-{}", pgid))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match result {
        Ok(status) if !status.success() => debug!("kill -{} -{} returned {}", signal, pgid, status),
        Ok(_) => {}
        Err(e) => warn!("Failed to invoke {} -{}: {}", KILL_TAG, signal, e),
    }
}

/// A spawned command whose output has not been drained yet.
pub struct RunningCommand {
    child: Child,
    tool: String,
    handle: ProcessHandle,
    exited_tx: watch::Sender<bool>,
    force: Arc<Notify>,
}

/// Spawns `spec` in its own process group with piped stdout/stderr.
///
/// # Arguments
///
/// * `spec` - The command to start.
///
/// # Returns
/// RunningCommand, or the reason the spawn failed.
pub fn spawn(spec: &CommandSpec) -> Result<RunningCommand, String> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.working_dir)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd
        .spawn()
        .map_err(|e| format!("Failed to spawn {}: {}", spec.program, e))?;
    debug!("Spawned {} (pid {:?})", spec.command_line(), child.id());

    let (exited_tx, exited_rx) = watch::channel(false);
    let force = Arc::new(Notify::new());
    let handle = ProcessHandle {
        pid: child.id(),
        tool: spec.program.clone(),
        exited: exited_rx,
        force: force.clone(),
    };

    Ok(RunningCommand {
        child,
        tool: spec.program.clone(),
        handle,
        exited_tx,
        force,
    })
}

impl RunningCommand {
    pub fn handle(&self) -> ProcessHandle {
        self.handle.clone()
    }

    /// Drains stdout and stderr line by line into the callbacks and resolves once the
    /// process has exited and both streams are closed.
    pub async fn wait<O, E>(self, mut on_stdout: O, mut on_stderr: E) -> ExitOutcome
    where
        O: FnMut(&str),
        E: FnMut(&str),
    {
        let RunningCommand { mut child, tool, exited_tx, force, .. } = self;

        let (tx, mut rx) = mpsc::unbounded_channel::<ChildChunk>();
        if let Some(out) = child.stdout.take() {
            tokio::spawn(read_lines(out, ChildStream::Stdout, tx.clone()));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(read_lines(err, ChildStream::Stderr, tx.clone()));
        }
        drop(tx);

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut status = None;
        let mut drained = false;

        while status.is_none() || !drained {
            tokio::select! {
                chunk = rx.recv(), if !drained => match chunk {
                    Some(ChildChunk { stream: ChildStream::Stdout, text }) => {
                        on_stdout(&text);
                        push_line(&mut stdout, &text);
                    }
                    Some(ChildChunk { stream: ChildStream::Stderr, text }) => {
                        on_stderr(&text);
                        push_line(&mut stderr, &text);
                    }
                    None => drained = true,
                },
                result = child.wait(), if status.is_none() => {
                    let _ = exited_tx.send(true);
                    status = Some(result);
                }
                _ = force.notified(), if status.is_none() => {
                    if let Err(e) = child.start_kill() {
                        debug!("start_kill on {} failed: {}", tool, e);
                    }
                }
            }
        }

        match status {
            Some(Ok(status)) if status.success() => ExitOutcome::Success { stdout },
            Some(Ok(status)) => match status.code() {
                Some(code) => ExitOutcome::NonZeroExit { code, stderr },
                None => ExitOutcome::KilledBySignal { signal: exit_signal(&status) },
            },
            Some(Err(e)) => ExitOutcome::SpawnFailed {
                reason: format!("Failed to wait on {}: {}", tool, e),
            },
            None => ExitOutcome::SpawnFailed {
                reason: format!("{} produced no exit status", tool),
            },
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().unwrap_or(0)
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> i32 {
    0
}

fn push_line(buf: &mut String, line: &str) {
    if !buf.is_empty() {
        buf.push('\n');
    }
    buf.push_str(line);
}

async fn read_lines<R>(reader: R, stream: ChildStream, tx: mpsc::UnboundedSender<ChildChunk>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                if tx.send(ChildChunk { stream, text }).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Error reading child {:?}: {}", stream, e);
                break;
            }
        }
    }
}

/// Spawns and waits in one step.
pub async fn run<O, E>(spec: &CommandSpec, on_stdout: O, on_stderr: E) -> ExitOutcome
where
    O: FnMut(&str),
    E: FnMut(&str),
{
    match spawn(spec) {
        Ok(running) => running.wait(on_stdout, on_stderr).await,
        Err(reason) => ExitOutcome::SpawnFailed { reason },
    }
}

/// Runs a short command to completion, discarding the live stream.
pub async fn capture(spec: &CommandSpec) -> ExitOutcome {
    run(spec, |_| {}, |_| {}).await
}
