// src/pipelines/orchestrator.rs: single-slot analysis state machine and stage driving loop

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::defs::{
    PipelineError, RunConfig, STOP_GRACE_PERIOD, SUBSCRIBER_CLOSE_DELAY, USER_STOP_MESSAGE,
};
use crate::pipelines::params::{resolve_stage_args, AnalysisParameters};
use crate::pipelines::stages::StageDefinition;
use crate::utils::backend::{backend_from_config, ExecutionBackend};
use crate::utils::collate::{collate, CollatedResult};
use crate::utils::command::{self, ExitOutcome, ProcessHandle, TerminationPhase};
use crate::utils::environment::Gatekeeper;
use crate::utils::file::StorageLayout;
use crate::utils::streams::{EventType, ProgressBroadcaster, ProgressEvent, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AnalysisStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl AnalysisStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnalysisStatus::Completed | AnalysisStatus::Failed | AnalysisStatus::Stopped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StageStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageOutcome {
    pub stage_name: String,
    pub script_ref: String,
    pub terminal_status: StageStatus,
}

/// The one mutable analysis slot.
struct AnalysisState {
    run_id: u64,
    status: AnalysisStatus,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    stage_results: Vec<StageOutcome>,
    current_stage: Option<StageDefinition>,
    error: Option<String>,
    result: Option<CollatedResult>,
    params: Arc<AnalysisParameters>,
    // Only ever Some while status == Running; briefly None between a stage's exit and the
    // next spawn, which the snapshot hides behind `current_stage`.
    process: Option<ProcessHandle>,
}

impl AnalysisState {
    fn finish(&mut self, status: AnalysisStatus, error: Option<String>) {
        self.status = status;
        self.ended_at = Some(Utc::now());
        self.error = error;
        self.current_stage = None;
        self.process = None;
    }

    fn terminal_event(&self) -> Option<ProgressEvent> {
        match self.status {
            AnalysisStatus::Completed => Some(ProgressEvent::complete("Analysis completed")),
            AnalysisStatus::Failed | AnalysisStatus::Stopped => Some(ProgressEvent::error(
                self.error.clone().unwrap_or_else(|| "Analysis failed".to_string()),
                None,
            )),
            AnalysisStatus::Idle | AnalysisStatus::Running => None,
        }
    }
}

/// Read-only projection of the analysis slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub run_id: u64,
    pub status: AnalysisStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub stage_results: Vec<StageOutcome>,
    pub current_stage: Option<String>,
    pub total_stages: usize,
    pub error: Option<String>,
    pub has_result: bool,
    pub has_process: bool,
    pub params: AnalysisParameters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResults {
    pub result: CollatedResult,
    pub completed_at: DateTime<Utc>,
}

/// Returned by `stop`: the status change is already visible; `teardown` resolves once the
/// process tree is gone or has been force killed.
#[derive(Debug)]
pub struct StopAccepted {
    pub teardown: Option<JoinHandle<TerminationPhase>>,
}

struct Inner {
    stages: Vec<StageDefinition>,
    storage: StorageLayout,
    backend: Arc<dyn ExecutionBackend>,
    broadcaster: ProgressBroadcaster,
    grace_period: Duration,
    next_run_id: AtomicU64,
    state: Mutex<Option<AnalysisState>>,
}

/// Owns the analysis slot. Cheap to clone; all clones share one slot.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(stages: Vec<StageDefinition>, storage: StorageLayout, backend: Arc<dyn ExecutionBackend>) -> Self {
        Self::with_timing(
            stages,
            storage,
            backend,
            STOP_GRACE_PERIOD,
            SUBSCRIBER_CLOSE_DELAY,
        )
    }

    pub fn with_timing(
        stages: Vec<StageDefinition>,
        storage: StorageLayout,
        backend: Arc<dyn ExecutionBackend>,
        grace_period: Duration,
        close_delay: Duration,
    ) -> Self {
        Orchestrator {
            inner: Arc::new(Inner {
                stages,
                storage,
                backend,
                broadcaster: ProgressBroadcaster::new(close_delay),
                grace_period,
                next_run_id: AtomicU64::new(0),
                state: Mutex::new(None),
            }),
        }
    }

    pub fn from_config(config: &RunConfig, stages: Vec<StageDefinition>) -> Self {
        let storage = StorageLayout::new(config.uploads_root.clone(), config.outputs_root.clone());
        let backend: Arc<dyn ExecutionBackend> = Arc::from(backend_from_config(config));
        Self::with_timing(stages, storage, backend, config.grace_period, config.close_delay)
    }

    pub fn stages(&self) -> &[StageDefinition] {
        &self.inner.stages
    }

    pub fn storage(&self) -> &StorageLayout {
        &self.inner.storage
    }

    pub fn broadcaster(&self) -> &ProgressBroadcaster {
        &self.inner.broadcaster
    }

    fn lock_state(&self) -> MutexGuard<'_, Option<AnalysisState>> {
        self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claims the slot and starts driving the stage table in the background.
    ///
    /// # Arguments
    ///
    /// * `params` - Inputs for the run; validated against every stage before anything spawns.
    ///
    /// # Returns
    /// The new run id, PipelineError::Conflict while a run is active, or PipelineError::Validation.
    pub fn start(&self, params: AnalysisParameters) -> Result<u64, PipelineError> {
        let mut guard = self.lock_state();
        if let Some(state) = guard.as_ref() {
            if state.status == AnalysisStatus::Running {
                return Err(PipelineError::Conflict);
            }
        }
        params.validate(&self.inner.stages, &self.inner.storage)?;

        let run_id = self.inner.next_run_id.fetch_add(1, Ordering::SeqCst) + 1;
        let params = Arc::new(params);
        *guard = Some(AnalysisState {
            run_id,
            status: AnalysisStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            stage_results: Vec::with_capacity(self.inner.stages.len()),
            current_stage: None,
            error: None,
            result: None,
            params: params.clone(),
            process: None,
        });
        // Anyone still attached belongs to the superseded run.
        self.inner.broadcaster.close_all();
        self.inner.broadcaster.publish(ProgressEvent::start(format!(
            "Analysis started ({} stages)",
            self.inner.stages.len()
        )));
        drop(guard);

        info!("Run {} started", run_id);
        let orchestrator = self.clone();
        tokio::spawn(async move { orchestrator.drive(run_id, params).await });
        Ok(run_id)
    }

    /// Runs the environment check first; a not-ready environment is rejected like bad input.
    pub async fn start_when_ready(
        &self,
        params: AnalysisParameters,
        gatekeeper: &Gatekeeper,
    ) -> Result<u64, PipelineError> {
        let report = gatekeeper.full_environment_check().await;
        if !report.is_ready() {
            return Err(PipelineError::Environment(report.message));
        }
        self.start(params)
    }

    /// Marks the run Stopped immediately, then tears the in-flight process down in two phases.
    pub async fn stop(&self) -> Result<StopAccepted, PipelineError> {
        let process = {
            let mut guard = self.lock_state();
            let state = match guard.as_mut() {
                Some(state) if state.status == AnalysisStatus::Running => state,
                _ => return Err(PipelineError::NoRunningAnalysis),
            };
            let process = state.process.take();
            state.finish(AnalysisStatus::Stopped, Some(USER_STOP_MESSAGE.to_string()));
            self.inner
                .broadcaster
                .publish_terminal(ProgressEvent::error(USER_STOP_MESSAGE, None));
            info!("Run {} stopped by user", state.run_id);
            process
        };

        let teardown = match process {
            Some(handle) => Some(handle.begin_termination(self.inner.grace_period).await),
            None => None,
        };
        Ok(StopAccepted { teardown })
    }

    pub fn status(&self) -> Result<StatusSnapshot, PipelineError> {
        self.current().ok_or(PipelineError::NoAnalysis)
    }

    pub fn current(&self) -> Option<StatusSnapshot> {
        let guard = self.lock_state();
        guard.as_ref().map(|state| StatusSnapshot {
            run_id: state.run_id,
            status: state.status,
            started_at: state.started_at,
            ended_at: state.ended_at,
            stage_results: state.stage_results.clone(),
            current_stage: state.current_stage.as_ref().map(|s| s.name.clone()),
            total_stages: self.inner.stages.len(),
            error: state.error.clone(),
            has_result: state.result.is_some(),
            has_process: state.status == AnalysisStatus::Running
                && (state.process.is_some() || state.current_stage.is_some()),
            params: (*state.params).clone(),
        })
    }

    /// `Idle` when the slot is empty.
    pub fn current_status(&self) -> AnalysisStatus {
        self.lock_state()
            .as_ref()
            .map(|state| state.status)
            .unwrap_or(AnalysisStatus::Idle)
    }

    pub fn results(&self) -> Result<AnalysisResults, PipelineError> {
        let guard = self.lock_state();
        match guard.as_ref() {
            Some(AnalysisState {
                status: AnalysisStatus::Completed,
                result: Some(result),
                ended_at: Some(ended_at),
                ..
            }) => Ok(AnalysisResults {
                result: result.clone(),
                completed_at: *ended_at,
            }),
            _ => Err(PipelineError::NotReady),
        }
    }

    /// Releases the slot. Rejected while a run is active.
    pub fn clear(&self) -> Result<(), PipelineError> {
        let mut guard = self.lock_state();
        if let Some(state) = guard.as_ref() {
            if state.status == AnalysisStatus::Running {
                return Err(PipelineError::Conflict);
            }
        }
        self.inner.broadcaster.close_all();
        if let Some(state) = guard.take() {
            debug!("Run {} cleared", state.run_id);
        }
        Ok(())
    }

    /// Opens a live event stream, seeded with an event describing the current status.
    pub fn subscribe_progress(&self) -> Subscription {
        let guard = self.lock_state();
        match guard.as_ref() {
            None => ProgressBroadcaster::one_shot(vec![ProgressEvent::progress("No analysis", None)]),
            Some(state) if state.status == AnalysisStatus::Running => {
                let backfill = match &state.current_stage {
                    Some(stage) => ProgressEvent::progress(
                        format!("Analysis running: {}", stage.label),
                        Some(&stage.name),
                    ),
                    None => ProgressEvent::progress("Analysis running", None),
                };
                self.inner.broadcaster.subscribe(vec![backfill])
            }
            Some(state) => ProgressBroadcaster::one_shot(state.terminal_event().into_iter().collect()),
        }
    }

    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        subscription
            .id()
            .map(|id| self.inner.broadcaster.unsubscribe(id))
            .unwrap_or(false)
    }

    /// Applies `f` to the slot only while `run_id` is the current, running analysis.
    fn with_running<T>(&self, run_id: u64, f: impl FnOnce(&mut AnalysisState, &ProgressBroadcaster) -> T) -> Option<T> {
        let mut guard = self.lock_state();
        match guard.as_mut() {
            Some(state) if state.run_id == run_id && state.status == AnalysisStatus::Running => {
                Some(f(state, &self.inner.broadcaster))
            }
            _ => None,
        }
    }

    /// One event per non-empty line; `\r` counts as a line break for progress-bar output.
    fn emit_lines(&self, run_id: u64, stage: &StageDefinition, chunk: &str, kind: EventType) {
        for line in chunk.split(['\n', '\r']) {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let event = ProgressEvent::new(kind, line, Some(&stage.name));
            self.with_running(run_id, |_, broadcaster| broadcaster.publish(event));
        }
    }

    async fn drive(self, run_id: u64, params: Arc<AnalysisParameters>) {
        for stage in self.inner.stages.iter() {
            let began = self.with_running(run_id, |state, broadcaster| {
                state.current_stage = Some(stage.clone());
                broadcaster.publish(ProgressEvent::step_start(&stage.name, &stage.label));
            });
            if began.is_none() {
                debug!("Run {} no longer running before {}", run_id, stage.name);
                return;
            }

            let args = match resolve_stage_args(stage, &params) {
                Ok(args) => args,
                Err(e) => {
                    let outcome = ExitOutcome::SpawnFailed { reason: e.to_string() };
                    self.finish_stage(run_id, stage, &outcome);
                    return;
                }
            };
            let spec = self.inner.backend.command_for(stage, &args, &self.inner.storage);
            info!("[{}] {}", stage.name, spec.command_line());

            let running = match command::spawn(&spec) {
                Ok(running) => running,
                Err(reason) => {
                    self.finish_stage(run_id, stage, &ExitOutcome::SpawnFailed { reason });
                    return;
                }
            };

            let handle = running.handle();
            let attached = self.with_running(run_id, |state, _| state.process = Some(handle.clone()));
            if attached.is_none() {
                warn!("Run {} stopped while {} was spawning; terminating it", run_id, stage.name);
                let teardown = handle.begin_termination(self.inner.grace_period).await;
                running.wait(|_| {}, |_| {}).await;
                let _ = teardown.await;
                return;
            }

            let outcome = running
                .wait(
                    |chunk| self.emit_lines(run_id, stage, chunk, EventType::Progress),
                    |chunk| self.emit_lines(run_id, stage, chunk, EventType::Error),
                )
                .await;
            debug!("[{}] exit outcome: {:?}", stage.name, outcome);

            if !self.finish_stage(run_id, stage, &outcome) {
                return;
            }
        }

        self.complete(run_id).await;
    }

    /// Records a stage outcome. Returns true when the loop should continue.
    fn finish_stage(&self, run_id: u64, stage: &StageDefinition, outcome: &ExitOutcome) -> bool {
        let recorded = self.with_running(run_id, |state, broadcaster| {
            state.process = None;
            match outcome.failure_message() {
                None => {
                    state.stage_results.push(StageOutcome {
                        stage_name: stage.name.clone(),
                        script_ref: stage.script_ref.clone(),
                        terminal_status: StageStatus::Completed,
                    });
                    broadcaster.publish(ProgressEvent::step_complete(
                        &stage.name,
                        format!("{} completed", stage.label),
                    ));
                    info!("[{}] completed", stage.name);
                    true
                }
                Some(reason) => {
                    state.stage_results.push(StageOutcome {
                        stage_name: stage.name.clone(),
                        script_ref: stage.script_ref.clone(),
                        terminal_status: StageStatus::Failed,
                    });
                    broadcaster.publish(ProgressEvent::step_complete(
                        &stage.name,
                        format!("{} failed", stage.label),
                    ));
                    let message = format!("Stage {} ({}) failed: {}", stage.name, stage.script_ref, reason.trim());
                    error!("{}", message);
                    state.finish(AnalysisStatus::Failed, Some(message.clone()));
                    broadcaster.publish_terminal(ProgressEvent::error(message, Some(&stage.name)));
                    false
                }
            }
        });
        recorded.unwrap_or(false)
    }

    async fn complete(&self, run_id: u64) {
        let storage = self.inner.storage.clone();
        let collated = match tokio::task::spawn_blocking(move || collate(&storage)).await {
            Ok(result) => result,
            Err(e) => {
                let message = format!("Result collation failed: {}", e);
                self.with_running(run_id, |state, broadcaster| {
                    error!("{}", message);
                    state.finish(AnalysisStatus::Failed, Some(message.clone()));
                    broadcaster.publish_terminal(ProgressEvent::error(message, None));
                });
                return;
            }
        };

        self.with_running(run_id, |state, broadcaster| {
            info!("Run {} completed: {} output files", run_id, collated.total_files);
            state.result = Some(collated);
            state.finish(AnalysisStatus::Completed, None);
            broadcaster.publish_terminal(ProgressEvent::complete("Analysis completed"));
        });
    }
}
