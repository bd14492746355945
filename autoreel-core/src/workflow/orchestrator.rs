use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::browser::{
    BrowserSessionManager, ChromiumDriver, ProfileManager, SelectorCatalog, SessionRequest,
};
use crate::config::PipelineConfig;
use crate::control::{RunControl, RunSignal};
use crate::error::ConfigError;
use crate::provider::ProviderRegistry;
use crate::run::{
    InitialInput, RunFailure, RunStateStore, RunStatus, RunStoreError, StageKind, StageResult,
    WorkflowMode, WorkflowRun,
};
use crate::stage::{
    check_initial_input, check_stage_inputs, StageContext, StageError, StageFailure, StageSet,
};
use crate::upload_log::UploadLog;

use super::progress::{ProgressEvent, ProgressKind, ProgressSink};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid input: {0}")]
    InvalidInput(StageError),
    #[error("run {run_id} is already running")]
    RunInProgress { run_id: String },
    #[error("run {0} not found")]
    RunNotFound(String),
    #[error("run {run_id} is {status} and cannot be resumed")]
    NotResumable { run_id: String, status: RunStatus },
    #[error("run {run_id} is not active (status {status})")]
    NotActive { run_id: String, status: RunStatus },
    #[error("run store error: {0}")]
    Store(#[from] RunStoreError),
    #[error("run task failed: {0}")]
    Join(String),
}

pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;

/// A run executing in the background.
#[derive(Debug)]
pub struct RunHandle {
    run_id: String,
    control: RunControl,
    task: JoinHandle<OrchestratorResult<WorkflowRun>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    pub fn pause(&self) {
        self.control.request_pause();
    }

    pub fn stop(&self) {
        self.control.request_stop();
    }

    /// Waits for the run to reach a terminal or paused state.
    pub async fn wait(self) -> OrchestratorResult<WorkflowRun> {
        self.task
            .await
            .map_err(|err| OrchestratorError::Join(err.to_string()))?
    }
}

#[derive(Debug)]
struct ActiveRun {
    run_id: String,
    control: RunControl,
}

struct Inner {
    config: Arc<PipelineConfig>,
    stages: StageSet,
    store: Arc<dyn RunStateStore>,
    progress: ProgressSink,
    sessions: Option<Arc<BrowserSessionManager>>,
    active: Mutex<Option<ActiveRun>>,
}

impl Inner {
    fn active(&self) -> std::sync::MutexGuard<'_, Option<ActiveRun>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, run: &WorkflowRun, kind: ProgressKind, stage: Option<StageKind>, message: String) {
        self.progress
            .emit(ProgressEvent::for_run(run, kind, stage).with_message(message));
    }
}

/// Frees the active-run slot on every exit path of a run task.
struct ActiveGuard {
    inner: Arc<Inner>,
    run_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut active = self.inner.active();
        if active.as_ref().map(|run| run.run_id.as_str()) == Some(self.run_id.as_str()) {
            *active = None;
        }
    }
}

/// Sequences the stages of one run at a time, persisting after every
/// transition.
#[derive(Clone)]
pub struct WorkflowOrchestrator {
    inner: Arc<Inner>,
}

impl WorkflowOrchestrator {
    pub fn new(
        config: Arc<PipelineConfig>,
        stages: StageSet,
        store: Arc<dyn RunStateStore>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                stages,
                store,
                progress: ProgressSink::default(),
                sessions: None,
                active: Mutex::new(None),
            }),
        }
    }

    /// Wires browser sessions, selectors, providers and stages from `config`.
    pub fn from_config(
        config: Arc<PipelineConfig>,
        store: Arc<dyn RunStateStore>,
        upload_log: Arc<dyn UploadLog>,
    ) -> OrchestratorResult<Self> {
        let sessions = browser_sessions(&config);
        let selectors = match &config.paths.selectors_file {
            Some(file) => SelectorCatalog::load(config.resolve_path(file))?,
            None => SelectorCatalog::default(),
        };
        let registry =
            ProviderRegistry::new(Arc::clone(&config), sessions.clone(), Arc::new(selectors));
        let stages = StageSet::from_config(&config, &registry, upload_log)?;
        let mut orchestrator = Self::new(config, stages, store);
        if let Some(sessions) = sessions {
            orchestrator = orchestrator.with_browser(sessions);
        }
        Ok(orchestrator)
    }

    /// Only valid before the orchestrator is shared.
    pub fn with_progress(self, progress: ProgressSink) -> Self {
        self.map_inner(|inner| inner.progress = progress)
    }

    /// Sessions are shut down whenever a run task ends.
    pub fn with_browser(self, sessions: Arc<BrowserSessionManager>) -> Self {
        self.map_inner(|inner| inner.sessions = Some(sessions))
    }

    fn map_inner(self, apply: impl FnOnce(&mut Inner)) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                apply(&mut inner);
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(shared) => {
                warn!("orchestrator already shared, ignoring builder call");
                Self { inner: shared }
            }
        }
    }

    pub fn progress(&self) -> &ProgressSink {
        &self.inner.progress
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// The id of the run currently executing, if any.
    pub fn active_run(&self) -> Option<String> {
        self.inner.active().as_ref().map(|run| run.run_id.clone())
    }

    pub async fn start(&self, mode: WorkflowMode, input: InitialInput) -> OrchestratorResult<RunHandle> {
        self.check_ready(mode)?;
        check_initial_input(mode, &input).map_err(OrchestratorError::InvalidInput)?;

        let mut run = WorkflowRun::new(mode, input);
        let (control, guard) = self.claim(&run.run_id)?;
        run.status = RunStatus::Running;
        run.touch();
        self.inner.store.save_run(&run).await?;
        info!(run_id = %run.run_id, mode = %mode, input = %run.input.describe(), "run started");
        self.inner.emit(&run, ProgressKind::RunStarted, run.current_stage(), mode.to_string());
        Ok(self.spawn(run, control, guard))
    }

    /// Starts a run and waits for it to end.
    pub async fn run_to_end(
        &self,
        mode: WorkflowMode,
        input: InitialInput,
    ) -> OrchestratorResult<WorkflowRun> {
        self.start(mode, input).await?.wait().await
    }

    /// Requests a pause at the next stage boundary.
    pub async fn pause(&self, run_id: &str) -> OrchestratorResult<()> {
        if let Some(control) = self.control_of(run_id) {
            control.request_pause();
            info!(run_id, "pause requested");
            return Ok(());
        }
        let run = self.load(run_id).await?;
        Err(OrchestratorError::NotActive {
            run_id: run.run_id,
            status: run.status,
        })
    }

    /// Requests a cooperative stop. A paused run is stopped directly.
    pub async fn stop(&self, run_id: &str) -> OrchestratorResult<()> {
        if let Some(control) = self.control_of(run_id) {
            control.request_stop();
            info!(run_id, "stop requested");
            return Ok(());
        }
        let mut run = self.load(run_id).await?;
        if run.status != RunStatus::Paused {
            return Err(OrchestratorError::NotActive {
                run_id: run.run_id,
                status: run.status,
            });
        }
        run.status = RunStatus::Stopped;
        run.touch();
        self.inner.store.save_run(&run).await?;
        self.inner
            .emit(&run, ProgressKind::RunStopped, run.current_stage(), "stopped while paused".into());
        Ok(())
    }

    /// Continues a paused, failed or abandoned run from its persisted stage
    /// index after re-checking that the stage's inputs still exist.
    pub async fn resume(&self, run_id: &str) -> OrchestratorResult<RunHandle> {
        if self.control_of(run_id).is_some() {
            return Err(OrchestratorError::RunInProgress {
                run_id: run_id.to_string(),
            });
        }
        let mut run = self.load(run_id).await?;
        if !run.status.resumable() {
            return Err(OrchestratorError::NotResumable {
                run_id: run.run_id,
                status: run.status,
            });
        }
        self.check_ready(run.mode)?;
        if let Some(stage) = run.current_stage() {
            check_stage_inputs(stage, &run.input, &run.results)
                .map_err(OrchestratorError::InvalidInput)?;
        }

        let (control, guard) = self.claim(&run.run_id)?;
        let previous = run.status;
        run.status = RunStatus::Running;
        run.failure = None;
        run.touch();
        self.inner.store.save_run(&run).await?;
        info!(
            run_id = %run.run_id,
            from = %previous,
            stage_index = run.stage_index,
            "run resumed"
        );
        self.inner.emit(
            &run,
            ProgressKind::RunStarted,
            run.current_stage(),
            format!("resumed from {previous}"),
        );
        Ok(self.spawn(run, control, guard))
    }

    fn check_ready(&self, mode: WorkflowMode) -> OrchestratorResult<()> {
        self.inner.config.validate_for(mode)?;
        for stage in mode.stages() {
            if self.inner.stages.get(*stage).is_none() {
                return Err(ConfigError::missing(format!("stages.{}", stage.as_str())).into());
            }
        }
        Ok(())
    }

    fn claim(&self, run_id: &str) -> OrchestratorResult<(RunControl, ActiveGuard)> {
        let mut active = self.inner.active();
        if let Some(current) = active.as_ref() {
            return Err(OrchestratorError::RunInProgress {
                run_id: current.run_id.clone(),
            });
        }
        let control = RunControl::new();
        *active = Some(ActiveRun {
            run_id: run_id.to_string(),
            control: control.clone(),
        });
        let guard = ActiveGuard {
            inner: Arc::clone(&self.inner),
            run_id: run_id.to_string(),
        };
        Ok((control, guard))
    }

    fn control_of(&self, run_id: &str) -> Option<RunControl> {
        self.inner
            .active()
            .as_ref()
            .filter(|run| run.run_id == run_id)
            .map(|run| run.control.clone())
    }

    async fn load(&self, run_id: &str) -> OrchestratorResult<WorkflowRun> {
        self.inner
            .store
            .load_run(run_id)
            .await?
            .ok_or_else(|| OrchestratorError::RunNotFound(run_id.to_string()))
    }

    fn spawn(&self, run: WorkflowRun, control: RunControl, guard: ActiveGuard) -> RunHandle {
        let run_id = run.run_id.clone();
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(drive(inner, run, control.clone(), guard));
        RunHandle {
            run_id,
            control,
            task,
        }
    }
}

impl std::fmt::Debug for WorkflowOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowOrchestrator")
            .field("stages", &self.inner.stages)
            .field("active", &self.active_run())
            .field("browser", &self.inner.sessions.is_some())
            .finish()
    }
}

/// A session manager when any configured stage drives a browser.
pub fn browser_sessions(config: &PipelineConfig) -> Option<Arc<BrowserSessionManager>> {
    let browser = config.browser.as_ref()?;
    if !config.uses_browser(WorkflowMode::FullAuto) {
        return None;
    }
    let profiles = ProfileManager::new(config.resolve_path(&config.paths.data_dir));
    let profile_dir = browser
        .profile_dir
        .as_ref()
        .map(|dir| config.resolve_path(dir));
    let driver = Arc::new(ChromiumDriver::new(browser, Some(profiles)));
    Some(Arc::new(BrowserSessionManager::new(
        driver,
        SessionRequest::from_config(browser, profile_dir),
        browser.keep_alive_between_stages,
    )))
}

async fn drive(
    inner: Arc<Inner>,
    mut run: WorkflowRun,
    control: RunControl,
    guard: ActiveGuard,
) -> OrchestratorResult<WorkflowRun> {
    let outcome = drive_stages(&inner, &mut run, &control).await;
    if let Some(sessions) = &inner.sessions {
        sessions.shutdown().await;
    }
    drop(guard);
    outcome.map(|()| run)
}

async fn drive_stages(
    inner: &Inner,
    run: &mut WorkflowRun,
    control: &RunControl,
) -> OrchestratorResult<()> {
    let signal = control.signal();
    loop {
        // A signal raised during the last stage has no boundary left to act on.
        let Some(stage) = run.current_stage() else {
            return settle(inner, run, RunStatus::Completed, ProgressKind::RunCompleted).await;
        };

        match control.current() {
            RunSignal::Stop => {
                return settle(inner, run, RunStatus::Stopped, ProgressKind::RunStopped).await;
            }
            RunSignal::Pause => {
                return settle(inner, run, RunStatus::Paused, ProgressKind::RunPaused).await;
            }
            RunSignal::Continue => {}
        }

        inner.emit(run, ProgressKind::StageStarted, Some(stage), format!("{stage} stage started"));

        let outcome = match inner.stages.get(stage) {
            Some(executor) => {
                let ctx = StageContext {
                    run_id: &run.run_id,
                    input: &run.input,
                    results: &run.results,
                };
                AssertUnwindSafe(executor.execute(&ctx, &signal))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        Err(StageFailure::new(StageError::Unexpected(format!(
                            "{stage} stage panicked: {}",
                            panic_message(panic.as_ref())
                        ))))
                    })
            }
            None => Err(StageFailure::new(StageError::Configuration(format!(
                "no executor for the {stage} stage"
            )))),
        };

        match outcome {
            Ok(done) => {
                let summary = done.artifact.summary();
                run.results.push(StageResult {
                    stage,
                    artifact: done.artifact,
                    provider: done.provider,
                    attempts: done.attempts,
                    completed_at: chrono::Utc::now(),
                });
                run.stage_index += 1;
                run.touch();
                inner.store.save_run(run).await?;
                inner.emit(run, ProgressKind::StageSucceeded, Some(stage), summary);
            }
            Err(failure) if failure.error.is_cancelled() => {
                return settle(inner, run, RunStatus::Stopped, ProgressKind::RunStopped).await;
            }
            Err(failure) => {
                let attempts = u32::try_from(failure.attempts.len()).unwrap_or(u32::MAX);
                error!(
                    run_id = %run.run_id,
                    stage = %stage,
                    error_kind = failure.error.kind_str(),
                    attempts,
                    error = %failure.error,
                    "stage failed, run aborted"
                );
                run.failure = Some(RunFailure {
                    stage,
                    error_kind: failure.error.kind_str().to_string(),
                    message: failure.error.to_string(),
                    attempts,
                    failed_at: chrono::Utc::now(),
                });
                inner.emit(
                    run,
                    ProgressKind::StageFailed,
                    Some(stage),
                    failure.error.to_string(),
                );
                return settle(inner, run, RunStatus::Failed, ProgressKind::RunFailed).await;
            }
        }
    }
}

async fn settle(
    inner: &Inner,
    run: &mut WorkflowRun,
    status: RunStatus,
    kind: ProgressKind,
) -> OrchestratorResult<()> {
    run.status = status;
    run.touch();
    inner.store.save_run(run).await?;
    inner.emit(run, kind, run.current_stage(), format!("run {status}"));
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
