use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::run::{StageKind, WorkflowRun};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    RunStarted,
    StageStarted,
    StageSucceeded,
    StageFailed,
    RunPaused,
    RunStopped,
    RunCompleted,
    RunFailed,
}

impl ProgressKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressKind::RunStarted => "run_started",
            ProgressKind::StageStarted => "stage_started",
            ProgressKind::StageSucceeded => "stage_succeeded",
            ProgressKind::StageFailed => "stage_failed",
            ProgressKind::RunPaused => "run_paused",
            ProgressKind::RunStopped => "run_stopped",
            ProgressKind::RunCompleted => "run_completed",
            ProgressKind::RunFailed => "run_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub run_id: String,
    pub kind: ProgressKind,
    pub stage: Option<StageKind>,
    /// Completed stages over total stages, rounded down.
    pub percent: u8,
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn for_run(run: &WorkflowRun, kind: ProgressKind, stage: Option<StageKind>) -> Self {
        Self {
            run_id: run.run_id.clone(),
            kind,
            stage,
            percent: run.progress_percent(),
            message: None,
            at: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Fan-out of progress events. Emitting never waits on observers; a slow
/// subscriber loses the oldest events instead.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: broadcast::Sender<ProgressEvent>,
}

impl Default for ProgressSink {
    fn default() -> Self {
        Self::new(64)
    }
}

impl ProgressSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ProgressEvent) {
        let stage = event.stage.map(|stage| stage.as_str()).unwrap_or("-");
        let message = event.message.as_deref().unwrap_or("");
        match event.kind {
            ProgressKind::StageFailed | ProgressKind::RunFailed => error!(
                run_id = %event.run_id,
                stage,
                percent = event.percent,
                event = event.kind.as_str(),
                "{message}"
            ),
            ProgressKind::RunStopped | ProgressKind::RunPaused => warn!(
                run_id = %event.run_id,
                stage,
                percent = event.percent,
                event = event.kind.as_str(),
                "{message}"
            ),
            _ => info!(
                run_id = %event.run_id,
                stage,
                percent = event.percent,
                event = event.kind.as_str(),
                "{message}"
            ),
        }
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}
