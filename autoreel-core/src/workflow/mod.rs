mod orchestrator;
mod progress;

pub use orchestrator::{
    browser_sessions, OrchestratorError, OrchestratorResult, RunHandle, WorkflowOrchestrator,
};
pub use progress::{ProgressEvent, ProgressKind, ProgressSink};
