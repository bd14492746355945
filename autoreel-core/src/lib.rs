pub mod browser;
pub mod config;
pub mod control;
pub mod error;
pub mod provider;
pub mod retry;
pub mod run;
pub mod sqlite;
pub mod stage;
pub mod upload_log;
pub mod workflow;

pub use config::{load_pipeline_config, PipelineConfig};
pub use control::{Cancelled, ControlSignal, RunControl, RunSignal};
pub use error::{ConfigError, Result};
pub use provider::{ProviderKind, ProviderRegistry, ProviderStrategy, StageProvider};
pub use retry::{AttemptOutcome, ExecutionAttempt, FailureClass, RetryPolicy};
pub use run::{
    InitialInput, RunStateStore, RunStatus, SqliteRunStore, StageArtifact, StageKind,
    StageResult, WorkflowMode, WorkflowRun,
};
pub use stage::{StageContext, StageError, StageExecutor, StageFailure, StageOutcome, StageSet};
pub use upload_log::{SqliteUploadLog, UploadLog, UploadLogEntry};
pub use workflow::{
    OrchestratorError, OrchestratorResult, ProgressEvent, ProgressKind, ProgressSink, RunHandle,
    WorkflowOrchestrator,
};
