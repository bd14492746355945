pub mod error;
pub mod models;
pub mod store;

pub use error::{RunStoreError, RunStoreResult};
pub use models::{
    content_id, latest_script, latest_video, unique_tags, InitialInput, Privacy, RunFailure,
    RunStatus, ScriptArtifact, StageArtifact, StageKind, StageResult, UploadRecord,
    VideoArtifact, WorkflowMode, WorkflowRun,
};
pub use store::{RunStateStore, SqliteRunStore, SqliteRunStoreBuilder};
