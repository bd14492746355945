mod error;
mod script;
mod upload;
mod video;

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::config::PipelineConfig;
use crate::control::ControlSignal;
use crate::provider::{ProviderKind, ProviderRegistry};
use crate::retry::ExecutionAttempt;
use crate::run::{
    latest_script, latest_video, InitialInput, StageArtifact, StageKind, StageResult, WorkflowMode,
};
use crate::upload_log::UploadLog;

pub use error::{StageError, StageFailure};
pub use script::{build_prompt, load_script_file, parse_script_response, ScriptStage};
pub use upload::{next_publish_time, UploadStage};
pub use video::VideoStage;

/// What a stage sees of its run.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub run_id: &'a str,
    pub input: &'a InitialInput,
    /// Successful results of the stages before this one, in order.
    pub results: &'a [StageResult],
}

#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub artifact: StageArtifact,
    /// `None` when the stage short-circuited without calling a provider.
    pub provider: Option<ProviderKind>,
    pub attempts: Vec<ExecutionAttempt>,
}

#[async_trait]
pub trait StageExecutor: Send + Sync {
    fn kind(&self) -> StageKind;

    async fn execute(
        &self,
        ctx: &StageContext<'_>,
        signal: &ControlSignal,
    ) -> Result<StageOutcome, StageFailure>;
}

/// The executors available to an orchestrator, one per stage kind.
#[derive(Clone, Default)]
pub struct StageSet {
    stages: BTreeMap<StageKind, Arc<dyn StageExecutor>>,
}

impl StageSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, stage: Arc<dyn StageExecutor>) -> Self {
        self.stages.insert(stage.kind(), stage);
        self
    }

    /// Builds every stage that has a `[stages.<kind>]` section.
    pub fn from_config(
        config: &PipelineConfig,
        registry: &ProviderRegistry,
        upload_log: Arc<dyn UploadLog>,
    ) -> crate::Result<Self> {
        let mut set = Self::new();
        if config.stages.script.is_some() {
            set = set.with(Arc::new(ScriptStage::from_config(config, registry)?));
        }
        if config.stages.video.is_some() {
            set = set.with(Arc::new(VideoStage::from_config(config, registry)?));
        }
        if config.stages.upload.is_some() {
            set = set.with(Arc::new(UploadStage::from_config(
                config, registry, upload_log,
            )?));
        }
        Ok(set)
    }

    pub fn get(&self, kind: StageKind) -> Option<Arc<dyn StageExecutor>> {
        self.stages.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<StageKind> {
        self.stages.keys().copied().collect()
    }
}

impl std::fmt::Debug for StageSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageSet")
            .field("stages", &self.kinds())
            .finish()
    }
}

/// Whether `input` can start a run of `mode`.
pub fn check_initial_input(mode: WorkflowMode, input: &InitialInput) -> Result<(), StageError> {
    let first = mode.stages().first().copied().unwrap_or(StageKind::Script);
    let accepted = match (first, input) {
        (StageKind::Script, InitialInput::Topic { .. }) => true,
        (StageKind::Video, InitialInput::Script { .. } | InitialInput::Publish { .. }) => true,
        (StageKind::Upload, InitialInput::Publish { .. }) => true,
        _ => false,
    };
    if !accepted {
        return Err(StageError::MissingInput(format!(
            "{mode} cannot start from {}",
            input.describe()
        )));
    }
    check_stage_inputs(first, input, &[])
}

/// Whether everything `stage` consumes is still available, either as a prior
/// result or from the initial input.
pub fn check_stage_inputs(
    stage: StageKind,
    input: &InitialInput,
    results: &[StageResult],
) -> Result<(), StageError> {
    match stage {
        StageKind::Script => match input.topic() {
            Some(topic) if !topic.trim().is_empty() => Ok(()),
            _ => Err(StageError::MissingInput("a non-empty topic".into())),
        },
        StageKind::Video => {
            if latest_script(results).is_some() {
                return Ok(());
            }
            require_file(input.script_path().map(|p| p.as_path()), "script file")
        }
        StageKind::Upload => {
            if latest_script(results).is_none() {
                require_file(input.script_path().map(|p| p.as_path()), "script file")?;
            }
            match latest_video(results) {
                Some(video) => require_file(Some(video.path.as_path()), "rendered video"),
                None => require_file(input.video_path().map(|p| p.as_path()), "video file"),
            }
        }
    }
}

fn require_file(path: Option<&Path>, what: &str) -> Result<(), StageError> {
    match path {
        Some(path) if path.is_file() => Ok(()),
        Some(path) => Err(StageError::MissingInput(format!(
            "{what} {} does not exist",
            path.display()
        ))),
        None => Err(StageError::MissingInput(format!("no {what} available"))),
    }
}

/// Hex SHA-256 of a file's contents.
pub fn file_digest(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub(crate) async fn file_digest_async(path: &Path) -> Result<String, StageError> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || file_digest(&owned))
        .await
        .map_err(|err| StageError::Unexpected(err.to_string()))?
        .map_err(|err| StageError::MissingInput(format!("{}: {err}", path.display())))
}
