use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::provider::ProviderKind;
use crate::retry::ExecutionAttempt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Script,
    Video,
    Upload,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Script => "script",
            StageKind::Video => "video",
            StageKind::Upload => "upload",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "script" => Ok(StageKind::Script),
            "video" => Ok(StageKind::Video),
            "upload" => Ok(StageKind::Upload),
            other => Err(format!("unknown stage: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowMode {
    FullAuto,
    ScriptOnly,
    VideoOnly,
    UploadOnly,
    ScriptAndVideo,
    VideoAndUpload,
}

impl WorkflowMode {
    pub const ALL: [WorkflowMode; 6] = [
        WorkflowMode::FullAuto,
        WorkflowMode::ScriptOnly,
        WorkflowMode::VideoOnly,
        WorkflowMode::UploadOnly,
        WorkflowMode::ScriptAndVideo,
        WorkflowMode::VideoAndUpload,
    ];

    /// Stages run by this mode, in execution order.
    pub fn stages(&self) -> &'static [StageKind] {
        match self {
            WorkflowMode::FullAuto => &[StageKind::Script, StageKind::Video, StageKind::Upload],
            WorkflowMode::ScriptOnly => &[StageKind::Script],
            WorkflowMode::VideoOnly => &[StageKind::Video],
            WorkflowMode::UploadOnly => &[StageKind::Upload],
            WorkflowMode::ScriptAndVideo => &[StageKind::Script, StageKind::Video],
            WorkflowMode::VideoAndUpload => &[StageKind::Video, StageKind::Upload],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowMode::FullAuto => "full_auto",
            WorkflowMode::ScriptOnly => "script_only",
            WorkflowMode::VideoOnly => "video_only",
            WorkflowMode::UploadOnly => "upload_only",
            WorkflowMode::ScriptAndVideo => "script_and_video",
            WorkflowMode::VideoAndUpload => "video_and_upload",
        }
    }
}

impl fmt::Display for WorkflowMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkflowMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| format!("unknown workflow mode: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Stopped => "stopped",
        }
    }

    pub fn terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Stopped
        )
    }

    /// Failed runs may be resumed after the cause is fixed; completed and
    /// stopped runs are final.
    pub fn resumable(&self) -> bool {
        matches!(
            self,
            RunStatus::Paused | RunStatus::Failed | RunStatus::Running
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(RunStatus::Idle),
            "running" => Ok(RunStatus::Running),
            "paused" => Ok(RunStatus::Paused),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "stopped" => Ok(RunStatus::Stopped),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Privacy {
    Public,
    Unlisted,
    Private,
}

impl Privacy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Privacy::Public => "public",
            Privacy::Unlisted => "unlisted",
            Privacy::Private => "private",
        }
    }
}

impl fmt::Display for Privacy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Privacy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Privacy::Public),
            "unlisted" => Ok(Privacy::Unlisted),
            "private" => Ok(Privacy::Private),
            other => Err(format!("unknown privacy setting: {other}")),
        }
    }
}

/// What a run starts from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InitialInput {
    Topic { topic: String },
    Script { script: PathBuf },
    Publish { script: PathBuf, video: PathBuf },
}

impl InitialInput {
    pub fn topic(&self) -> Option<&str> {
        match self {
            InitialInput::Topic { topic } => Some(topic.as_str()),
            _ => None,
        }
    }

    pub fn script_path(&self) -> Option<&PathBuf> {
        match self {
            InitialInput::Script { script } | InitialInput::Publish { script, .. } => Some(script),
            InitialInput::Topic { .. } => None,
        }
    }

    pub fn video_path(&self) -> Option<&PathBuf> {
        match self {
            InitialInput::Publish { video, .. } => Some(video),
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            InitialInput::Topic { topic } => format!("topic \"{topic}\""),
            InitialInput::Script { script } => format!("script {}", script.display()),
            InitialInput::Publish { script, video } => {
                format!("script {} + video {}", script.display(), video.display())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptArtifact {
    pub id: String,
    pub topic: Option<String>,
    pub text: String,
    pub title: String,
    pub description: String,
    /// Unique, in first-seen order.
    pub tags: Vec<String>,
    pub saved_to: Option<PathBuf>,
}

impl ScriptArtifact {
    pub fn new(
        topic: Option<String>,
        text: String,
        title: String,
        description: String,
        tags: Vec<String>,
    ) -> Self {
        let id = content_id(text.as_bytes());
        Self {
            id,
            topic,
            text,
            title,
            description,
            tags: unique_tags(tags),
            saved_to: None,
        }
    }

    /// Serialised with the same headers the script parser reads back.
    pub fn to_document(&self) -> String {
        format!(
            "SCRIPT:\n{}\n\nTITLE: {}\nDESCRIPTION: {}\nKEYWORDS: {}\n",
            self.text.trim(),
            self.title,
            self.description,
            self.tags.join(", ")
        )
    }
}

/// Trims, drops empties and removes case-insensitive duplicates while
/// keeping the first spelling and position.
pub fn unique_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::HashSet::new();
    let mut unique = Vec::new();
    for tag in tags {
        let tag = tag.as_ref().trim();
        if tag.is_empty() {
            continue;
        }
        if seen.insert(tag.to_lowercase()) {
            unique.push(tag.to_string());
        }
    }
    unique
}

pub fn content_id(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..8])
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoArtifact {
    /// Hex SHA-256 of the file contents; the upload idempotence key.
    pub id: String,
    pub path: PathBuf,
    pub duration_seconds: Option<f64>,
    pub resolution: Option<String>,
    pub style: Option<String>,
    pub script_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub video_id: String,
    pub url: Option<String>,
    pub title: String,
    pub privacy: Privacy,
    pub scheduled_publish_at: Option<DateTime<Utc>>,
    pub source_key: String,
    pub script_id: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageArtifact {
    Script(ScriptArtifact),
    Video(VideoArtifact),
    Upload(UploadRecord),
    DuplicateSkipped(UploadRecord),
}

impl StageArtifact {
    pub fn kind(&self) -> &'static str {
        match self {
            StageArtifact::Script(_) => "script",
            StageArtifact::Video(_) => "video",
            StageArtifact::Upload(_) => "upload",
            StageArtifact::DuplicateSkipped(_) => "duplicate_skipped",
        }
    }

    pub fn summary(&self) -> String {
        match self {
            StageArtifact::Script(script) => format!("script \"{}\"", script.title),
            StageArtifact::Video(video) => format!("video {}", video.path.display()),
            StageArtifact::Upload(record) => format!("uploaded as {}", record.video_id),
            StageArtifact::DuplicateSkipped(record) => {
                format!("already uploaded as {}", record.video_id)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageKind,
    pub artifact: StageArtifact,
    pub provider: Option<ProviderKind>,
    pub attempts: Vec<ExecutionAttempt>,
    pub completed_at: DateTime<Utc>,
}

impl StageResult {
    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }
}

/// Terminal error of a failed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub stage: StageKind,
    pub error_kind: String,
    pub message: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: String,
    pub mode: WorkflowMode,
    pub status: RunStatus,
    pub stage_index: usize,
    pub input: InitialInput,
    pub results: Vec<StageResult>,
    pub failure: Option<RunFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(mode: WorkflowMode, input: InitialInput) -> Self {
        let now = Utc::now();
        Self {
            run_id: format!("run-{}", Uuid::new_v4().simple()),
            mode,
            status: RunStatus::Idle,
            stage_index: 0,
            input,
            results: Vec::new(),
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn stages(&self) -> &'static [StageKind] {
        self.mode.stages()
    }

    pub fn current_stage(&self) -> Option<StageKind> {
        self.stages().get(self.stage_index).copied()
    }

    pub fn is_finished(&self) -> bool {
        self.stage_index >= self.stages().len()
    }

    pub fn progress_percent(&self) -> u8 {
        let total = self.stages().len().max(1);
        ((self.stage_index.min(total) * 100) / total) as u8
    }

    pub fn latest_script(&self) -> Option<&ScriptArtifact> {
        latest_script(&self.results)
    }

    pub fn latest_video(&self) -> Option<&VideoArtifact> {
        latest_video(&self.results)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

pub fn latest_script(results: &[StageResult]) -> Option<&ScriptArtifact> {
    results.iter().rev().find_map(|result| match &result.artifact {
        StageArtifact::Script(script) => Some(script),
        _ => None,
    })
}

pub fn latest_video(results: &[StageResult]) -> Option<&VideoArtifact> {
    results.iter().rev().find_map(|result| match &result.artifact {
        StageArtifact::Video(video) => Some(video),
        _ => None,
    })
}
