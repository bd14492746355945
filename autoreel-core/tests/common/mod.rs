#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use autoreel_core::provider::{RenderedVideo, UploadReceipt, UploadRequest, VideoRequest};
use autoreel_core::run::{Privacy, ScriptArtifact, UploadRecord, VideoArtifact};
use autoreel_core::{
    ControlSignal, PipelineConfig, ProviderKind, RetryPolicy, SqliteRunStore, SqliteUploadLog,
    StageArtifact, StageContext, StageError, StageExecutor, StageFailure, StageKind, StageOutcome,
    StageProvider,
};
use tempfile::TempDir;
use tokio::sync::Notify;

pub struct Harness {
    pub dir: TempDir,
    pub config: Arc<PipelineConfig>,
    pub store: Arc<SqliteRunStore>,
    pub log: Arc<SqliteUploadLog>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let config: PipelineConfig = toml::from_str(&config_toml(dir.path())).unwrap();
        let config = Arc::new(config);
        let store = SqliteRunStore::builder()
            .path(config.run_db_path())
            .create_if_missing(true)
            .build()
            .unwrap();
        store.initialize().unwrap();
        let log = SqliteUploadLog::new(config.upload_log_path());
        log.initialize().unwrap();
        Self {
            dir,
            config,
            store: Arc::new(store),
            log: Arc::new(log),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Writes a saved script document and a fake video next to it.
    pub fn publish_inputs(&self) -> (PathBuf, PathBuf) {
        let script = self.path("ai_facts.txt");
        std::fs::write(
            &script,
            "SCRIPT:\nAI learns from data.\n\nTITLE: AI Facts\nDESCRIPTION: Quick facts.\nKEYWORDS: ai, facts\n",
        )
        .unwrap();
        let video = self.path("ai_facts.mp4");
        std::fs::write(&video, b"not really an mp4").unwrap();
        (script, video)
    }
}

pub fn config_toml(base: &Path) -> String {
    format!(
        r#"
[paths]
base_dir = '{base}'
data_dir = "data"
run_db = "data/runs.sqlite"
upload_log_db = "data/uploads.sqlite"
scripts_dir = "scripts"
videos_dir = "videos"
downloads_dir = "downloads"

[workflow]
prompt_template = "Write a short video script about {{topic}}."
max_words = 120
save_scripts = true

[retry]
max_attempts = 2
base_delay_ms = 1
max_delay_ms = 5
jitter_ms = 0

[stages.script]
providers = ["template"]

[stages.video]
providers = ["render_api"]

[stages.upload]
providers = ["youtube_api"]

[providers.render_api]
api_key_env = "AUTOREEL_TEST_RENDER_KEY"
endpoint = "https://render.invalid"
response_timeout_seconds = 30

[providers.youtube_api]
api_key_env = "AUTOREEL_TEST_YOUTUBE_TOKEN"
endpoint = "https://youtube.invalid"
response_timeout_seconds = 30

[video]
resolution = "1080x1920"
render_timeout_seconds = 60

[upload]
privacy = "unlisted"
category_id = "28"
notify_subscribers = false

[upload.schedule]
policy = "immediate"

[metadata]
default_title = "{{topic}}"
default_description = "All about {{topic}}."
default_tags = ["shorts"]
"#,
        base = base.display()
    )
}

pub fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(
        max_attempts,
        Duration::from_millis(1),
        Duration::from_millis(2),
    )
}

/// Video provider that fails with a retryable error `failures` times, then
/// writes a small file into the requested videos dir.
pub struct MockRenderer {
    kind: ProviderKind,
    failures: AtomicU32,
    pub calls: AtomicU32,
}

impl MockRenderer {
    pub fn new(kind: ProviderKind, failures: u32) -> Self {
        Self {
            kind,
            failures: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageProvider<VideoRequest, RenderedVideo> for MockRenderer {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn execute(
        &self,
        request: &VideoRequest,
        _signal: &ControlSignal,
    ) -> Result<RenderedVideo, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StageError::ProviderUnavailable(format!(
                "{} render queue is full",
                self.kind
            )));
        }
        tokio::fs::create_dir_all(&request.videos_dir).await.unwrap();
        let path = request.videos_dir.join(format!("{}.mp4", self.kind));
        tokio::fs::write(&path, request.script_text.as_bytes())
            .await
            .unwrap();
        Ok(RenderedVideo {
            path,
            duration_seconds: Some(42.0),
            resolution: Some(request.resolution.clone()),
            style: request.style.clone(),
        })
    }
}

/// Upload provider that always succeeds and remembers what it was asked.
#[derive(Default)]
pub struct MockUploader {
    pub requests: Mutex<Vec<UploadRequest>>,
}

impl MockUploader {
    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl StageProvider<UploadRequest, UploadReceipt> for MockUploader {
    fn kind(&self) -> ProviderKind {
        ProviderKind::YoutubeApi
    }

    async fn execute(
        &self,
        request: &UploadRequest,
        _signal: &ControlSignal,
    ) -> Result<UploadReceipt, StageError> {
        let mut requests = self.requests.lock().unwrap();
        requests.push(request.clone());
        let video_id = format!("vid{:08}", requests.len());
        Ok(UploadReceipt {
            url: Some(format!("https://www.youtube.com/watch?v={video_id}")),
            video_id,
            privacy: request.privacy,
        })
    }
}

/// Provider that fails every call with `error`.
pub struct Broken {
    kind: ProviderKind,
    error: StageError,
    pub calls: AtomicU32,
}

impl Broken {
    pub fn new(kind: ProviderKind, error: StageError) -> Self {
        Self {
            kind,
            error,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<Req, Out> StageProvider<Req, Out> for Broken
where
    Req: Send + Sync + 'static,
    Out: Send + 'static,
{
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn execute(&self, _request: &Req, _signal: &ControlSignal) -> Result<Out, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// What a [`RecordingStage`] does when invoked.
pub enum Behaviour {
    Succeed,
    /// Fails fatally for the first `n` calls.
    FailFirst(u32),
    /// Waits for the gate before succeeding.
    Gated(Arc<Notify>),
    /// Sleeps through the control signal, so only a stop ends it early.
    SleepFor(Duration),
}

/// Stage executor that records every invocation into a shared journal and
/// produces a plausible artifact for its kind.
pub struct RecordingStage {
    kind: StageKind,
    journal: Arc<Mutex<Vec<StageKind>>>,
    behaviour: Behaviour,
    calls: AtomicU32,
    artifacts_dir: PathBuf,
}

impl RecordingStage {
    pub fn new(
        kind: StageKind,
        journal: Arc<Mutex<Vec<StageKind>>>,
        behaviour: Behaviour,
        artifacts_dir: &Path,
    ) -> Self {
        Self {
            kind,
            journal,
            behaviour,
            calls: AtomicU32::new(0),
            artifacts_dir: artifacts_dir.to_path_buf(),
        }
    }

    fn artifact(&self) -> StageArtifact {
        match self.kind {
            StageKind::Script => StageArtifact::Script(ScriptArtifact::new(
                Some("AI Facts".into()),
                "AI learns from data.".into(),
                "AI Facts".into(),
                "Quick facts.".into(),
                vec!["ai".into()],
            )),
            StageKind::Video => {
                let path = self.artifacts_dir.join("recorded.mp4");
                std::fs::write(&path, b"frames").unwrap();
                StageArtifact::Video(VideoArtifact {
                    id: "video-key".into(),
                    path,
                    duration_seconds: Some(10.0),
                    resolution: None,
                    style: None,
                    script_id: None,
                })
            }
            StageKind::Upload => StageArtifact::Upload(UploadRecord {
                video_id: "vid00000001".into(),
                url: None,
                title: "AI Facts".into(),
                privacy: Privacy::Unlisted,
                scheduled_publish_at: None,
                source_key: "video-key".into(),
                script_id: None,
                uploaded_at: chrono::Utc::now(),
            }),
        }
    }
}

#[async_trait]
impl StageExecutor for RecordingStage {
    fn kind(&self) -> StageKind {
        self.kind
    }

    async fn execute(
        &self,
        _ctx: &StageContext<'_>,
        signal: &ControlSignal,
    ) -> Result<StageOutcome, StageFailure> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.journal.lock().unwrap().push(self.kind);
        match &self.behaviour {
            Behaviour::Succeed => {}
            Behaviour::FailFirst(n) if call <= *n => {
                return Err(StageFailure::new(StageError::Unexpected(format!(
                    "{} blew up on call {call}",
                    self.kind
                ))));
            }
            Behaviour::FailFirst(_) => {}
            Behaviour::Gated(gate) => gate.notified().await,
            Behaviour::SleepFor(duration) => signal
                .sleep(*duration)
                .await
                .map_err(StageError::from)?,
        }
        Ok(StageOutcome {
            artifact: self.artifact(),
            provider: None,
            attempts: Vec::new(),
        })
    }
}

pub fn journal() -> Arc<Mutex<Vec<StageKind>>> {
    Arc::new(Mutex::new(Vec::new()))
}
