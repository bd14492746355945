use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::{MetadataSection, PipelineConfig, VideoSection};
use crate::control::ControlSignal;
use crate::provider::{ProviderRegistry, ProviderStrategy, RenderedVideo, VideoRequest};
use crate::run::{latest_script, ScriptArtifact, StageArtifact, StageKind, VideoArtifact};

use super::script::load_script_file;
use super::{
    file_digest_async, StageContext, StageError, StageExecutor, StageFailure, StageOutcome,
};

pub struct VideoStage {
    strategy: ProviderStrategy<VideoRequest, RenderedVideo>,
    video: VideoSection,
    metadata: MetadataSection,
    videos_dir: PathBuf,
}

impl VideoStage {
    pub fn new(
        strategy: ProviderStrategy<VideoRequest, RenderedVideo>,
        video: VideoSection,
        metadata: MetadataSection,
        videos_dir: PathBuf,
    ) -> Self {
        Self {
            strategy,
            video,
            metadata,
            videos_dir,
        }
    }

    pub fn from_config(config: &PipelineConfig, registry: &ProviderRegistry) -> crate::Result<Self> {
        Ok(Self::new(
            registry.video_strategy()?,
            config.require_video()?.clone(),
            config.require_metadata()?.clone(),
            config.require_path(&config.paths.videos_dir, "paths.videos_dir")?,
        ))
    }

    fn request_for(&self, script: &ScriptArtifact) -> VideoRequest {
        VideoRequest {
            script_text: script.text.clone(),
            title: script.title.clone(),
            style: self.video.style.clone(),
            voice: self.video.voice.clone(),
            resolution: self.video.resolution.clone(),
            framerate: self.video.framerate,
            videos_dir: self.videos_dir.clone(),
            render_timeout: self.video.render_timeout(),
        }
    }
}

/// The script a video or upload stage works from: the latest produced one,
/// else the file named by the initial input.
pub(crate) fn script_for(
    ctx: &StageContext<'_>,
    metadata: &MetadataSection,
) -> Result<ScriptArtifact, StageError> {
    if let Some(script) = latest_script(ctx.results) {
        return Ok(script.clone());
    }
    match ctx.input.script_path() {
        Some(path) => load_script_file(path, metadata),
        None => Err(StageError::MissingInput("no script available".into())),
    }
}

#[async_trait]
impl StageExecutor for VideoStage {
    fn kind(&self) -> StageKind {
        StageKind::Video
    }

    async fn execute(
        &self,
        ctx: &StageContext<'_>,
        signal: &ControlSignal,
    ) -> Result<StageOutcome, StageFailure> {
        let script = script_for(ctx, &self.metadata)?;
        let request = self.request_for(&script);
        debug!(run_id = ctx.run_id, script_id = %script.id, "rendering video");

        let outcome = self.strategy.execute(&request, signal).await?;
        let attempts = outcome.attempts;
        let rendered = outcome.output;
        let id = file_digest_async(&rendered.path)
            .await
            .map_err(|error| StageFailure {
                error,
                attempts: attempts.clone(),
            })?;
        info!(
            run_id = ctx.run_id,
            provider = %outcome.provider,
            path = %rendered.path.display(),
            "video ready"
        );

        Ok(StageOutcome {
            artifact: StageArtifact::Video(VideoArtifact {
                id,
                path: rendered.path,
                duration_seconds: rendered.duration_seconds,
                resolution: rendered.resolution,
                style: rendered.style,
                script_id: Some(script.id),
            }),
            provider: Some(outcome.provider),
            attempts,
        })
    }
}
