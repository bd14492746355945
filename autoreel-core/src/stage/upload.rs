use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Local, LocalResult, TimeZone, Utc};
use tracing::{info, warn};

use crate::config::{MetadataSection, PipelineConfig, SchedulePolicy, ScheduleSection, UploadSection};
use crate::control::ControlSignal;
use crate::error::ConfigError;
use crate::provider::{ProviderRegistry, ProviderStrategy, UploadReceipt, UploadRequest};
use crate::run::{latest_video, StageArtifact, StageKind, UploadRecord, VideoArtifact};
use crate::upload_log::{UploadLog, UploadLogEntry, UploadLogError};

use super::video::script_for;
use super::{
    file_digest_async, StageContext, StageError, StageExecutor, StageFailure, StageOutcome,
};

/// When a video uploaded at `now` should go public, or `None` to publish
/// immediately. `daily_at` times are read in the timezone of `now`.
pub fn next_publish_time<Tz: TimeZone>(
    schedule: &ScheduleSection,
    now: DateTime<Tz>,
) -> crate::Result<Option<DateTime<Utc>>> {
    match schedule.policy {
        SchedulePolicy::Immediate => Ok(None),
        SchedulePolicy::Delay => {
            let hours = schedule
                .hours
                .ok_or_else(|| ConfigError::missing("upload.schedule.hours"))?;
            Ok(Some(now.with_timezone(&Utc) + Duration::hours(i64::from(hours))))
        }
        SchedulePolicy::DailyAt => {
            let time = schedule.daily_time()?;
            let tz = now.timezone();
            let today = now.date_naive();
            for offset in 0..=2 {
                let day = today + Duration::days(offset);
                let candidate = match tz.from_local_datetime(&day.and_time(time)) {
                    LocalResult::Single(at) => at,
                    LocalResult::Ambiguous(earliest, _) => earliest,
                    // the wall time falls in a DST gap on this day
                    LocalResult::None => continue,
                };
                if candidate > now {
                    return Ok(Some(candidate.with_timezone(&Utc)));
                }
            }
            Err(ConfigError::invalid(
                "upload.schedule.time",
                "no valid publish time in the next two days",
            ))
        }
    }
}

pub struct UploadStage {
    strategy: ProviderStrategy<UploadRequest, UploadReceipt>,
    upload: UploadSection,
    metadata: MetadataSection,
    log: Arc<dyn UploadLog>,
}

impl UploadStage {
    pub fn new(
        strategy: ProviderStrategy<UploadRequest, UploadReceipt>,
        upload: UploadSection,
        metadata: MetadataSection,
        log: Arc<dyn UploadLog>,
    ) -> Self {
        Self {
            strategy,
            upload,
            metadata,
            log,
        }
    }

    pub fn from_config(
        config: &PipelineConfig,
        registry: &ProviderRegistry,
        log: Arc<dyn UploadLog>,
    ) -> crate::Result<Self> {
        Ok(Self::new(
            registry.upload_strategy()?,
            config.require_upload()?.clone(),
            config.require_metadata()?.clone(),
            log,
        ))
    }

    async fn video_for(
        &self,
        ctx: &StageContext<'_>,
        script_id: &str,
    ) -> Result<VideoArtifact, StageError> {
        if let Some(video) = latest_video(ctx.results) {
            return Ok(video.clone());
        }
        let path = ctx
            .input
            .video_path()
            .ok_or_else(|| StageError::MissingInput("no video available".into()))?;
        Ok(VideoArtifact {
            id: file_digest_async(path).await?,
            path: path.clone(),
            duration_seconds: None,
            resolution: None,
            style: None,
            script_id: Some(script_id.to_string()),
        })
    }
}

#[async_trait]
impl StageExecutor for UploadStage {
    fn kind(&self) -> StageKind {
        StageKind::Upload
    }

    async fn execute(
        &self,
        ctx: &StageContext<'_>,
        signal: &ControlSignal,
    ) -> Result<StageOutcome, StageFailure> {
        let script = script_for(ctx, &self.metadata)?;
        let video = self.video_for(ctx, &script.id).await?;
        let source_key = video.id.clone();

        if let Some(entry) = self.log.find_upload(&source_key).await.map_err(StageError::from)? {
            info!(
                run_id = ctx.run_id,
                video_id = %entry.record.video_id,
                "video already uploaded, skipping"
            );
            return Ok(StageOutcome {
                artifact: StageArtifact::DuplicateSkipped(entry.record),
                provider: None,
                attempts: Vec::new(),
            });
        }

        let publish_at =
            next_publish_time(&self.upload.schedule, Local::now()).map_err(StageError::from)?;
        let request = UploadRequest {
            file: video.path.clone(),
            title: script.title.clone(),
            description: script.description.clone(),
            tags: script.tags.clone(),
            category_id: self.upload.category_id.clone(),
            privacy: self.upload.privacy,
            notify_subscribers: self.upload.notify_subscribers,
            publish_at,
        };

        let outcome = self.strategy.execute(&request, signal).await?;
        let receipt = outcome.output;
        let attempts = outcome.attempts;
        let record = UploadRecord {
            video_id: receipt.video_id,
            url: receipt.url,
            title: script.title,
            privacy: receipt.privacy,
            scheduled_publish_at: publish_at,
            source_key: source_key.clone(),
            script_id: Some(script.id),
            uploaded_at: Utc::now(),
        };
        let entry = UploadLogEntry {
            record: record.clone(),
            original_file: video.path,
            run_id: Some(ctx.run_id.to_string()),
        };

        let artifact = match self.log.append_upload(&entry).await {
            Ok(()) => StageArtifact::Upload(record),
            Err(UploadLogError::Conflict { .. }) => {
                warn!(
                    run_id = ctx.run_id,
                    source_key = %source_key,
                    "upload log already had this video; keeping the earlier record"
                );
                match self.log.find_upload(&source_key).await {
                    Ok(Some(existing)) => StageArtifact::DuplicateSkipped(existing.record),
                    _ => StageArtifact::DuplicateSkipped(record),
                }
            }
            Err(err) => {
                return Err(StageFailure {
                    error: StageError::Unexpected(format!(
                        "video {} was published but the upload log write failed: {err}",
                        record.video_id
                    )),
                    attempts,
                });
            }
        };
        info!(
            run_id = ctx.run_id,
            provider = %outcome.provider,
            "{}",
            artifact.summary()
        );

        Ok(StageOutcome {
            artifact,
            provider: Some(outcome.provider),
            attempts,
        })
    }
}
