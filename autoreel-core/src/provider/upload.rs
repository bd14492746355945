use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::browser::PageDriver;
use crate::config::ProviderSection;
use crate::control::ControlSignal;
use crate::run::Privacy;
use crate::stage::StageError;

use super::http::{check_status, endpoint, response_timeout, secret_from_env};
use super::web::WebContext;
use super::{ProviderKind, StageProvider};

pub const MAX_TITLE_CHARS: usize = 100;
pub const MAX_DESCRIPTION_CHARS: usize = 5000;

#[derive(Debug, Clone, PartialEq)]
pub struct UploadRequest {
    pub file: PathBuf,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub category_id: String,
    pub privacy: Privacy,
    pub notify_subscribers: bool,
    pub publish_at: Option<DateTime<Utc>>,
}

impl UploadRequest {
    /// Scheduled videos must stay private until their publish time.
    pub fn effective_privacy(&self) -> Privacy {
        if self.publish_at.is_some() {
            Privacy::Private
        } else {
            self.privacy
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub video_id: String,
    pub url: Option<String>,
    pub privacy: Privacy,
}

/// Strips the characters the platform rejects and clips to `max` chars.
pub(crate) fn clip_text(text: &str, max: usize) -> String {
    text.chars()
        .filter(|ch| *ch != '<' && *ch != '>')
        .take(max)
        .collect::<String>()
        .trim()
        .to_string()
}

/// Once the platform has the file, a failure no longer means nothing was
/// published. Stops pass through untouched.
pub(crate) fn after_handover(kind: ProviderKind, err: StageError) -> StageError {
    match err {
        err @ (StageError::Cancelled | StageError::PublishUncertain(_)) => err,
        other => StageError::PublishUncertain(format!("{kind}: {other}")),
    }
}

pub(crate) fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

/// Pulls the 11-character video id out of a watch, short or studio link.
pub(crate) fn video_id_from_link(link: &str) -> Option<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"(?:youtu\.be/|[?&]v=|/video/|/shorts/)([A-Za-z0-9_-]{11})")
            .expect("valid regex")
    });
    pattern
        .captures(link)
        .and_then(|caps| caps.get(1))
        .map(|id| id.as_str().to_string())
}

pub struct YoutubeApiProvider {
    client: reqwest::Client,
    section: ProviderSection,
    base_dir: PathBuf,
}

impl YoutubeApiProvider {
    pub fn new(client: reqwest::Client, section: ProviderSection, base_dir: PathBuf) -> Self {
        Self {
            client,
            section,
            base_dir,
        }
    }

    async fn access_token(&self) -> Result<String, StageError> {
        let kind = ProviderKind::YoutubeApi;
        if self.section.api_key_env.is_some() {
            if let Ok(token) = secret_from_env(kind, self.section.api_key_env.as_deref()) {
                return Ok(token);
            }
        }
        let Some(file) = &self.section.credentials_file else {
            return secret_from_env(kind, self.section.api_key_env.as_deref());
        };
        let path = resolve(&self.base_dir, file);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|err| StageError::Unsupported {
                provider: kind.to_string(),
                reason: format!("cannot read {}: {err}", path.display()),
            })?;
        let credentials: StoredCredentials =
            serde_json::from_str(&raw).map_err(|err| StageError::Unsupported {
                provider: kind.to_string(),
                reason: format!("invalid credentials file {}: {err}", path.display()),
            })?;
        match credentials.access_token {
            Some(token) if !token.trim().is_empty() => Ok(token),
            _ => Err(StageError::Unsupported {
                provider: kind.to_string(),
                reason: format!("{} has no access_token", path.display()),
            }),
        }
    }
}

fn resolve(base: &Path, file: &str) -> PathBuf {
    let path = Path::new(file);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[derive(Debug, Deserialize)]
struct StoredCredentials {
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InsertedVideo {
    id: String,
}

pub(crate) fn video_resource(request: &UploadRequest) -> serde_json::Value {
    let mut status = json!({
        "privacyStatus": request.effective_privacy().as_str(),
        "selfDeclaredMadeForKids": false,
    });
    if let Some(at) = request.publish_at {
        status["publishAt"] = json!(at.to_rfc3339_opts(SecondsFormat::Secs, true));
    }
    json!({
        "snippet": {
            "title": clip_text(&request.title, MAX_TITLE_CHARS),
            "description": clip_text(&request.description, MAX_DESCRIPTION_CHARS),
            "tags": request.tags,
            "categoryId": request.category_id,
        },
        "status": status,
    })
}

#[async_trait]
impl StageProvider<UploadRequest, UploadReceipt> for YoutubeApiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::YoutubeApi
    }

    async fn execute(
        &self,
        request: &UploadRequest,
        signal: &ControlSignal,
    ) -> Result<UploadReceipt, StageError> {
        let kind = self.kind();
        let token = self.access_token().await?;
        let base = endpoint(kind, &self.section)?;
        let timeout = response_timeout(kind, &self.section)?;
        let bytes = tokio::fs::read(&request.file).await.map_err(|err| {
            StageError::MissingInput(format!("{}: {err}", request.file.display()))
        })?;

        let response = self
            .client
            .post(format!("{base}/upload/youtube/v3/videos"))
            .query(&[
                ("uploadType", "resumable"),
                ("part", "snippet,status"),
                (
                    "notifySubscribers",
                    if request.notify_subscribers { "true" } else { "false" },
                ),
            ])
            .bearer_auth(&token)
            .header("X-Upload-Content-Type", "video/*")
            .header("X-Upload-Content-Length", bytes.len().to_string())
            .timeout(timeout)
            .json(&video_resource(request))
            .send()
            .await?;
        let response = check_status(kind, response).await?;
        let session_url = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                StageError::ProviderUnavailable("upload session has no Location header".into())
            })?;
        debug!(provider = %kind, bytes = bytes.len(), "upload session opened");

        signal.checkpoint()?;
        let transfer = async {
            let response = self
                .client
                .put(&session_url)
                .bearer_auth(&token)
                .header(CONTENT_TYPE, "video/*")
                .body(bytes)
                .send()
                .await?;
            let inserted: InsertedVideo = check_status(kind, response).await?.json().await?;
            Ok::<_, StageError>(inserted)
        };
        let inserted = transfer.await.map_err(|err| after_handover(kind, err))?;
        info!(provider = %kind, video_id = %inserted.id, "video uploaded");
        Ok(UploadReceipt {
            url: Some(watch_url(&inserted.id)),
            video_id: inserted.id,
            privacy: request.effective_privacy(),
        })
    }
}

/// Upload through the Studio web UI of an already signed-in profile.
pub struct YoutubeStudioProvider {
    web: WebContext,
}

impl YoutubeStudioProvider {
    pub fn new(web: WebContext) -> Self {
        Self { web }
    }

    /// Drives the upload dialog and returns the video link it shows.
    async fn publish(
        &self,
        page: &dyn PageDriver,
        request: &UploadRequest,
        signal: &ControlSignal,
    ) -> Result<String, StageError> {
        let web = &self.web;
        page.goto(&web.target_url).await?;
        web.click(page, "upload_button", signal).await?;
        let input = web.locate(page, "file_input", signal).await?;
        page.set_files(&input, std::slice::from_ref(&request.file))
            .await?;
        let kind = ProviderKind::YoutubeStudioWeb;
        debug!(provider = %kind, file = %request.file.display(), "file handed to studio");

        self.describe_and_confirm(page, request, signal)
            .await
            .map_err(|err| after_handover(kind, err))
    }

    async fn describe_and_confirm(
        &self,
        page: &dyn PageDriver,
        request: &UploadRequest,
        signal: &ControlSignal,
    ) -> Result<String, StageError> {
        let web = &self.web;
        web.fill(page, "title_input", &clip_text(&request.title, MAX_TITLE_CHARS), signal)
            .await?;
        web.fill(
            page,
            "description_input",
            &clip_text(&request.description, MAX_DESCRIPTION_CHARS),
            signal,
        )
        .await?;
        for _ in 0..3 {
            web.click(page, "next_button", signal).await?;
        }
        let privacy_action = format!("privacy_{}", request.privacy.as_str());
        web.click(page, &privacy_action, signal).await?;
        let link_selector = web.locate(page, "video_link", signal).await?;
        let link = match page.read_attribute(&link_selector, "href").await? {
            Some(href) if !href.trim().is_empty() => href,
            _ => page.read_text(&link_selector).await?,
        };
        web.click(page, "publish_button", signal).await?;
        Ok(link)
    }
}

#[async_trait]
impl StageProvider<UploadRequest, UploadReceipt> for YoutubeStudioProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::YoutubeStudioWeb
    }

    async fn execute(
        &self,
        request: &UploadRequest,
        signal: &ControlSignal,
    ) -> Result<UploadReceipt, StageError> {
        if request.publish_at.is_some() {
            return Err(StageError::Unsupported {
                provider: self.kind().to_string(),
                reason: "scheduled publishing is only supported through the api".into(),
            });
        }
        if !request.file.is_file() {
            return Err(StageError::MissingInput(format!(
                "{} does not exist",
                request.file.display()
            )));
        }
        let web = &self.web;
        let link = web
            .sessions
            .with_session(|session| async move {
                let page = session.page();
                let result = self.publish(page, request, signal).await;
                web.diagnose(page, "upload", result).await
            })
            .await?;

        let video_id = video_id_from_link(&link).ok_or_else(|| {
            StageError::PublishUncertain(format!("no video id in studio link `{link}`"))
        })?;
        info!(provider = %self.kind(), video_id = %video_id, "video published from studio");
        Ok(UploadReceipt {
            url: Some(watch_url(&video_id)),
            video_id,
            privacy: request.privacy,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::super::web::testing::web_context;
    use super::*;
    use crate::browser::testing::FakePage;
    use crate::retry::FailureClass;

    fn request(publish_at: Option<DateTime<Utc>>) -> UploadRequest {
        UploadRequest {
            file: PathBuf::from("videos/ai_facts.mp4"),
            title: "x".repeat(150),
            description: "<b>facts</b>".into(),
            tags: vec!["ai".into(), "facts".into()],
            category_id: "28".into(),
            privacy: Privacy::Public,
            notify_subscribers: false,
            publish_at,
        }
    }

    #[test]
    fn metadata_is_clipped_to_platform_limits() {
        let resource = video_resource(&request(None));
        assert_eq!(
            resource["snippet"]["title"].as_str().unwrap().chars().count(),
            MAX_TITLE_CHARS
        );
        assert_eq!(resource["snippet"]["description"], "bfacts/b");
        assert_eq!(resource["status"]["privacyStatus"], "public");
        assert!(resource["status"].get("publishAt").is_none());
    }

    #[test]
    fn scheduling_forces_private() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 18, 0, 0).unwrap();
        let resource = video_resource(&request(Some(at)));
        assert_eq!(resource["status"]["privacyStatus"], "private");
        assert_eq!(resource["status"]["publishAt"], "2026-03-01T18:00:00Z");
    }

    #[test]
    fn clipping_respects_char_boundaries() {
        let title = "é".repeat(120);
        assert_eq!(clip_text(&title, MAX_TITLE_CHARS).chars().count(), 100);
    }

    #[test]
    fn video_ids_are_read_from_links() {
        assert_eq!(
            video_id_from_link("https://youtu.be/dQw4w9WgXcQ").as_deref(),
            Some("dQw4w9WgXcQ")
        );
        assert_eq!(
            video_id_from_link("https://studio.youtube.com/video/dQw4w9WgXcQ/edit").as_deref(),
            Some("dQw4w9WgXcQ")
        );
        assert_eq!(video_id_from_link("https://studio.youtube.com/"), None);
    }

    #[tokio::test]
    async fn credentials_file_supplies_the_token() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("youtube.json"),
            r#"{"access_token": "ya29.token"}"#,
        )
        .unwrap();
        let provider = YoutubeApiProvider::new(
            reqwest::Client::new(),
            ProviderSection {
                credentials_file: Some("youtube.json".into()),
                endpoint: Some("https://www.googleapis.com".into()),
                ..ProviderSection::default()
            },
            dir.path().to_path_buf(),
        );
        assert_eq!(provider.access_token().await.unwrap(), "ya29.token");
    }

    fn studio_request(dir: &Path) -> UploadRequest {
        let file = dir.join("ai_facts.mp4");
        std::fs::write(&file, b"video").unwrap();
        UploadRequest {
            file,
            title: "AI Facts".into(),
            description: "Quick facts.".into(),
            tags: vec!["ai".into()],
            category_id: "28".into(),
            privacy: Privacy::Unlisted,
            notify_subscribers: false,
            publish_at: None,
        }
    }

    fn studio_web() -> WebContext {
        web_context(
            "youtube_studio",
            &[
                ("upload_button", "#upload-icon"),
                ("file_input", "input[type=file]"),
                ("title_input", "#title-textarea"),
                ("description_input", "#description-textarea"),
                ("next_button", "#next-button"),
                ("privacy_unlisted", "tp-yt-paper-radio-button[name=UNLISTED]"),
                ("video_link", "a.video-url-fadeable"),
                ("publish_button", "#done-button"),
            ],
        )
    }

    fn studio_page() -> FakePage {
        FakePage::with_present(&[
            "#upload-icon",
            "input[type=file]",
            "#title-textarea",
            "#description-textarea",
            "#next-button",
            "tp-yt-paper-radio-button[name=UNLISTED]",
            "a.video-url-fadeable",
            "#done-button",
        ])
    }

    #[tokio::test(start_paused = true)]
    async fn studio_failure_after_the_file_is_handed_over_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let request = studio_request(dir.path());
        let provider = YoutubeStudioProvider::new(studio_web());
        let page = studio_page();
        page.failing_clicks
            .lock()
            .unwrap()
            .insert("#next-button".to_string());

        let err = provider
            .publish(&page, &request, &ControlSignal::detached())
            .await
            .unwrap_err();

        assert_eq!(page.files.lock().unwrap().len(), 1);
        assert!(matches!(err, StageError::PublishUncertain(_)), "{err:?}");
        assert_eq!(err.classify(), FailureClass::Fatal);
        assert!(err.ends_stage());
    }

    #[tokio::test(start_paused = true)]
    async fn studio_failure_before_the_handover_stays_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let request = studio_request(dir.path());
        let provider = YoutubeStudioProvider::new(studio_web());
        let page = studio_page();
        page.failing_clicks
            .lock()
            .unwrap()
            .insert("#upload-icon".to_string());

        let err = provider
            .publish(&page, &request, &ControlSignal::detached())
            .await
            .unwrap_err();

        assert!(page.files.lock().unwrap().is_empty());
        assert!(matches!(err, StageError::ProviderUnavailable(_)), "{err:?}");
    }

    #[test]
    fn handover_keeps_stops_and_marks_everything_else_uncertain() {
        let kind = ProviderKind::YoutubeApi;
        assert!(after_handover(kind, StageError::Cancelled).is_cancelled());
        let crashed = after_handover(kind, StageError::BrowserCrash("ws closed".into()));
        assert!(matches!(crashed, StageError::PublishUncertain(_)));
        let outage = after_handover(kind, StageError::ProviderUnavailable("502".into()));
        assert_eq!(outage.kind_str(), "publish_uncertain");
    }
}
