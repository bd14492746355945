use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::browser::PageDriver;
use crate::config::ProviderSection;
use crate::control::ControlSignal;
use crate::stage::StageError;

use super::http::{check_status, endpoint, response_timeout, secret_from_env};
use super::web::WebContext;
use super::{ProviderKind, StageProvider};

const RENDER_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DOWNLOAD_POLL_INTERVAL: Duration = Duration::from_secs(1);
const OVERLAY_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct VideoRequest {
    pub script_text: String,
    pub title: String,
    pub style: Option<String>,
    pub voice: Option<String>,
    pub resolution: String,
    pub framerate: Option<u32>,
    pub videos_dir: PathBuf,
    pub render_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedVideo {
    pub path: PathBuf,
    pub duration_seconds: Option<f64>,
    pub resolution: Option<String>,
    pub style: Option<String>,
}

/// Lowercase, filesystem-safe stem derived from a video title.
pub(crate) fn sanitize_file_stem(title: &str) -> String {
    let mut stem = String::new();
    let mut last_sep = true;
    for ch in title.trim().chars() {
        if ch.is_alphanumeric() {
            stem.extend(ch.to_lowercase());
            last_sep = false;
        } else if !last_sep && (ch.is_whitespace() || matches!(ch, '-' | '_' | '.')) {
            stem.push('_');
            last_sep = true;
        }
        if stem.chars().count() >= 80 {
            break;
        }
    }
    let stem = stem.trim_end_matches('_').to_string();
    if stem.is_empty() {
        "video".to_string()
    } else {
        stem
    }
}

/// `dir/stem.ext`, or `dir/stem-N.ext` for the first free N.
pub(crate) fn unique_destination(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    let first = dir.join(format!("{stem}.{ext}"));
    if !first.exists() {
        return first;
    }
    (2u32..)
        .map(|n| dir.join(format!("{stem}-{n}.{ext}")))
        .find(|candidate| !candidate.exists())
        .unwrap_or(first)
}

/// Moves a finished file into place, copying when a rename crosses devices.
pub(crate) async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(err) => {
            debug!(error = %err, "rename failed, copying instead");
            tokio::fs::copy(from, to).await?;
            tokio::fs::remove_file(from).await
        }
    }
}

pub struct RenderApiProvider {
    client: reqwest::Client,
    section: ProviderSection,
}

impl RenderApiProvider {
    pub fn new(client: reqwest::Client, section: ProviderSection) -> Self {
        Self { client, section }
    }
}

#[derive(Debug, Deserialize)]
struct RenderJob {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RenderStatus {
    status: String,
    download_url: Option<String>,
    duration_seconds: Option<f64>,
    error: Option<String>,
}

#[async_trait]
impl StageProvider<VideoRequest, RenderedVideo> for RenderApiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::RenderApi
    }

    async fn execute(
        &self,
        request: &VideoRequest,
        signal: &ControlSignal,
    ) -> Result<RenderedVideo, StageError> {
        let kind = self.kind();
        let key = secret_from_env(kind, self.section.api_key_env.as_deref())?;
        let base = endpoint(kind, &self.section)?;
        let timeout = response_timeout(kind, &self.section)?;

        let response = self
            .client
            .post(format!("{base}/renders"))
            .bearer_auth(&key)
            .timeout(timeout)
            .json(&json!({
                "script": request.script_text,
                "title": request.title,
                "style": request.style,
                "voice": request.voice,
                "resolution": request.resolution,
                "framerate": request.framerate,
            }))
            .send()
            .await?;
        let job: RenderJob = check_status(kind, response).await?.json().await?;
        info!(provider = %kind, job = %job.id, "render submitted");

        let deadline = Instant::now() + request.render_timeout;
        let finished = loop {
            signal.checkpoint()?;
            let response = self
                .client
                .get(format!("{base}/renders/{}", job.id))
                .bearer_auth(&key)
                .timeout(timeout)
                .send()
                .await?;
            let status: RenderStatus = check_status(kind, response).await?.json().await?;
            match status.status.as_str() {
                "done" | "completed" | "succeeded" => break status,
                "failed" | "error" => {
                    return Err(StageError::ProviderUnavailable(format!(
                        "render {} failed: {}",
                        job.id,
                        status.error.unwrap_or_else(|| "no reason given".into())
                    )));
                }
                other => debug!(provider = %kind, job = %job.id, status = other, "render pending"),
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(StageError::ProviderUnavailable(format!(
                    "render {} not finished after {}s",
                    job.id,
                    request.render_timeout.as_secs()
                )));
            }
            signal
                .sleep(RENDER_POLL_INTERVAL.min(deadline - now))
                .await?;
        };

        let url = finished.download_url.ok_or_else(|| {
            StageError::Unexpected(format!("render {} finished without a download url", job.id))
        })?;
        tokio::fs::create_dir_all(&request.videos_dir).await?;
        let destination = unique_destination(
            &request.videos_dir,
            &sanitize_file_stem(&request.title),
            "mp4",
        );
        let response = self.client.get(&url).bearer_auth(&key).send().await?;
        let stream = check_status(kind, response).await?.bytes_stream();
        save_stream(stream, &destination, signal).await?;
        info!(provider = %kind, path = %destination.display(), "render downloaded");

        Ok(RenderedVideo {
            path: destination,
            duration_seconds: finished.duration_seconds,
            resolution: Some(request.resolution.clone()),
            style: request.style.clone(),
        })
    }
}

/// Streams into `<destination>.part`, then renames into place. The partial
/// file never outlives a failed or stopped download.
pub(crate) async fn save_stream<S, B, E>(
    stream: S,
    destination: &Path,
    signal: &ControlSignal,
) -> Result<(), StageError>
where
    S: futures::Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    StageError: From<E>,
{
    let partial = destination.with_extension("mp4.part");
    let written = async {
        let mut stream = std::pin::pin!(stream);
        let mut file = tokio::fs::File::create(&partial).await?;
        while let Some(chunk) = stream.next().await {
            signal.checkpoint()?;
            file.write_all(chunk?.as_ref()).await?;
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&partial, destination).await?;
        Ok::<(), StageError>(())
    }
    .await;
    if written.is_err() {
        discard_partial(&partial).await;
    }
    written
}

async fn discard_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed partial download"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove partial download"),
    }
}

/// CapCut's script-to-video editor driven through the browser. The export is
/// picked up from the browser download directory and moved into
/// `videos_dir`.
pub struct CapcutWebProvider {
    web: WebContext,
    downloads_dir: PathBuf,
}

impl CapcutWebProvider {
    pub fn new(web: WebContext, downloads_dir: PathBuf) -> Self {
        Self { web, downloads_dir }
    }

    /// Runs the editor up to a finished download and returns its path.
    async fn render(
        &self,
        page: &dyn PageDriver,
        request: &VideoRequest,
        signal: &ControlSignal,
    ) -> Result<PathBuf, StageError> {
        let web = &self.web;
        let downloads = self.downloads_dir.as_path();
        page.set_download_dir(downloads).await?;
        page.goto(&web.target_url).await?;
        for overlay in ["cookie_accept_button", "login_popup_close_button", "try_it_button"] {
            web.click_optional(page, overlay, OVERLAY_WAIT, signal).await?;
        }

        if let Some(style) = &request.style {
            web.click_if_defined(page, "style_menu", signal).await?;
            web.fill_if_defined(page, "style_input", style, signal).await?;
        }
        if let Some(voice) = &request.voice {
            web.click_if_defined(page, "voice_menu", signal).await?;
            web.fill_if_defined(page, "voice_input", voice, signal).await?;
        }
        web.fill(page, "script_input", &request.script_text, signal)
            .await?;
        web.click(page, "generate_button", signal).await?;

        let export = web
            .locate_within(page, "export_button", request.render_timeout, signal)
            .await?;
        self.add_captions(page, signal).await?;

        let before = mp4_files(downloads)?;
        page.click(&export).await?;
        self.choose_export_settings(page, request, signal).await?;
        web.click(page, "confirm_export_button", signal).await?;

        wait_for_download(downloads, &before, request.render_timeout, signal).await
    }

    /// Captions only run when the site defines both controls; a control that
    /// does not respond skips them.
    async fn add_captions(
        &self,
        page: &dyn PageDriver,
        signal: &ControlSignal,
    ) -> Result<bool, StageError> {
        let web = &self.web;
        if !web.has_action("captions_menu_button") || !web.has_action("captions_choice_option") {
            debug!(site = %web.site, "no captions controls configured");
            return Ok(false);
        }
        if !web
            .click_optional(page, "captions_menu_button", web.wait_timeout, signal)
            .await?
        {
            warn!(site = %web.site, "captions menu not available, skipping captions");
            return Ok(false);
        }
        let added = web
            .click_optional(page, "captions_choice_option", web.wait_timeout, signal)
            .await?;
        if added {
            info!(site = %web.site, "captions added");
        } else {
            warn!(site = %web.site, "caption style not available, skipping captions");
        }
        Ok(added)
    }

    /// Export options are keyed by value: `resolution_option_1080p`,
    /// `framerate_option_30`.
    async fn choose_export_settings(
        &self,
        page: &dyn PageDriver,
        request: &VideoRequest,
        signal: &ControlSignal,
    ) -> Result<(), StageError> {
        let web = &self.web;
        let mut choices = vec![(
            "resolution_dropdown",
            format!("resolution_option_{}", request.resolution),
        )];
        if let Some(fps) = request.framerate {
            choices.push(("framerate_dropdown", format!("framerate_option_{fps}")));
        }
        for (dropdown, option) in choices {
            if !web.has_action(&option) {
                return Err(StageError::Configuration(format!(
                    "{} defines no `{option}` selector",
                    web.site
                )));
            }
            web.click_if_defined(page, dropdown, signal).await?;
            web.click(page, &option, signal).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl StageProvider<VideoRequest, RenderedVideo> for CapcutWebProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::CapcutWeb
    }

    async fn execute(
        &self,
        request: &VideoRequest,
        signal: &ControlSignal,
    ) -> Result<RenderedVideo, StageError> {
        let web = &self.web;
        tokio::fs::create_dir_all(&self.downloads_dir).await?;

        let downloaded = web
            .sessions
            .with_session(|session| async move {
                let page = session.page();
                let result = self.render(page, request, signal).await;
                web.diagnose(page, "render", result).await
            })
            .await?;

        let destination = unique_destination(
            &request.videos_dir,
            &sanitize_file_stem(&request.title),
            "mp4",
        );
        move_file(&downloaded, &destination).await?;
        info!(
            provider = %self.kind(),
            path = %destination.display(),
            "export moved into videos dir"
        );
        Ok(RenderedVideo {
            path: destination,
            duration_seconds: None,
            resolution: Some(request.resolution.clone()),
            style: request.style.clone(),
        })
    }
}

fn mp4_files(dir: &Path) -> std::io::Result<HashSet<PathBuf>> {
    let mut found = HashSet::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map(|ext| ext == "mp4").unwrap_or(false) {
            found.insert(path);
        }
    }
    Ok(found)
}

fn download_in_progress(dir: &Path) -> std::io::Result<bool> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path
            .extension()
            .map(|ext| ext == "crdownload" || ext == "part")
            .unwrap_or(false)
        {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Polls `dir` for an `.mp4` not in `before` once no partial download is
/// left, bounded by `limit`.
pub(crate) async fn wait_for_download(
    dir: &Path,
    before: &HashSet<PathBuf>,
    limit: Duration,
    signal: &ControlSignal,
) -> Result<PathBuf, StageError> {
    let deadline = Instant::now() + limit;
    loop {
        signal.checkpoint()?;
        if !download_in_progress(dir)? {
            let mut fresh: Vec<PathBuf> = mp4_files(dir)?.difference(before).cloned().collect();
            fresh.sort();
            if let Some(path) = fresh.pop() {
                if !fresh.is_empty() {
                    warn!(count = fresh.len() + 1, "several new downloads, taking the last");
                }
                return Ok(path);
            }
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(StageError::ProviderUnavailable(format!(
                "no finished download in {} after {}s",
                dir.display(),
                limit.as_secs()
            )));
        }
        signal
            .sleep(DOWNLOAD_POLL_INTERVAL.min(deadline - now))
            .await?;
    }
}
