use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveTime;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::browser::BrowserKind;
use crate::error::{ConfigError, Result};
use crate::provider::{ProviderKind, Transport};
use crate::run::{Privacy, StageKind, WorkflowMode};

/// Top-level pipeline configuration, usually `configs/autoreel.toml`.
///
/// Optional sections are only required by the stages that use them;
/// [`PipelineConfig::validate_for`] checks exactly what a mode needs and
/// never fills in defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PipelineConfig {
    pub paths: PathsSection,
    pub retry: RetrySection,
    pub stages: StagesSection,
    pub workflow: Option<WorkflowSection>,
    pub browser: Option<BrowserSection>,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSection>,
    pub video: Option<VideoSection>,
    pub upload: Option<UploadSection>,
    pub metadata: Option<MetadataSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub data_dir: String,
    pub run_db: String,
    pub upload_log_db: String,
    pub scripts_dir: Option<String>,
    pub videos_dir: Option<String>,
    pub downloads_dir: Option<String>,
    pub selectors_file: Option<String>,
    /// Failure screenshots from browser providers; none are taken when unset.
    pub screenshots_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowSection {
    pub prompt_template: String,
    pub max_words: u32,
    pub save_scripts: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrowserSection {
    pub primary: BrowserKind,
    pub fallback: Option<BrowserKind>,
    pub headless: bool,
    pub sandbox: bool,
    pub profile_dir: Option<String>,
    pub debug_attach: Option<String>,
    pub wait_timeout_seconds: u64,
    pub page_load_timeout_seconds: u64,
    pub poll_interval_ms: u64,
    pub retry_attempts: u32,
    pub keep_alive_between_stages: bool,
    #[serde(default)]
    pub executables: ExecutablesSection,
}

impl BrowserSection {
    pub fn preference(&self) -> Vec<BrowserKind> {
        let mut order = vec![self.primary];
        if let Some(fallback) = self.fallback {
            order.push(fallback);
        }
        order
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_seconds)
    }

    pub fn page_load_timeout(&self) -> Duration {
        Duration::from_secs(self.page_load_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutablesSection {
    pub chrome: Option<String>,
    pub edge: Option<String>,
    pub chromium: Option<String>,
}

impl ExecutablesSection {
    pub fn for_kind(&self, kind: BrowserKind) -> Option<&str> {
        match kind {
            BrowserKind::Chrome => self.chrome.as_deref(),
            BrowserKind::Edge => self.edge.as_deref(),
            BrowserKind::Chromium => self.chromium.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StagesSection {
    pub script: Option<StageSection>,
    pub video: Option<StageSection>,
    pub upload: Option<StageSection>,
}

impl StagesSection {
    pub fn for_stage(&self, stage: StageKind) -> Option<&StageSection> {
        match stage {
            StageKind::Script => self.script.as_ref(),
            StageKind::Video => self.video.as_ref(),
            StageKind::Upload => self.upload.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StageSection {
    pub providers: Vec<ProviderKind>,
}

/// Connection parameters for one provider, keyed by provider kind in
/// `[providers.<kind>]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderSection {
    pub api_key_env: Option<String>,
    pub credentials_file: Option<String>,
    pub endpoint: Option<String>,
    pub target_url: Option<String>,
    pub site: Option<String>,
    pub model: Option<String>,
    pub response_timeout_seconds: Option<u64>,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VideoSection {
    pub style: Option<String>,
    pub voice: Option<String>,
    pub resolution: String,
    pub framerate: Option<u32>,
    pub render_timeout_seconds: u64,
}

impl VideoSection {
    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadSection {
    pub privacy: Privacy,
    pub category_id: String,
    pub notify_subscribers: bool,
    pub schedule: ScheduleSection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulePolicy {
    Immediate,
    DailyAt,
    Delay,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleSection {
    pub policy: SchedulePolicy,
    pub time: Option<String>,
    pub hours: Option<u32>,
}

impl ScheduleSection {
    pub fn daily_time(&self) -> Result<NaiveTime> {
        let raw = self
            .time
            .as_deref()
            .ok_or_else(|| ConfigError::missing("upload.schedule.time"))?;
        NaiveTime::parse_from_str(raw, "%H:%M")
            .map_err(|err| ConfigError::invalid("upload.schedule.time", err.to_string()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataSection {
    pub default_title: String,
    pub default_description: String,
    pub default_tags: Vec<String>,
}

impl PipelineConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    pub fn run_db_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.run_db)
    }

    pub fn upload_log_path(&self) -> PathBuf {
        self.resolve_path(&self.paths.upload_log_db)
    }

    pub fn require_path(&self, value: &Option<String>, field: &str) -> Result<PathBuf> {
        value
            .as_ref()
            .map(|dir| self.resolve_path(dir))
            .ok_or_else(|| ConfigError::missing(field))
    }

    pub fn provider(&self, kind: ProviderKind) -> Option<&ProviderSection> {
        self.providers.get(kind.as_str())
    }

    pub fn require_provider(&self, kind: ProviderKind) -> Result<&ProviderSection> {
        self.provider(kind)
            .ok_or_else(|| ConfigError::missing(format!("providers.{}", kind.as_str())))
    }

    pub fn require_browser(&self) -> Result<&BrowserSection> {
        self.browser
            .as_ref()
            .ok_or_else(|| ConfigError::missing("browser"))
    }

    pub fn require_workflow(&self) -> Result<&WorkflowSection> {
        self.workflow
            .as_ref()
            .ok_or_else(|| ConfigError::missing("workflow"))
    }

    pub fn require_metadata(&self) -> Result<&MetadataSection> {
        self.metadata
            .as_ref()
            .ok_or_else(|| ConfigError::missing("metadata"))
    }

    pub fn require_video(&self) -> Result<&VideoSection> {
        self.video.as_ref().ok_or_else(|| ConfigError::missing("video"))
    }

    pub fn require_upload(&self) -> Result<&UploadSection> {
        self.upload
            .as_ref()
            .ok_or_else(|| ConfigError::missing("upload"))
    }

    /// Providers configured for `stage`, in preference order.
    pub fn stage_providers(&self, stage: StageKind) -> Result<&[ProviderKind]> {
        let field = format!("stages.{}.providers", stage.as_str());
        let section = self
            .stages
            .for_stage(stage)
            .ok_or_else(|| ConfigError::missing(field.clone()))?;
        if section.providers.is_empty() {
            return Err(ConfigError::missing(field));
        }
        Ok(&section.providers)
    }

    pub fn uses_browser(&self, mode: WorkflowMode) -> bool {
        mode.stages().iter().any(|stage| {
            self.stage_providers(*stage)
                .map(|providers| {
                    providers
                        .iter()
                        .any(|kind| kind.transport() == Transport::Browser)
                })
                .unwrap_or(false)
        })
    }

    /// Fails fast on the first setting `mode` needs that is absent or
    /// inconsistent.
    pub fn validate_for(&self, mode: WorkflowMode) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "retry.max_attempts",
                "must be at least 1",
            ));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::invalid(
                "retry.max_delay_ms",
                "must not be lower than retry.base_delay_ms",
            ));
        }

        for stage in mode.stages() {
            let providers = self.stage_providers(*stage)?;
            for (idx, kind) in providers.iter().enumerate() {
                if kind.stage() != *stage {
                    return Err(ConfigError::invalid(
                        format!("stages.{}.providers[{idx}]", stage.as_str()),
                        format!("{kind} cannot satisfy the {stage} stage"),
                    ));
                }
                if providers[..idx].contains(kind) {
                    return Err(ConfigError::invalid(
                        format!("stages.{}.providers[{idx}]", stage.as_str()),
                        format!("{kind} listed more than once"),
                    ));
                }
                self.validate_provider(*kind)?;
            }
            self.validate_stage(*stage)?;
        }

        if self.uses_browser(mode) {
            self.validate_browser()?;
        }
        Ok(())
    }

    fn validate_stage(&self, stage: StageKind) -> Result<()> {
        match stage {
            StageKind::Script => {
                let workflow = self.require_workflow()?;
                if !workflow.prompt_template.contains("{topic}") {
                    return Err(ConfigError::invalid(
                        "workflow.prompt_template",
                        "missing {topic} placeholder",
                    ));
                }
                if workflow.max_words == 0 {
                    return Err(ConfigError::invalid(
                        "workflow.max_words",
                        "must be at least 1",
                    ));
                }
                if workflow.save_scripts {
                    self.require_path(&self.paths.scripts_dir, "paths.scripts_dir")?;
                }
                self.require_metadata()?;
            }
            StageKind::Video => {
                self.require_video()?;
                self.require_path(&self.paths.videos_dir, "paths.videos_dir")?;
                self.require_metadata()?;
            }
            StageKind::Upload => {
                let upload = self.require_upload()?;
                match upload.schedule.policy {
                    SchedulePolicy::Immediate => {}
                    SchedulePolicy::DailyAt => {
                        upload.schedule.daily_time()?;
                    }
                    SchedulePolicy::Delay => {
                        if upload.schedule.hours.is_none() {
                            return Err(ConfigError::missing("upload.schedule.hours"));
                        }
                    }
                }
                self.require_metadata()?;
            }
        }
        Ok(())
    }

    fn validate_provider(&self, kind: ProviderKind) -> Result<()> {
        if kind == ProviderKind::Template {
            return Ok(());
        }
        let section = self.require_provider(kind)?;
        let field = |name: &str| format!("providers.{}.{name}", kind.as_str());
        let require = |value: &Option<String>, name: &str| -> Result<()> {
            match value {
                Some(v) if !v.trim().is_empty() => Ok(()),
                _ => Err(ConfigError::missing(field(name))),
            }
        };

        let needs_response_timeout = matches!(kind.transport(), Transport::Api)
            || matches!(kind, ProviderKind::ChatgptWeb | ProviderKind::GrokWeb);
        if needs_response_timeout && section.response_timeout_seconds.unwrap_or(0) == 0 {
            return Err(ConfigError::missing(field("response_timeout_seconds")));
        }

        match kind.transport() {
            Transport::Api => {
                require(&section.endpoint, "endpoint")?;
                match kind {
                    ProviderKind::YoutubeApi => {
                        if section.api_key_env.is_none() && section.credentials_file.is_none() {
                            return Err(ConfigError::missing(field(
                                "api_key_env|credentials_file",
                            )));
                        }
                    }
                    ProviderKind::GeminiApi | ProviderKind::OpenAiApi => {
                        require(&section.api_key_env, "api_key_env")?;
                        require(&section.model, "model")?;
                    }
                    _ => require(&section.api_key_env, "api_key_env")?,
                }
                if let Some(endpoint) = &section.endpoint {
                    url::Url::parse(endpoint)
                        .map_err(|err| ConfigError::invalid(field("endpoint"), err.to_string()))?;
                }
            }
            Transport::Browser => {
                require(&section.target_url, "target_url")?;
                require(&section.site, "site")?;
                if let Some(target) = &section.target_url {
                    url::Url::parse(target).map_err(|err| {
                        ConfigError::invalid(field("target_url"), err.to_string())
                    })?;
                }
                self.require_path(&self.paths.selectors_file, "paths.selectors_file")?;
                if kind == ProviderKind::CapcutWeb {
                    self.require_path(&self.paths.downloads_dir, "paths.downloads_dir")?;
                }
            }
            Transport::Local => {}
        }
        Ok(())
    }

    fn validate_browser(&self) -> Result<()> {
        let browser = self.require_browser()?;
        if browser.fallback == Some(browser.primary) {
            return Err(ConfigError::invalid(
                "browser.fallback",
                "must differ from browser.primary",
            ));
        }
        if browser.profile_dir.is_some() && browser.debug_attach.is_some() {
            return Err(ConfigError::invalid(
                "browser.debug_attach",
                "cannot be combined with browser.profile_dir",
            ));
        }
        if browser.wait_timeout_seconds == 0 || browser.page_load_timeout_seconds == 0 {
            return Err(ConfigError::invalid(
                "browser.wait_timeout_seconds",
                "timeouts must be greater than zero",
            ));
        }
        if browser.poll_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "browser.poll_interval_ms",
                "must be greater than zero",
            ));
        }
        if browser.retry_attempts == 0 {
            return Err(ConfigError::invalid(
                "browser.retry_attempts",
                "must be at least 1",
            ));
        }
        if browser.primary == BrowserKind::Edge && browser.executables.edge.is_none() {
            return Err(ConfigError::missing("browser.executables.edge"));
        }
        Ok(())
    }
}

fn load_toml<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

pub fn load_pipeline_config<P: AsRef<Path>>(path: P) -> Result<PipelineConfig> {
    load_toml(path.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[paths]
base_dir = "/srv/autoreel"
data_dir = "data"
run_db = "data/runs.sqlite"
upload_log_db = "data/uploads.sqlite"
scripts_dir = "scripts"
videos_dir = "videos"
downloads_dir = "downloads"
selectors_file = "configs/selectors.json"

[workflow]
prompt_template = "Write a short video script about {topic}."
max_words = 300
save_scripts = true

[retry]
max_attempts = 3
base_delay_ms = 500
max_delay_ms = 8000
jitter_ms = 250

[browser]
primary = "chrome"
fallback = "chromium"
headless = true
sandbox = false
wait_timeout_seconds = 30
page_load_timeout_seconds = 60
poll_interval_ms = 500
retry_attempts = 2
keep_alive_between_stages = true

[stages.script]
providers = ["gemini_api", "chatgpt_web", "template"]

[stages.video]
providers = ["render_api", "capcut_web"]

[stages.upload]
providers = ["youtube_api"]

[providers.gemini_api]
api_key_env = "GEMINI_API_KEY"
endpoint = "https://generativelanguage.googleapis.com"
model = "gemini-pro"
response_timeout_seconds = 60

[providers.chatgpt_web]
target_url = "https://chat.openai.com/"
site = "chatgpt"
response_timeout_seconds = 120

[providers.render_api]
api_key_env = "RENDER_API_KEY"
endpoint = "https://render.example.com"
response_timeout_seconds = 60

[providers.capcut_web]
target_url = "https://www.capcut.com/editor"
site = "capcut"

[providers.youtube_api]
endpoint = "https://www.googleapis.com"
credentials_file = "credentials/youtube_token.json"
response_timeout_seconds = 300

[video]
style = "documentary"
voice = "narrator"
resolution = "1080p"
framerate = 30
render_timeout_seconds = 900

[upload]
privacy = "unlisted"
category_id = "22"
notify_subscribers = false

[upload.schedule]
policy = "daily_at"
time = "18:00"

[metadata]
default_title = "Untitled"
default_description = "Generated video"
default_tags = ["shorts"]
"#;

    fn sample() -> PipelineConfig {
        toml::from_str(SAMPLE).unwrap()
    }

    #[test]
    fn parses_sample_and_validates_every_mode() {
        let config = sample();
        for mode in WorkflowMode::ALL {
            config.validate_for(mode).unwrap();
        }
        assert_eq!(
            config.browser.as_ref().unwrap().preference(),
            vec![BrowserKind::Chrome, BrowserKind::Chromium]
        );
        assert_eq!(
            config.run_db_path(),
            PathBuf::from("/srv/autoreel/data/runs.sqlite")
        );
    }

    #[test]
    fn missing_stage_providers_fail_only_for_modes_that_need_them() {
        let mut config = sample();
        config.stages.upload = None;
        config.validate_for(WorkflowMode::ScriptAndVideo).unwrap();
        let err = config.validate_for(WorkflowMode::FullAuto).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { ref field } if field == "stages.upload.providers"));
    }

    #[test]
    fn provider_for_wrong_stage_is_rejected() {
        let mut config = sample();
        config.stages.video = Some(StageSection {
            providers: vec![ProviderKind::GeminiApi],
        });
        let err = config.validate_for(WorkflowMode::VideoOnly).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn browser_provider_requires_browser_section() {
        let mut config = sample();
        config.browser = None;
        config.validate_for(WorkflowMode::UploadOnly).unwrap();
        let err = config.validate_for(WorkflowMode::ScriptOnly).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { ref field } if field == "browser"));
    }

    #[test]
    fn api_provider_without_credentials_is_missing() {
        let mut config = sample();
        if let Some(section) = config.providers.get_mut("gemini_api") {
            section.api_key_env = None;
        }
        let err = config.validate_for(WorkflowMode::ScriptOnly).unwrap_err();
        assert!(
            matches!(err, ConfigError::Missing { ref field } if field == "providers.gemini_api.api_key_env")
        );
    }

    #[test]
    fn provider_timeouts_are_never_assumed() {
        let mut config = sample();
        if let Some(section) = config.providers.get_mut("chatgpt_web") {
            section.response_timeout_seconds = None;
        }
        let err = config.validate_for(WorkflowMode::ScriptOnly).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Missing { ref field } if field == "providers.chatgpt_web.response_timeout_seconds"
        ));

        let mut config = sample();
        if let Some(section) = config.providers.get_mut("gemini_api") {
            section.model = None;
        }
        let err = config.validate_for(WorkflowMode::ScriptOnly).unwrap_err();
        assert!(
            matches!(err, ConfigError::Missing { ref field } if field == "providers.gemini_api.model")
        );
    }

    #[test]
    fn daily_schedule_requires_parseable_time() {
        let mut config = sample();
        if let Some(upload) = config.upload.as_mut() {
            upload.schedule.time = Some("6pm".into());
        }
        let err = config.validate_for(WorkflowMode::UploadOnly).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
