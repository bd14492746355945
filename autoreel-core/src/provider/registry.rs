use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::browser::{BrowserSessionManager, ElementLocator, SelectorCatalog};
use crate::config::PipelineConfig;
use crate::error::{ConfigError, Result};
use crate::retry::RetryPolicy;
use crate::run::StageKind;

use super::script::{ChatWebProvider, GeminiProvider, OpenAiProvider, TemplateProvider};
use super::upload::{YoutubeApiProvider, YoutubeStudioProvider};
use super::video::{CapcutWebProvider, RenderApiProvider};
use super::web::WebContext;
use super::{
    GeneratedScript, ProviderKind, ProviderStrategy, RenderedVideo, ScriptProvider,
    ScriptRequest, StageProvider, Transport, UploadProvider, UploadReceipt, UploadRequest,
    VideoProvider, VideoRequest,
};

/// Builds the provider strategy of each stage from validated configuration.
/// Kinds are resolved once per strategy through a closed match.
#[derive(Clone)]
pub struct ProviderRegistry {
    config: Arc<PipelineConfig>,
    http: reqwest::Client,
    sessions: Option<Arc<BrowserSessionManager>>,
    selectors: Arc<SelectorCatalog>,
}

impl ProviderRegistry {
    pub fn new(
        config: Arc<PipelineConfig>,
        sessions: Option<Arc<BrowserSessionManager>>,
        selectors: Arc<SelectorCatalog>,
    ) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            sessions,
            selectors,
        }
    }

    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Retry budget for one provider: its own `max_attempts`, else the
    /// browser budget for web providers, else the global one.
    pub fn policy_for(&self, kind: ProviderKind) -> RetryPolicy {
        let policy = RetryPolicy::from_config(&self.config.retry);
        let override_attempts = self
            .config
            .provider(kind)
            .and_then(|section| section.max_attempts);
        match (override_attempts, kind.transport(), &self.config.browser) {
            (Some(attempts), _, _) => policy.with_max_attempts(attempts),
            (None, Transport::Browser, Some(browser)) => {
                policy.with_max_attempts(browser.retry_attempts)
            }
            _ => policy,
        }
    }

    pub fn script_strategy(&self) -> Result<ProviderStrategy<ScriptRequest, GeneratedScript>> {
        self.strategy_for(StageKind::Script, |kind| self.script_provider(kind))
    }

    pub fn video_strategy(&self) -> Result<ProviderStrategy<VideoRequest, RenderedVideo>> {
        self.strategy_for(StageKind::Video, |kind| self.video_provider(kind))
    }

    pub fn upload_strategy(&self) -> Result<ProviderStrategy<UploadRequest, UploadReceipt>> {
        self.strategy_for(StageKind::Upload, |kind| self.upload_provider(kind))
    }

    fn strategy_for<Req, Out, F>(
        &self,
        stage: StageKind,
        build: F,
    ) -> Result<ProviderStrategy<Req, Out>>
    where
        Req: Send + Sync,
        Out: Send,
        F: Fn(ProviderKind) -> Result<Arc<dyn StageProvider<Req, Out>>>,
    {
        let mut strategy = ProviderStrategy::new(stage);
        for kind in self.config.stage_providers(stage)? {
            if kind.stage() != stage {
                return Err(wrong_stage(*kind, stage));
            }
            strategy = strategy.with_provider(build(*kind)?, self.policy_for(*kind));
        }
        Ok(strategy)
    }

    fn script_provider(&self, kind: ProviderKind) -> Result<Arc<ScriptProvider>> {
        let provider: Arc<ScriptProvider> = match kind {
            ProviderKind::GeminiApi => Arc::new(GeminiProvider::new(
                self.http.clone(),
                self.config.require_provider(kind)?.clone(),
            )),
            ProviderKind::OpenAiApi => Arc::new(OpenAiProvider::new(
                self.http.clone(),
                self.config.require_provider(kind)?.clone(),
            )),
            ProviderKind::ChatgptWeb | ProviderKind::GrokWeb => {
                let timeout = self
                    .config
                    .require_provider(kind)?
                    .response_timeout_seconds
                    .map(Duration::from_secs)
                    .ok_or_else(|| {
                        ConfigError::missing(format!(
                            "providers.{}.response_timeout_seconds",
                            kind.as_str()
                        ))
                    })?;
                Arc::new(ChatWebProvider::new(kind, self.web_context(kind)?, timeout))
            }
            ProviderKind::Template => Arc::new(TemplateProvider::new()),
            other => return Err(wrong_stage(other, StageKind::Script)),
        };
        Ok(provider)
    }

    fn video_provider(&self, kind: ProviderKind) -> Result<Arc<VideoProvider>> {
        let provider: Arc<VideoProvider> = match kind {
            ProviderKind::RenderApi => Arc::new(RenderApiProvider::new(
                self.http.clone(),
                self.config.require_provider(kind)?.clone(),
            )),
            ProviderKind::CapcutWeb => {
                let downloads = self
                    .config
                    .require_path(&self.config.paths.downloads_dir, "paths.downloads_dir")?;
                Arc::new(CapcutWebProvider::new(self.web_context(kind)?, downloads))
            }
            other => return Err(wrong_stage(other, StageKind::Video)),
        };
        Ok(provider)
    }

    fn upload_provider(&self, kind: ProviderKind) -> Result<Arc<UploadProvider>> {
        let provider: Arc<UploadProvider> = match kind {
            ProviderKind::YoutubeApi => Arc::new(YoutubeApiProvider::new(
                self.http.clone(),
                self.config.require_provider(kind)?.clone(),
                PathBuf::from(&self.config.paths.base_dir),
            )),
            ProviderKind::YoutubeStudioWeb => {
                Arc::new(YoutubeStudioProvider::new(self.web_context(kind)?))
            }
            other => return Err(wrong_stage(other, StageKind::Upload)),
        };
        Ok(provider)
    }

    fn web_context(&self, kind: ProviderKind) -> Result<WebContext> {
        let section = self.config.require_provider(kind)?;
        let browser = self.config.require_browser()?;
        let sessions = self.sessions.clone().ok_or_else(|| {
            ConfigError::invalid(
                format!("providers.{}", kind.as_str()),
                "browser provider configured without a browser session manager",
            )
        })?;
        let field = |name: &str| format!("providers.{}.{name}", kind.as_str());
        Ok(WebContext {
            sessions,
            selectors: Arc::clone(&self.selectors),
            locator: ElementLocator::new(browser.poll_interval()),
            site: section
                .site
                .clone()
                .ok_or_else(|| ConfigError::missing(field("site")))?,
            target_url: section
                .target_url
                .clone()
                .ok_or_else(|| ConfigError::missing(field("target_url")))?,
            wait_timeout: browser.wait_timeout().max(Duration::from_millis(1)),
            screenshots_dir: self
                .config
                .paths
                .screenshots_dir
                .as_ref()
                .map(|dir| self.config.resolve_path(dir)),
        })
    }
}

fn wrong_stage(kind: ProviderKind, stage: StageKind) -> ConfigError {
    ConfigError::invalid(
        format!("stages.{}.providers", stage.as_str()),
        format!("{kind} cannot satisfy the {stage} stage"),
    )
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("browser", &self.sessions.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[paths]
base_dir = "/tmp/autoreel"
data_dir = "data"
run_db = "data/runs.sqlite"
upload_log_db = "data/uploads.sqlite"
videos_dir = "videos"
downloads_dir = "downloads"
selectors_file = "selectors.json"

[retry]
max_attempts = 4
base_delay_ms = 100
max_delay_ms = 1000
jitter_ms = 0

[browser]
primary = "chrome"
headless = true
sandbox = true
wait_timeout_seconds = 10
page_load_timeout_seconds = 30
poll_interval_ms = 250
retry_attempts = 2
keep_alive_between_stages = true

[stages.script]
providers = ["gemini_api", "template"]

[stages.video]
providers = ["render_api", "capcut_web"]

[providers.gemini_api]
api_key_env = "GEMINI_API_KEY"
endpoint = "https://generativelanguage.googleapis.com"
model = "gemini-pro"
max_attempts = 2

[providers.render_api]
api_key_env = "RENDER_API_KEY"
endpoint = "https://render.example.com"

[providers.capcut_web]
target_url = "https://www.capcut.com/editor"
site = "capcut"
"#;

    fn config() -> Arc<PipelineConfig> {
        Arc::new(toml::from_str(CONFIG).unwrap())
    }

    #[test]
    fn strategies_follow_configured_order() {
        let registry = ProviderRegistry::new(config(), None, Arc::default());
        let script = registry.script_strategy().unwrap();
        assert_eq!(
            script.kinds(),
            vec![ProviderKind::GeminiApi, ProviderKind::Template]
        );
    }

    #[test]
    fn retry_budget_prefers_provider_then_browser_then_global() {
        let registry = ProviderRegistry::new(config(), None, Arc::default());
        assert_eq!(registry.policy_for(ProviderKind::GeminiApi).max_attempts(), 2);
        assert_eq!(registry.policy_for(ProviderKind::CapcutWeb).max_attempts(), 2);
        assert_eq!(registry.policy_for(ProviderKind::RenderApi).max_attempts(), 4);
    }

    #[test]
    fn web_provider_needs_a_session_manager() {
        let registry = ProviderRegistry::new(config(), None, Arc::default());
        let err = registry.video_strategy().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn unconfigured_stage_is_missing() {
        let registry = ProviderRegistry::new(config(), None, Arc::default());
        let err = registry.upload_strategy().unwrap_err();
        assert!(matches!(err, ConfigError::Missing { ref field } if field == "stages.upload.providers"));
    }
}
