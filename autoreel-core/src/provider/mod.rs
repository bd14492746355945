mod http;
mod registry;
mod script;
mod upload;
mod video;
mod web;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::control::ControlSignal;
use crate::retry::{ExecutionAttempt, RetryPolicy};
use crate::run::StageKind;
use crate::stage::{StageError, StageFailure};

pub use registry::ProviderRegistry;
pub use script::{
    ChatWebProvider, GeminiProvider, GeneratedScript, OpenAiProvider, ScriptRequest,
    TemplateProvider,
};
pub use upload::{UploadReceipt, UploadRequest, YoutubeApiProvider, YoutubeStudioProvider};
pub use video::{CapcutWebProvider, RenderApiProvider, RenderedVideo, VideoRequest};
pub(crate) use video::sanitize_file_stem;
pub use web::WebContext;

/// Closed set of concrete providers. Each kind serves exactly one stage over
/// exactly one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    GeminiApi,
    #[serde(rename = "openai_api")]
    OpenAiApi,
    ChatgptWeb,
    GrokWeb,
    Template,
    RenderApi,
    CapcutWeb,
    YoutubeApi,
    YoutubeStudioWeb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Api,
    Browser,
    Local,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 9] = [
        ProviderKind::GeminiApi,
        ProviderKind::OpenAiApi,
        ProviderKind::ChatgptWeb,
        ProviderKind::GrokWeb,
        ProviderKind::Template,
        ProviderKind::RenderApi,
        ProviderKind::CapcutWeb,
        ProviderKind::YoutubeApi,
        ProviderKind::YoutubeStudioWeb,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::GeminiApi => "gemini_api",
            ProviderKind::OpenAiApi => "openai_api",
            ProviderKind::ChatgptWeb => "chatgpt_web",
            ProviderKind::GrokWeb => "grok_web",
            ProviderKind::Template => "template",
            ProviderKind::RenderApi => "render_api",
            ProviderKind::CapcutWeb => "capcut_web",
            ProviderKind::YoutubeApi => "youtube_api",
            ProviderKind::YoutubeStudioWeb => "youtube_studio_web",
        }
    }

    pub fn stage(&self) -> StageKind {
        match self {
            ProviderKind::GeminiApi
            | ProviderKind::OpenAiApi
            | ProviderKind::ChatgptWeb
            | ProviderKind::GrokWeb
            | ProviderKind::Template => StageKind::Script,
            ProviderKind::RenderApi | ProviderKind::CapcutWeb => StageKind::Video,
            ProviderKind::YoutubeApi | ProviderKind::YoutubeStudioWeb => StageKind::Upload,
        }
    }

    pub fn transport(&self) -> Transport {
        match self {
            ProviderKind::GeminiApi
            | ProviderKind::OpenAiApi
            | ProviderKind::RenderApi
            | ProviderKind::YoutubeApi => Transport::Api,
            ProviderKind::ChatgptWeb
            | ProviderKind::GrokWeb
            | ProviderKind::CapcutWeb
            | ProviderKind::YoutubeStudioWeb => Transport::Browser,
            ProviderKind::Template => Transport::Local,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown provider: {s}"))
    }
}

/// One concrete way of satisfying a stage.
#[async_trait]
pub trait StageProvider<Req, Out>: Send + Sync
where
    Req: Send + Sync,
    Out: Send,
{
    fn kind(&self) -> ProviderKind;

    async fn execute(&self, request: &Req, signal: &ControlSignal) -> Result<Out, StageError>;
}

pub type ScriptProvider = dyn StageProvider<ScriptRequest, GeneratedScript>;
pub type VideoProvider = dyn StageProvider<VideoRequest, RenderedVideo>;
pub type UploadProvider = dyn StageProvider<UploadRequest, UploadReceipt>;

#[derive(Debug)]
pub struct StrategyOutcome<Out> {
    pub output: Out,
    pub provider: ProviderKind,
    /// Attempts across every provider tried, in order.
    pub attempts: Vec<ExecutionAttempt>,
}

/// Ordered provider fallback for one stage; each provider runs under its own
/// retry policy.
pub struct ProviderStrategy<Req, Out> {
    stage: StageKind,
    providers: Vec<(Arc<dyn StageProvider<Req, Out>>, RetryPolicy)>,
}

impl<Req, Out> ProviderStrategy<Req, Out>
where
    Req: Send + Sync,
    Out: Send,
{
    pub fn new(stage: StageKind) -> Self {
        Self {
            stage,
            providers: Vec::new(),
        }
    }

    pub fn with_provider(
        mut self,
        provider: Arc<dyn StageProvider<Req, Out>>,
        policy: RetryPolicy,
    ) -> Self {
        self.providers.push((provider, policy));
        self
    }

    pub fn stage(&self) -> StageKind {
        self.stage
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        self.providers
            .iter()
            .map(|(provider, _)| provider.kind())
            .collect()
    }

    pub async fn execute(
        &self,
        request: &Req,
        signal: &ControlSignal,
    ) -> Result<StrategyOutcome<Out>, StageFailure> {
        if self.providers.is_empty() {
            return Err(StageFailure::new(StageError::Configuration(format!(
                "no providers configured for the {} stage",
                self.stage
            ))));
        }

        let mut attempts = Vec::new();
        let mut last_error = None;
        for (position, (provider, policy)) in self.providers.iter().enumerate() {
            let kind = provider.kind();
            if position > 0 {
                info!(stage = %self.stage, provider = %kind, "falling back to next provider");
            }
            let outcome = policy
                .run(signal, StageError::classify, |attempt| {
                    tracing::debug!(stage = %self.stage, provider = %kind, attempt, "provider attempt");
                    provider.execute(request, signal)
                })
                .await;
            match outcome {
                Ok(done) => {
                    attempts.extend(done.attempts);
                    info!(
                        stage = %self.stage,
                        provider = %kind,
                        attempts = attempts.len(),
                        "provider succeeded"
                    );
                    return Ok(StrategyOutcome {
                        output: done.result,
                        provider: kind,
                        attempts,
                    });
                }
                Err(failure) => {
                    attempts.extend(failure.attempts);
                    if failure.error.ends_stage() {
                        return Err(StageFailure {
                            error: failure.error,
                            attempts,
                        });
                    }
                    warn!(
                        stage = %self.stage,
                        provider = %kind,
                        exhausted = failure.exhausted,
                        error = %failure.error,
                        "provider failed"
                    );
                    last_error = Some(failure.error);
                }
            }
        }

        let last = last_error.unwrap_or_else(|| StageError::Unexpected("no provider ran".into()));
        Err(StageFailure {
            error: StageError::ProvidersExhausted {
                stage: self.stage,
                last: Box::new(last),
            },
            attempts,
        })
    }
}

impl<Req, Out> fmt::Debug for ProviderStrategy<Req, Out>
where
    Req: Send + Sync,
    Out: Send,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderStrategy")
            .field("stage", &self.stage)
            .field("providers", &self.kinds())
            .finish()
    }
}
