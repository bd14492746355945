use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::browser::PageDriver;
use crate::config::ProviderSection;
use crate::control::ControlSignal;
use crate::stage::StageError;

use super::http::{check_status, endpoint, model, response_timeout, secret_from_env};
use super::web::WebContext;
use super::{ProviderKind, StageProvider};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRequest {
    pub topic: String,
    pub prompt: String,
    pub max_words: u32,
}

/// Raw provider text, parsed into a script artifact by the stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedScript {
    pub text: String,
}

impl GeneratedScript {
    fn non_empty(kind: ProviderKind, text: String) -> Result<Self, StageError> {
        if text.trim().is_empty() {
            return Err(StageError::ProviderUnavailable(format!(
                "{kind} returned an empty response"
            )));
        }
        Ok(Self { text })
    }
}

pub struct GeminiProvider {
    client: reqwest::Client,
    section: ProviderSection,
}

impl GeminiProvider {
    pub fn new(client: reqwest::Client, section: ProviderSection) -> Self {
        Self { client, section }
    }
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    text: Option<String>,
}

#[async_trait]
impl StageProvider<ScriptRequest, GeneratedScript> for GeminiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GeminiApi
    }

    async fn execute(
        &self,
        request: &ScriptRequest,
        _signal: &ControlSignal,
    ) -> Result<GeneratedScript, StageError> {
        let kind = self.kind();
        let key = secret_from_env(kind, self.section.api_key_env.as_deref())?;
        let model = model(kind, &self.section)?;
        let timeout = response_timeout(kind, &self.section)?;
        let url = format!(
            "{}/v1beta/models/{model}:generateContent",
            endpoint(kind, &self.section)?
        );
        debug!(provider = %kind, model, "requesting script");
        let response = self
            .client
            .post(&url)
            .query(&[("key", key.as_str())])
            .timeout(timeout)
            .json(&json!({
                "contents": [{ "parts": [{ "text": request.prompt }] }]
            }))
            .send()
            .await?;
        let body: GeminiResponse = check_status(kind, response).await?.json().await?;
        let text = body
            .candidates
            .into_iter()
            .filter_map(|candidate| candidate.content)
            .flat_map(|content| content.parts)
            .filter_map(|part| part.text)
            .collect::<Vec<_>>()
            .join("");
        GeneratedScript::non_empty(kind, text)
    }
}

pub struct OpenAiProvider {
    client: reqwest::Client,
    section: ProviderSection,
}

impl OpenAiProvider {
    pub fn new(client: reqwest::Client, section: ProviderSection) -> Self {
        Self { client, section }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[async_trait]
impl StageProvider<ScriptRequest, GeneratedScript> for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAiApi
    }

    async fn execute(
        &self,
        request: &ScriptRequest,
        _signal: &ControlSignal,
    ) -> Result<GeneratedScript, StageError> {
        let kind = self.kind();
        let key = secret_from_env(kind, self.section.api_key_env.as_deref())?;
        let model = model(kind, &self.section)?;
        let timeout = response_timeout(kind, &self.section)?;
        let url = format!("{}/v1/chat/completions", endpoint(kind, &self.section)?);
        debug!(provider = %kind, model, "requesting script");
        let response = self
            .client
            .post(&url)
            .bearer_auth(key)
            .timeout(timeout)
            .json(&json!({
                "model": model,
                "messages": [{ "role": "user", "content": request.prompt }],
            }))
            .send()
            .await?;
        let body: ChatCompletion = check_status(kind, response).await?.json().await?;
        let text = body
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .unwrap_or_default();
        GeneratedScript::non_empty(kind, text)
    }
}

const GENERATING: &str = "response_generating_indicator";
const OVERLAY_WAIT: Duration = Duration::from_secs(5);
const RESPONSE_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Consecutive identical reads before an answer counts as finished.
const STABLE_READS: u32 = 3;

/// Chat UI driven through the browser (ChatGPT, Grok): type the prompt,
/// send, wait for generation to finish, read the last answer.
pub struct ChatWebProvider {
    kind: ProviderKind,
    web: WebContext,
    response_timeout: Duration,
}

impl ChatWebProvider {
    pub fn new(kind: ProviderKind, web: WebContext, response_timeout: Duration) -> Self {
        Self {
            kind,
            web,
            response_timeout,
        }
    }

    async fn converse(
        &self,
        page: &dyn PageDriver,
        request: &ScriptRequest,
        signal: &ControlSignal,
    ) -> Result<GeneratedScript, StageError> {
        let web = &self.web;
        info!(provider = %self.kind, url = %web.target_url, "opening chat page");
        page.goto(&web.target_url).await?;
        web.click_optional(page, "login_popup_close_button", OVERLAY_WAIT, signal)
            .await?;
        web.click_optional(page, "cookie_accept_button", OVERLAY_WAIT, signal)
            .await?;

        let previous = web.read_now(page, "response_text", signal).await?;
        web.fill(page, "input_field", &request.prompt, signal).await?;
        web.click(page, "send_button", signal).await?;
        let deadline = Instant::now() + self.response_timeout;

        // The indicator only renders once the page has picked up the prompt.
        if web.has_action(GENERATING) {
            match web
                .find_optional(page, GENERATING, web.wait_timeout, signal)
                .await?
            {
                Some(_) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    web.wait_until_gone(page, GENERATING, remaining, signal)
                        .await?;
                }
                None => debug!(provider = %self.kind, "generation indicator never appeared"),
            }
        }

        let text = self
            .settled_answer(page, previous.as_deref(), deadline, signal)
            .await?;
        GeneratedScript::non_empty(self.kind, text)
    }

    /// Polls the last answer until it reads the same [`STABLE_READS`] times
    /// in a row and differs from what the page showed before sending.
    async fn settled_answer(
        &self,
        page: &dyn PageDriver,
        previous: Option<&str>,
        deadline: Instant,
        signal: &ControlSignal,
    ) -> Result<String, StageError> {
        let mut last = String::new();
        let mut repeats = 0u32;
        loop {
            let current = self
                .web
                .read_now(page, "response_text", signal)
                .await?
                .unwrap_or_default();
            let fresh = !current.trim().is_empty() && previous != Some(current.as_str());
            if fresh && current == last {
                repeats += 1;
            } else {
                repeats = 0;
                last = current;
            }
            if fresh && repeats + 1 >= STABLE_READS {
                debug!(provider = %self.kind, chars = last.len(), "answer settled");
                return Ok(last);
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(provider = %self.kind, chars = last.len(), "answer still changing at deadline");
                return Err(StageError::ProviderUnavailable(format!(
                    "{} answer did not settle within {}s",
                    self.kind,
                    self.response_timeout.as_secs()
                )));
            }
            signal
                .sleep(RESPONSE_POLL_INTERVAL.min(deadline - now))
                .await?;
        }
    }
}

#[async_trait]
impl StageProvider<ScriptRequest, GeneratedScript> for ChatWebProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn execute(
        &self,
        request: &ScriptRequest,
        signal: &ControlSignal,
    ) -> Result<GeneratedScript, StageError> {
        let web = &self.web;
        web.sessions
            .with_session(|session| async move {
                let page = session.page();
                let result = self.converse(page, request, signal).await;
                web.diagnose(page, "chat", result).await
            })
            .await
    }
}

const TEMPLATES: [&str; 3] = [
    "Did you know these surprising facts about {topic}? \
     Most people never stop to think about how {topic} shapes everyday life. \
     Here is what the experts say, what the numbers show, and why it matters to you. \
     Stay until the end for the one fact nobody expects.",
    "Let's break down {topic} in under a minute. \
     First, where it came from. Then, how it works today. \
     Finally, where it is heading next and what that means for all of us. \
     Follow for more quick explainers like this one.",
    "Here are three things about {topic} you should know right now. \
     Number one will change how you see it. Number two is backed by research. \
     Number three is the reason everyone is talking about {topic} this year.",
];

/// Offline last resort: a canned script for the topic, in the same header
/// format the parser expects from real providers.
#[derive(Debug, Clone, Default)]
pub struct TemplateProvider;

impl TemplateProvider {
    pub fn new() -> Self {
        Self
    }

    pub fn render(topic: &str, max_words: u32) -> String {
        let digest = Sha256::digest(topic.trim().to_lowercase().as_bytes());
        let template = TEMPLATES[digest[0] as usize % TEMPLATES.len()];
        let body = template.replace("{topic}", topic);
        let words: Vec<&str> = body.split_whitespace().collect();
        let limit = (max_words as usize).max(1).min(words.len());
        let mut script = words[..limit].join(" ");
        if limit < words.len() {
            script.push_str("...");
        }
        let keywords: Vec<String> = topic
            .split_whitespace()
            .map(|word| word.to_lowercase())
            .chain(["shorts".to_string(), "facts".to_string()])
            .collect();
        format!(
            "SCRIPT:\n{script}\n\nTITLE: {topic}: what you need to know\nDESCRIPTION: A quick look at {topic}.\nKEYWORDS: {}\n",
            keywords.join(", ")
        )
    }
}

#[async_trait]
impl StageProvider<ScriptRequest, GeneratedScript> for TemplateProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Template
    }

    async fn execute(
        &self,
        request: &ScriptRequest,
        _signal: &ControlSignal,
    ) -> Result<GeneratedScript, StageError> {
        Ok(GeneratedScript {
            text: Self::render(&request.topic, request.max_words),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use super::super::web::testing::web_context;
    use super::*;
    use crate::browser::testing::{FakeDriver, FakePage};
    use crate::browser::{
        BrowserKind, BrowserSessionManager, ElementLocator, SelectorCatalog, SessionRequest,
        SessionTarget,
    };

    #[test]
    fn template_is_deterministic_and_bounded() {
        let first = TemplateProvider::render("AI Facts", 12);
        assert_eq!(first, TemplateProvider::render("AI Facts", 12));
        assert!(first.starts_with("SCRIPT:\n"));
        let script_line = first.lines().nth(1).unwrap();
        assert!(script_line.split_whitespace().count() <= 12);
        assert!(first.contains("TITLE: AI Facts"));
        assert!(first.contains("KEYWORDS: ai, facts, shorts, facts"));
    }

    #[test]
    fn empty_text_is_retryable() {
        let err = GeneratedScript::non_empty(ProviderKind::ChatgptWeb, "  ".into()).unwrap_err();
        assert!(matches!(err, StageError::ProviderUnavailable(_)));
    }

    #[tokio::test]
    async fn missing_api_key_is_unsupported() {
        let provider = OpenAiProvider::new(
            reqwest::Client::new(),
            ProviderSection {
                api_key_env: Some("AUTOREEL_TEST_MISSING_OPENAI_KEY".into()),
                endpoint: Some("http://127.0.0.1:9".into()),
                model: Some("gpt-4o-mini".into()),
                ..ProviderSection::default()
            },
        );
        let err = provider
            .execute(
                &ScriptRequest {
                    topic: "AI Facts".into(),
                    prompt: "Write about AI Facts".into(),
                    max_words: 100,
                },
                &ControlSignal::detached(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn chat_web_without_selectors_is_a_configuration_error() {
        let driver = Arc::new(FakeDriver::default());
        let sessions = Arc::new(BrowserSessionManager::new(
            driver.clone(),
            SessionRequest {
                preference: vec![BrowserKind::Chrome],
                headless: true,
                target: SessionTarget::Ephemeral,
            },
            false,
        ));
        let web = WebContext {
            sessions,
            selectors: Arc::new(SelectorCatalog::default()),
            locator: ElementLocator::new(Duration::from_millis(50)),
            site: "chatgpt".into(),
            target_url: "https://chat.example.com".into(),
            wait_timeout: Duration::from_secs(1),
            screenshots_dir: None,
        };
        let provider = ChatWebProvider::new(ProviderKind::ChatgptWeb, web, Duration::from_secs(5));
        let err = provider
            .execute(
                &ScriptRequest {
                    topic: "AI Facts".into(),
                    prompt: "Write about AI Facts".into(),
                    max_words: 100,
                },
                &ControlSignal::detached(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Configuration(_)));
        // the session was still released
        assert_eq!(driver.closed.load(Ordering::SeqCst), 1);
    }

    fn chat_request() -> ScriptRequest {
        ScriptRequest {
            topic: "AI Facts".into(),
            prompt: "Write about AI Facts".into(),
            max_words: 100,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn chat_answer_is_read_after_a_late_indicator_clears() {
        let web = web_context(
            "chatgpt",
            &[
                ("input_field", "#prompt-textarea"),
                ("send_button", "#send"),
                ("response_generating_indicator", ".result-streaming"),
                ("response_text", ".markdown:last-of-type"),
                ("cookie_accept_button", "#accept-cookies"),
                ("login_popup_close_button", "#close-login"),
            ],
        );
        let page = FakePage::with_present(&["#prompt-textarea", "#send", "#accept-cookies"]);
        page.script_presence(".result-streaming", &[false, false, true, true, false]);
        page.script_texts(
            ".markdown:last-of-type",
            &[
                "Earlier answer",
                "SCRIPT:\nAI",
                "SCRIPT:\nAI learns",
                "SCRIPT:\nAI learns from data.",
            ],
        );
        let provider =
            ChatWebProvider::new(ProviderKind::ChatgptWeb, web, Duration::from_secs(180));

        let script = provider
            .converse(&page, &chat_request(), &ControlSignal::detached())
            .await
            .unwrap();

        assert_eq!(script.text, "SCRIPT:\nAI learns from data.");
        assert_eq!(
            page.click_log(),
            vec!["#accept-cookies".to_string(), "#send".to_string()]
        );
        let indicator_lookups = page
            .lookup_log()
            .iter()
            .filter(|selector| *selector == ".result-streaming")
            .count();
        assert!(indicator_lookups >= 4, "indicator checked {indicator_lookups} times");
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_chat_answer_times_out_as_retryable() {
        let web = web_context(
            "grok",
            &[
                ("input_field", "textarea"),
                ("send_button", "button[type=submit]"),
                ("response_text", ".message:last-child"),
            ],
        );
        let page = FakePage::with_present(&["textarea", "button[type=submit]"]);
        page.script_texts(".message:last-child", &["Earlier answer"]);
        let provider = ChatWebProvider::new(ProviderKind::GrokWeb, web, Duration::from_secs(30));

        let err = provider
            .converse(&page, &chat_request(), &ControlSignal::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::ProviderUnavailable(_)));
    }
}
