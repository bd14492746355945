use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info};

use crate::config::{MetadataSection, PipelineConfig, WorkflowSection};
use crate::control::ControlSignal;
use crate::provider::{GeneratedScript, ProviderRegistry, ProviderStrategy, ScriptRequest};
use crate::run::{ScriptArtifact, StageArtifact, StageKind};

use super::{StageContext, StageError, StageExecutor, StageFailure, StageOutcome};

pub fn build_prompt(template: &str, topic: &str, max_words: u32) -> String {
    format!(
        "{}\n\nKeep the script under {max_words} words. Answer with the sections \
         SCRIPT:, TITLE:, DESCRIPTION: and KEYWORDS: (comma separated).",
        template.replace("{topic}", topic.trim())
    )
}

fn header_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?im)^[ \t*#]*(script|title|description|keywords|tags)[ \t*]*:[ \t*]*")
            .expect("valid regex")
    })
}

#[derive(Debug, Default)]
struct Sections {
    script: Option<String>,
    title: Option<String>,
    description: Option<String>,
    tags: Vec<String>,
}

fn split_tags(raw: &str) -> Vec<String> {
    raw.split([',', '\n', '#'])
        .map(|tag| tag.trim().trim_matches('*').trim())
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim().trim_matches('"').trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn by_headers(text: &str) -> Option<Sections> {
    let headers: Vec<_> = header_pattern().captures_iter(text).collect();
    if headers.is_empty() {
        return None;
    }
    let mut sections = Sections::default();
    let leading = &text[..headers[0].get(0).map(|m| m.start()).unwrap_or(0)];
    for (idx, caps) in headers.iter().enumerate() {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let end = headers
            .get(idx + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(text.len());
        let body = &text[whole.end()..end];
        match name.as_str().to_ascii_lowercase().as_str() {
            "script" => sections.script = non_empty(body),
            "title" => sections.title = non_empty(body),
            "description" => sections.description = non_empty(body),
            _ => sections.tags.extend(split_tags(body)),
        }
    }
    if sections.script.is_none() {
        sections.script = non_empty(leading);
    }
    Some(sections)
}

fn by_blank_lines(text: &str) -> Sections {
    static BLANK: OnceLock<Regex> = OnceLock::new();
    let blank = BLANK.get_or_init(|| Regex::new(r"\n[ \t]*\n").expect("valid regex"));
    let parts: Vec<&str> = blank
        .split(text.trim())
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();
    Sections {
        script: parts.first().and_then(|part| non_empty(part)),
        title: parts.get(1).and_then(|part| non_empty(part)),
        description: parts.get(2).and_then(|part| non_empty(part)),
        tags: parts.get(3).map(|part| split_tags(part)).unwrap_or_default(),
    }
}

/// Parses provider text into a script artifact. Header sections win; text
/// without headers is read as script, title, description and tags separated
/// by blank lines. Missing metadata falls back to the configured defaults.
pub fn parse_script_response(
    text: &str,
    topic: Option<&str>,
    metadata: &MetadataSection,
) -> Result<ScriptArtifact, StageError> {
    let sections = by_headers(text).unwrap_or_else(|| by_blank_lines(text));
    let script = sections
        .script
        .ok_or_else(|| StageError::Unexpected("generated text has no script body".into()))?;
    let fill = |template: &str| match topic {
        Some(topic) => template.replace("{topic}", topic),
        None => template.replace("{topic}", "").trim().to_string(),
    };
    let title = sections
        .title
        .unwrap_or_else(|| fill(&metadata.default_title));
    let description = sections
        .description
        .unwrap_or_else(|| fill(&metadata.default_description));
    let tags = if sections.tags.is_empty() {
        metadata.default_tags.clone()
    } else {
        sections.tags
    };
    Ok(ScriptArtifact::new(
        topic.map(str::to_string),
        script,
        title,
        description,
        tags,
    ))
}

/// Reads a saved script document, the starting point of video-first modes.
pub fn load_script_file(path: &Path, metadata: &MetadataSection) -> Result<ScriptArtifact, StageError> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| StageError::MissingInput(format!("{}: {err}", path.display())))?;
    let mut script = parse_script_response(&text, None, metadata).map_err(|_| {
        StageError::MissingInput(format!("{} contains no script", path.display()))
    })?;
    script.saved_to = Some(path.to_path_buf());
    Ok(script)
}

fn save_script(dir: &Path, script: &ScriptArtifact) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let stem = crate::provider::sanitize_file_stem(&script.title);
    let target = dir.join(format!("{stem}-{}.txt", script.id));
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(script.to_document().as_bytes())?;
    file.persist(&target).map_err(|err| err.error)?;
    Ok(target)
}

pub struct ScriptStage {
    strategy: ProviderStrategy<ScriptRequest, GeneratedScript>,
    workflow: WorkflowSection,
    metadata: MetadataSection,
    scripts_dir: Option<PathBuf>,
}

impl ScriptStage {
    pub fn new(
        strategy: ProviderStrategy<ScriptRequest, GeneratedScript>,
        workflow: WorkflowSection,
        metadata: MetadataSection,
        scripts_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            strategy,
            workflow,
            metadata,
            scripts_dir,
        }
    }

    pub fn from_config(config: &PipelineConfig, registry: &ProviderRegistry) -> crate::Result<Self> {
        let workflow = config.require_workflow()?.clone();
        let scripts_dir = if workflow.save_scripts {
            Some(config.require_path(&config.paths.scripts_dir, "paths.scripts_dir")?)
        } else {
            None
        };
        Ok(Self::new(
            registry.script_strategy()?,
            workflow,
            config.require_metadata()?.clone(),
            scripts_dir,
        ))
    }
}

#[async_trait]
impl StageExecutor for ScriptStage {
    fn kind(&self) -> StageKind {
        StageKind::Script
    }

    async fn execute(
        &self,
        ctx: &StageContext<'_>,
        signal: &ControlSignal,
    ) -> Result<StageOutcome, StageFailure> {
        let topic = ctx
            .input
            .topic()
            .map(str::trim)
            .filter(|topic| !topic.is_empty())
            .ok_or_else(|| StageError::MissingInput("script stage needs a topic".into()))?;
        let request = ScriptRequest {
            topic: topic.to_string(),
            prompt: build_prompt(&self.workflow.prompt_template, topic, self.workflow.max_words),
            max_words: self.workflow.max_words,
        };
        debug!(run_id = ctx.run_id, topic, "generating script");

        let outcome = self.strategy.execute(&request, signal).await?;
        let attempts = outcome.attempts;
        let mut script = parse_script_response(&outcome.output.text, Some(topic), &self.metadata)
            .map_err(|error| StageFailure {
                error,
                attempts: attempts.clone(),
            })?;

        if let Some(dir) = &self.scripts_dir {
            let path = save_script(dir, &script).map_err(|err| StageFailure {
                error: StageError::from(err),
                attempts: attempts.clone(),
            })?;
            info!(run_id = ctx.run_id, path = %path.display(), "script saved");
            script.saved_to = Some(path);
        }

        Ok(StageOutcome {
            artifact: StageArtifact::Script(script),
            provider: Some(outcome.provider),
            attempts,
        })
    }
}
