use std::time::Duration;

use thiserror::Error;

use crate::browser::{BrowserError, LocatorError};
use crate::control::Cancelled;
use crate::error::ConfigError;
use crate::retry::{ExecutionAttempt, FailureClass};
use crate::run::StageKind;
use crate::upload_log::UploadLogError;

/// Failure taxonomy shared by providers, stages and the orchestrator.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("{provider} cannot be used: {reason}")]
    Unsupported { provider: String, reason: String },
    #[error("element `{action}` not found after {candidates} candidates")]
    ElementNotFound { action: String, candidates: usize },
    #[error("browser crashed: {0}")]
    BrowserCrash(String),
    #[error("rate limited: {reason}")]
    RateLimited {
        reason: String,
        retry_after: Option<Duration>,
    },
    #[error("source {key} was already uploaded")]
    UploadConflict { key: String },
    #[error("missing stage input: {0}")]
    MissingInput(String),
    #[error("all {stage} providers failed, last error: {last}")]
    ProvidersExhausted {
        stage: StageKind,
        last: Box<StageError>,
    },
    #[error("upload handed over but not confirmed: {0}")]
    PublishUncertain(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
    #[error("stop requested")]
    Cancelled,
}

impl StageError {
    /// Retry predicate. Element exhaustion is already the end of the
    /// locator's own candidate fallback, and a crash was already given its
    /// one fresh session by the session manager. An uncertain publish is
    /// never retried.
    pub fn classify(&self) -> FailureClass {
        match self {
            StageError::ProviderUnavailable(_) => FailureClass::Retryable { retry_after: None },
            StageError::RateLimited { retry_after, .. } => FailureClass::Retryable {
                retry_after: *retry_after,
            },
            StageError::Configuration(_)
            | StageError::Unsupported { .. }
            | StageError::ElementNotFound { .. }
            | StageError::BrowserCrash(_)
            | StageError::UploadConflict { .. }
            | StageError::MissingInput(_)
            | StageError::ProvidersExhausted { .. }
            | StageError::PublishUncertain(_)
            | StageError::Unexpected(_)
            | StageError::Cancelled => FailureClass::Fatal,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            StageError::Configuration(_) => "configuration",
            StageError::ProviderUnavailable(_) => "provider_unavailable",
            StageError::Unsupported { .. } => "unsupported",
            StageError::ElementNotFound { .. } => "element_not_found",
            StageError::BrowserCrash(_) => "browser_crash",
            StageError::RateLimited { .. } => "rate_limited",
            StageError::UploadConflict { .. } => "upload_conflict",
            StageError::MissingInput(_) => "missing_input",
            StageError::ProvidersExhausted { .. } => "providers_exhausted",
            StageError::PublishUncertain(_) => "publish_uncertain",
            StageError::Unexpected(_) => "unexpected",
            StageError::Cancelled => "cancelled",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StageError::Cancelled)
    }

    /// Errors after which no other provider of the stage may run.
    pub fn ends_stage(&self) -> bool {
        matches!(self, StageError::Cancelled | StageError::PublishUncertain(_))
    }

    /// The innermost provider error behind a strategy exhaustion.
    pub fn root(&self) -> &StageError {
        match self {
            StageError::ProvidersExhausted { last, .. } => last.root(),
            other => other,
        }
    }
}

impl From<Cancelled> for StageError {
    fn from(_: Cancelled) -> Self {
        StageError::Cancelled
    }
}

impl From<BrowserError> for StageError {
    fn from(err: BrowserError) -> Self {
        match err {
            BrowserError::Crashed(reason) => StageError::BrowserCrash(reason),
            err @ (BrowserError::Timeout(_) | BrowserError::Cdp(_) | BrowserError::Launch(_)) => {
                StageError::ProviderUnavailable(err.to_string())
            }
            err @ (BrowserError::Attach { .. }
            | BrowserError::Configuration(_)
            | BrowserError::Profile(_)) => StageError::Configuration(err.to_string()),
            err @ (BrowserError::Io(_) | BrowserError::Busy | BrowserError::Unexpected(_)) => {
                StageError::Unexpected(err.to_string())
            }
        }
    }
}

impl From<LocatorError> for StageError {
    fn from(err: LocatorError) -> Self {
        match err {
            LocatorError::EmptyCandidates(action) => StageError::Configuration(format!(
                "no selector candidates configured for `{action}`"
            )),
            LocatorError::NotFound { action, total, .. } => StageError::ElementNotFound {
                action,
                candidates: total,
            },
            LocatorError::Browser(err) => err.into(),
            LocatorError::Cancelled(_) => StageError::Cancelled,
        }
    }
}

impl From<ConfigError> for StageError {
    fn from(err: ConfigError) -> Self {
        StageError::Configuration(err.to_string())
    }
}

impl From<std::io::Error> for StageError {
    fn from(err: std::io::Error) -> Self {
        StageError::Unexpected(format!("io error: {err}"))
    }
}

impl From<reqwest::Error> for StageError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            StageError::Unexpected(format!("malformed provider response: {err}"))
        } else {
            StageError::ProviderUnavailable(err.to_string())
        }
    }
}

impl From<UploadLogError> for StageError {
    fn from(err: UploadLogError) -> Self {
        match err {
            UploadLogError::Conflict { source_key } => {
                StageError::UploadConflict { key: source_key }
            }
            other => StageError::Unexpected(format!("upload log: {other}")),
        }
    }
}

/// A stage that gave up, with every attempt it made.
#[derive(Debug, Clone)]
pub struct StageFailure {
    pub error: StageError,
    pub attempts: Vec<ExecutionAttempt>,
}

impl StageFailure {
    pub fn new(error: StageError) -> Self {
        Self {
            error,
            attempts: Vec::new(),
        }
    }
}

impl From<StageError> for StageFailure {
    fn from(error: StageError) -> Self {
        Self::new(error)
    }
}
