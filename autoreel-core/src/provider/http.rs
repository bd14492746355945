use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::{Response, StatusCode};

use crate::config::ProviderSection;
use crate::stage::StageError;

use super::ProviderKind;

pub(crate) fn response_timeout(
    kind: ProviderKind,
    section: &ProviderSection,
) -> Result<Duration, StageError> {
    section
        .response_timeout_seconds
        .map(Duration::from_secs)
        .ok_or_else(|| {
            StageError::Configuration(format!(
                "providers.{}.response_timeout_seconds is not set",
                kind.as_str()
            ))
        })
}

pub(crate) fn model(kind: ProviderKind, section: &ProviderSection) -> Result<&str, StageError> {
    section
        .model
        .as_deref()
        .filter(|model| !model.trim().is_empty())
        .ok_or_else(|| {
            StageError::Configuration(format!("providers.{}.model is not set", kind.as_str()))
        })
}

/// Reads the secret named by `api_key_env`. A missing variable makes the
/// provider unusable for this run rather than retryable.
pub(crate) fn secret_from_env(kind: ProviderKind, var: Option<&str>) -> Result<String, StageError> {
    let var = var.ok_or_else(|| StageError::Unsupported {
        provider: kind.to_string(),
        reason: "no api_key_env configured".into(),
    })?;
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(StageError::Unsupported {
            provider: kind.to_string(),
            reason: format!("{var} is not set"),
        }),
    }
}

pub(crate) fn endpoint(kind: ProviderKind, section: &ProviderSection) -> Result<String, StageError> {
    section
        .endpoint
        .as_deref()
        .map(|endpoint| endpoint.trim_end_matches('/').to_string())
        .ok_or_else(|| {
            StageError::Configuration(format!("providers.{}.endpoint is not set", kind.as_str()))
        })
}

/// Maps a non-success response onto the stage taxonomy.
pub(crate) async fn check_status(
    kind: ProviderKind,
    response: Response,
) -> Result<Response, StageError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = retry_after(&response);
    let body = response.text().await.unwrap_or_default();
    let reason = format!("{kind} returned {status}: {}", snippet(&body));
    Err(status_error(kind, status, retry_after, reason))
}

fn status_error(
    kind: ProviderKind,
    status: StatusCode,
    retry_after: Option<Duration>,
    reason: String,
) -> StageError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => StageError::RateLimited {
            reason,
            retry_after,
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StageError::Unsupported {
            provider: kind.to_string(),
            reason,
        },
        StatusCode::REQUEST_TIMEOUT => StageError::ProviderUnavailable(reason),
        status if status.is_server_error() => StageError::ProviderUnavailable(reason),
        _ => StageError::Unexpected(reason),
    }
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(200) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
