use chromiumoxide::error::CdpError;
use thiserror::Error;

pub type BrowserResult<T> = Result<T, BrowserError>;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("failed to attach to {endpoint}: {reason}")]
    Attach { endpoint: String, reason: String },
    #[error("cdp error: {0}")]
    Cdp(CdpError),
    #[error("browser session crashed: {0}")]
    Crashed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timeout waiting for {0}")]
    Timeout(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("profile error: {0}")]
    Profile(String),
    #[error("a browser session is already leased")]
    Busy,
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl From<CdpError> for BrowserError {
    fn from(err: CdpError) -> Self {
        match err {
            CdpError::Ws(_) | CdpError::ChannelSendError(_) | CdpError::NoResponse => {
                BrowserError::Crashed(err.to_string())
            }
            CdpError::Timeout => BrowserError::Timeout("devtools response".into()),
            other => BrowserError::Cdp(other),
        }
    }
}

impl From<tokio::task::JoinError> for BrowserError {
    fn from(err: tokio::task::JoinError) -> Self {
        BrowserError::Unexpected(err.to_string())
    }
}
