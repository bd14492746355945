use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::browser::{
    BrowserError, BrowserSessionManager, ElementLocator, LocatorError, PageDriver,
    SelectorCandidate, SelectorCatalog,
};
use crate::control::ControlSignal;
use crate::stage::StageError;

/// What a browser-driven provider needs: the shared session manager, the
/// selector catalog entry for its site and the configured waits. Failures
/// are captured into `screenshots_dir` when one is configured.
#[derive(Clone)]
pub struct WebContext {
    pub sessions: Arc<BrowserSessionManager>,
    pub selectors: Arc<SelectorCatalog>,
    pub locator: ElementLocator,
    pub site: String,
    pub target_url: String,
    pub wait_timeout: Duration,
    pub screenshots_dir: Option<PathBuf>,
}

impl WebContext {
    pub fn candidate(&self, action: &str) -> SelectorCandidate {
        self.selectors.candidate(&self.site, action)
    }

    pub fn has_action(&self, action: &str) -> bool {
        self.selectors.has_action(&self.site, action)
    }

    /// Resolves `action` and returns the selector that matched.
    pub async fn locate(
        &self,
        page: &dyn PageDriver,
        action: &str,
        signal: &ControlSignal,
    ) -> Result<String, StageError> {
        self.locate_within(page, action, self.wait_timeout, signal).await
    }

    pub async fn locate_within(
        &self,
        page: &dyn PageDriver,
        action: &str,
        per_candidate_timeout: Duration,
        signal: &ControlSignal,
    ) -> Result<String, StageError> {
        let handle = self
            .locator
            .resolve(page, &self.candidate(action), per_candidate_timeout, signal)
            .await?;
        Ok(handle.selector)
    }

    pub async fn click(
        &self,
        page: &dyn PageDriver,
        action: &str,
        signal: &ControlSignal,
    ) -> Result<(), StageError> {
        let selector = self.locate(page, action, signal).await?;
        debug!(site = %self.site, action, selector = %selector, "click");
        page.click(&selector).await?;
        Ok(())
    }

    pub async fn fill(
        &self,
        page: &dyn PageDriver,
        action: &str,
        text: &str,
        signal: &ControlSignal,
    ) -> Result<(), StageError> {
        let selector = self.locate(page, action, signal).await?;
        debug!(site = %self.site, action, selector = %selector, chars = text.len(), "fill");
        page.type_text(&selector, text).await?;
        Ok(())
    }

    pub async fn read(
        &self,
        page: &dyn PageDriver,
        action: &str,
        signal: &ControlSignal,
    ) -> Result<String, StageError> {
        let selector = self.locate(page, action, signal).await?;
        Ok(page.read_text(&selector).await?)
    }

    /// Clicks `action` only when the site defines it.
    pub async fn click_if_defined(
        &self,
        page: &dyn PageDriver,
        action: &str,
        signal: &ControlSignal,
    ) -> Result<bool, StageError> {
        if !self.has_action(action) {
            return Ok(false);
        }
        self.click(page, action, signal).await?;
        Ok(true)
    }

    pub async fn fill_if_defined(
        &self,
        page: &dyn PageDriver,
        action: &str,
        text: &str,
        signal: &ControlSignal,
    ) -> Result<bool, StageError> {
        if !self.has_action(action) {
            return Ok(false);
        }
        self.fill(page, action, text, signal).await?;
        Ok(true)
    }

    /// Selector for `action` if it shows up within `limit`; `None` when the
    /// site does not define it or nothing matched.
    pub async fn find_optional(
        &self,
        page: &dyn PageDriver,
        action: &str,
        limit: Duration,
        signal: &ControlSignal,
    ) -> Result<Option<String>, StageError> {
        let candidate = self.candidate(action);
        if candidate.selectors.is_empty() {
            return Ok(None);
        }
        match self.locator.resolve(page, &candidate, limit, signal).await {
            Ok(handle) => Ok(Some(handle.selector)),
            Err(LocatorError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Clicks an optional control (cookie banner, sign-in popup, captions)
    /// when it shows up within `limit`. Only a crash or a stop is an error.
    pub async fn click_optional(
        &self,
        page: &dyn PageDriver,
        action: &str,
        limit: Duration,
        signal: &ControlSignal,
    ) -> Result<bool, StageError> {
        let Some(selector) = self.find_optional(page, action, limit, signal).await? else {
            debug!(site = %self.site, action, "optional control not shown");
            return Ok(false);
        };
        match page.click(&selector).await {
            Ok(()) => {
                debug!(site = %self.site, action, selector = %selector, "clicked optional control");
                Ok(true)
            }
            Err(err @ BrowserError::Crashed(_)) => Err(err.into()),
            Err(err) => {
                warn!(site = %self.site, action, error = %err, "optional control could not be clicked");
                Ok(false)
            }
        }
    }

    /// Text of `action` as it reads right now, without waiting for it.
    pub async fn read_now(
        &self,
        page: &dyn PageDriver,
        action: &str,
        signal: &ControlSignal,
    ) -> Result<Option<String>, StageError> {
        match self.find_optional(page, action, Duration::ZERO, signal).await? {
            Some(selector) => Ok(Some(page.read_text(&selector).await?)),
            None => Ok(None),
        }
    }

    /// Saves a screenshot of `page` when `result` failed for any reason other
    /// than a stop or a dead browser, then hands `result` back unchanged.
    pub async fn diagnose<T>(
        &self,
        page: &dyn PageDriver,
        label: &str,
        result: Result<T, StageError>,
    ) -> Result<T, StageError> {
        if let Err(err) = &result {
            if !matches!(err, StageError::Cancelled | StageError::BrowserCrash(_)) {
                self.capture(page, &format!("{label}_{}", err.kind_str()))
                    .await;
            }
        }
        result
    }

    async fn capture(&self, page: &dyn PageDriver, label: &str) -> Option<PathBuf> {
        let dir = self.screenshots_dir.as_ref()?;
        let bytes = match page.screenshot().await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(site = %self.site, error = %err, "failed to capture screenshot");
                return None;
            }
        };
        let path = dir.join(format!(
            "{}_{label}_{}.png",
            self.site,
            Utc::now().format("%Y%m%dT%H%M%S%3f")
        ));
        let written = async {
            tokio::fs::create_dir_all(dir).await?;
            tokio::fs::write(&path, &bytes).await
        };
        match written.await {
            Ok(()) => {
                warn!(site = %self.site, path = %path.display(), "failure screenshot saved");
                Some(path)
            }
            Err(err) => {
                warn!(site = %self.site, error = %err, "failed to write screenshot");
                None
            }
        }
    }

    /// Polls until no candidate for `action` is present, bounded by `limit`.
    /// An undefined action counts as already gone.
    pub async fn wait_until_gone(
        &self,
        page: &dyn PageDriver,
        action: &str,
        limit: Duration,
        signal: &ControlSignal,
    ) -> Result<(), StageError> {
        let candidate = self.candidate(action);
        if candidate.selectors.is_empty() {
            return Ok(());
        }
        let deadline = Instant::now() + limit;
        loop {
            signal.checkpoint()?;
            if !self.locator.present(page, &candidate).await? {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(StageError::ProviderUnavailable(format!(
                    "{} still showing `{action}` after {}s",
                    self.site,
                    limit.as_secs()
                )));
            }
            signal
                .sleep(self.locator.poll_interval().min(deadline - now))
                .await?;
        }
    }
}

impl std::fmt::Debug for WebContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebContext")
            .field("site", &self.site)
            .field("target_url", &self.target_url)
            .field("wait_timeout", &self.wait_timeout)
            .field("screenshots_dir", &self.screenshots_dir)
            .finish()
    }
}
