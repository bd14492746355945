use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::control::{Cancelled, ControlSignal};
use crate::error::ConfigError;

use super::error::BrowserError;
use super::session::PageDriver;

/// Ordered alternatives for one logical UI action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorCandidate {
    pub action: String,
    pub selectors: Vec<String>,
}

impl SelectorCandidate {
    pub fn new(action: impl Into<String>, selectors: Vec<String>) -> Self {
        Self {
            action: action.into(),
            selectors,
        }
    }
}

/// The selector that matched, and its rank among the candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementHandle {
    pub action: String,
    pub selector: String,
    pub candidate_index: usize,
}

#[derive(Debug, Error)]
pub enum LocatorError {
    #[error("no selector candidates configured for `{0}`")]
    EmptyCandidates(String),
    #[error("no candidate for `{action}` matched ({checked} of {total} checked)")]
    NotFound {
        action: String,
        checked: usize,
        total: usize,
    },
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Resolves selector candidates against a live page, first success wins.
#[derive(Debug, Clone)]
pub struct ElementLocator {
    poll_interval: Duration,
}

impl ElementLocator {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub async fn resolve(
        &self,
        page: &dyn PageDriver,
        candidate: &SelectorCandidate,
        per_candidate_timeout: Duration,
        signal: &ControlSignal,
    ) -> Result<ElementHandle, LocatorError> {
        if candidate.selectors.is_empty() {
            return Err(LocatorError::EmptyCandidates(candidate.action.clone()));
        }

        let total = candidate.selectors.len();
        for (index, selector) in candidate.selectors.iter().enumerate() {
            debug!(action = %candidate.action, selector = %selector, "probing selector");
            if self
                .poll(page, selector, per_candidate_timeout, signal)
                .await?
            {
                if index > 0 {
                    info!(
                        action = %candidate.action,
                        selector = %selector,
                        rank = index,
                        "resolved via fallback selector"
                    );
                }
                return Ok(ElementHandle {
                    action: candidate.action.clone(),
                    selector: selector.clone(),
                    candidate_index: index,
                });
            }
        }

        warn!(action = %candidate.action, candidates = total, "selector candidates exhausted");
        Err(LocatorError::NotFound {
            action: candidate.action.clone(),
            checked: total,
            total,
        })
    }

    /// Single non-waiting pass: whether any candidate matches right now.
    pub async fn present(
        &self,
        page: &dyn PageDriver,
        candidate: &SelectorCandidate,
    ) -> Result<bool, LocatorError> {
        for selector in &candidate.selectors {
            if check_presence(page, selector).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn poll(
        &self,
        page: &dyn PageDriver,
        selector: &str,
        timeout: Duration,
        signal: &ControlSignal,
    ) -> Result<bool, LocatorError> {
        let deadline = Instant::now() + timeout;
        loop {
            signal.checkpoint()?;
            if check_presence(page, selector).await? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            signal
                .sleep(self.poll_interval.min(deadline - now))
                .await?;
        }
    }
}

async fn check_presence(page: &dyn PageDriver, selector: &str) -> Result<bool, LocatorError> {
    match page.is_present(selector).await {
        Ok(found) => Ok(found),
        Err(err @ BrowserError::Crashed(_)) => Err(err.into()),
        Err(err) => {
            debug!(selector = %selector, error = %err, "presence check failed, treating as absent");
            Ok(false)
        }
    }
}

/// Selector candidates keyed by site, then by logical action:
/// `{ "capcut": { "generate_button": ["#generate", ".generate-btn"] } }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SelectorCatalog {
    sites: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

impl SelectorCatalog {
    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            source,
            path: path.to_path_buf(),
        })?;
        Self::from_json(&contents).map_err(|source| ConfigError::Catalog {
            source,
            path: path.to_path_buf(),
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn insert(&mut self, site: &str, action: &str, selectors: Vec<String>) {
        self.sites
            .entry(site.to_string())
            .or_default()
            .insert(action.to_string(), selectors);
    }

    /// Missing sites or actions yield an empty candidate, which the locator
    /// reports as a configuration error.
    pub fn candidate(&self, site: &str, action: &str) -> SelectorCandidate {
        let selectors = self
            .sites
            .get(site)
            .and_then(|actions| actions.get(action))
            .cloned()
            .unwrap_or_default();
        SelectorCandidate::new(action, selectors)
    }

    pub fn has_action(&self, site: &str, action: &str) -> bool {
        self.sites
            .get(site)
            .and_then(|actions| actions.get(action))
            .map(|selectors| !selectors.is_empty())
            .unwrap_or(false)
    }

    pub fn sites(&self) -> impl Iterator<Item = &str> {
        self.sites.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::super::session::testing::FakePage;
    use super::*;
    use crate::control::RunControl;

    fn candidate(selectors: &[&str]) -> SelectorCandidate {
        SelectorCandidate::new(
            "generate_button",
            selectors.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn empty_candidates_fail_before_touching_the_page() {
        let page = FakePage::default();
        let err = ElementLocator::new(Duration::from_millis(100))
            .resolve(
                &page,
                &candidate(&[]),
                Duration::from_secs(5),
                &ControlSignal::detached(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LocatorError::EmptyCandidates(ref action) if action == "generate_button"));
        assert!(page.lookup_log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn second_candidate_matches_when_first_is_absent() {
        let page = FakePage::with_present(&[".generate-btn"]);
        let handle = ElementLocator::new(Duration::from_millis(250))
            .resolve(
                &page,
                &candidate(&["#generate", ".generate-btn"]),
                Duration::from_secs(2),
                &ControlSignal::detached(),
            )
            .await
            .unwrap();
        assert_eq!(handle.selector, ".generate-btn");
        assert_eq!(handle.candidate_index, 1);
        let log = page.lookup_log();
        assert_eq!(log.last().map(String::as_str), Some(".generate-btn"));
        assert_eq!(log.iter().filter(|s| *s == ".generate-btn").count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_skips_remaining_candidates() {
        let page = FakePage::with_present(&["#a", "#b", "#c"]);
        let handle = ElementLocator::new(Duration::from_millis(10))
            .resolve(
                &page,
                &candidate(&["#a", "#b", "#c"]),
                Duration::from_secs(1),
                &ControlSignal::detached(),
            )
            .await
            .unwrap();
        assert_eq!(handle.candidate_index, 0);
        assert_eq!(page.lookup_log(), vec!["#a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_checks_each_candidate_at_most_once_in_order() {
        let page = FakePage::default();
        let selectors = ["#one", "#two", "#three", "#four"];
        let err = ElementLocator::new(Duration::from_millis(100))
            .resolve(
                &page,
                &candidate(&selectors),
                Duration::ZERO,
                &ControlSignal::detached(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LocatorError::NotFound { checked: 4, total: 4, .. }));
        assert_eq!(
            page.lookup_log(),
            selectors.iter().map(|s| s.to_string()).collect::<Vec<_>>()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn polling_stays_within_candidate_timeout() {
        let page = FakePage::default();
        let started = Instant::now();
        let _ = ElementLocator::new(Duration::from_millis(500))
            .resolve(
                &page,
                &candidate(&["#missing", "#also-missing"]),
                Duration::from_secs(2),
                &ControlSignal::detached(),
            )
            .await
            .unwrap_err();
        assert!(started.elapsed() <= Duration::from_secs(4) + Duration::from_millis(10));
        let distinct: std::collections::HashSet<_> = page.lookup_log().into_iter().collect();
        assert_eq!(distinct.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_request_interrupts_polling() {
        let page = FakePage::default();
        let control = RunControl::new();
        let signal = control.signal();
        let stopper = control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            stopper.request_stop();
        });
        let err = ElementLocator::new(Duration::from_millis(200))
            .resolve(
                &page,
                &candidate(&["#never"]),
                Duration::from_secs(600),
                &signal,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LocatorError::Cancelled(_)));
    }

    #[test]
    fn catalog_lookup_by_site_and_action() {
        let catalog = SelectorCatalog::from_json(
            r##"{"capcut": {"generate_button": ["#generate", ".generate-btn"]}}"##,
        )
        .unwrap();
        let found = catalog.candidate("capcut", "generate_button");
        assert_eq!(found.selectors.len(), 2);
        assert!(catalog.candidate("capcut", "export_button").selectors.is_empty());
        assert!(catalog.candidate("youtube", "generate_button").selectors.is_empty());
        assert!(catalog.has_action("capcut", "generate_button"));
    }
}
