use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::config::BrowserSection;
use crate::stage::StageError;

use super::automation::BrowserKind;
use super::error::{BrowserError, BrowserResult};

/// Page-level operations the locator and the web providers need. Selectors
/// are CSS unless they start with `/` or `(`, in which case they are XPath.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn goto(&self, url: &str) -> BrowserResult<()>;
    /// Whether `selector` currently matches an element that can be
    /// interacted with.
    async fn is_present(&self, selector: &str) -> BrowserResult<bool>;
    async fn click(&self, selector: &str) -> BrowserResult<()>;
    async fn type_text(&self, selector: &str, text: &str) -> BrowserResult<()>;
    async fn read_text(&self, selector: &str) -> BrowserResult<String>;
    async fn read_attribute(&self, selector: &str, name: &str) -> BrowserResult<Option<String>>;
    async fn set_files(&self, selector: &str, files: &[PathBuf]) -> BrowserResult<()>;
    async fn set_download_dir(&self, dir: &Path) -> BrowserResult<()>;
    /// Full-page PNG of the current state.
    async fn screenshot(&self) -> BrowserResult<Vec<u8>>;
}

#[async_trait]
pub trait BrowserSession: Send + Sync {
    fn label(&self) -> String;
    fn page(&self) -> &dyn PageDriver;
    async fn is_alive(&self) -> bool;
    /// Closes a launched browser; detaches from an attached one.
    async fn close(&self) -> BrowserResult<()>;
}

pub type SharedSession = Arc<dyn BrowserSession>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTarget {
    Ephemeral,
    Profile(PathBuf),
    DebugAttach(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub preference: Vec<BrowserKind>,
    pub headless: bool,
    pub target: SessionTarget,
}

impl SessionRequest {
    pub fn from_config(browser: &BrowserSection, profile_dir: Option<PathBuf>) -> Self {
        let target = match (&browser.debug_attach, profile_dir) {
            (Some(endpoint), _) => SessionTarget::DebugAttach(endpoint.clone()),
            (None, Some(dir)) => SessionTarget::Profile(dir),
            (None, None) => SessionTarget::Ephemeral,
        };
        Self {
            preference: browser.preference(),
            headless: browser.headless,
            target,
        }
    }
}

#[async_trait]
pub trait SessionDriver: Send + Sync {
    async fn launch(
        &self,
        kind: BrowserKind,
        headless: bool,
        profile: Option<&Path>,
    ) -> BrowserResult<SharedSession>;
    async fn attach(&self, endpoint: &str) -> BrowserResult<SharedSession>;
}

/// Owns the single browser session of an orchestrator. At most one lease is
/// out at a time; with keep-alive enabled a released session is parked and
/// handed to the next stage that asks for one.
pub struct BrowserSessionManager {
    driver: Arc<dyn SessionDriver>,
    request: SessionRequest,
    keep_alive: bool,
    parked: AsyncMutex<Option<SharedSession>>,
    busy: Arc<AtomicBool>,
}

impl BrowserSessionManager {
    pub fn new(driver: Arc<dyn SessionDriver>, request: SessionRequest, keep_alive: bool) -> Self {
        Self {
            driver,
            request,
            keep_alive,
            parked: AsyncMutex::new(None),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn request(&self) -> &SessionRequest {
        &self.request
    }

    pub async fn acquire(&self) -> BrowserResult<SessionLease<'_>> {
        let request = self.request.clone();
        self.acquire_with(&request).await
    }

    pub async fn acquire_with(&self, request: &SessionRequest) -> BrowserResult<SessionLease<'_>> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BrowserError::Busy);
        }
        let claim = BusyFlag(Arc::clone(&self.busy));

        let parked = self.parked.lock().await.take();
        if let Some(session) = parked {
            if session.is_alive().await {
                debug!(session = %session.label(), "reusing parked browser session");
                return Ok(SessionLease::new(self, session, claim));
            }
            warn!(session = %session.label(), "parked browser session is gone, discarding");
            if let Err(err) = session.close().await {
                debug!(error = %err, "closing dead session failed");
            }
        }

        let session = self.open(request).await?;
        Ok(SessionLease::new(self, session, claim))
    }

    async fn open(&self, request: &SessionRequest) -> BrowserResult<SharedSession> {
        let profile = match &request.target {
            SessionTarget::DebugAttach(endpoint) => {
                info!(endpoint = %endpoint, "attaching to running browser");
                return self.driver.attach(endpoint).await;
            }
            SessionTarget::Profile(dir) => Some(dir.as_path()),
            SessionTarget::Ephemeral => None,
        };

        let mut last_error = None;
        for kind in &request.preference {
            info!(browser = %kind, headless = request.headless, "launching browser");
            match self.driver.launch(*kind, request.headless, profile).await {
                Ok(session) => return Ok(session),
                Err(err) => {
                    warn!(browser = %kind, error = %err, "browser launch failed");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            BrowserError::Configuration("no browser in preference order".into())
        }))
    }

    async fn finish(&self, session: SharedSession, reusable: bool) {
        if reusable && self.keep_alive && session.is_alive().await {
            debug!(session = %session.label(), "parking browser session");
            *self.parked.lock().await = Some(session);
            return;
        }
        if let Err(err) = session.close().await {
            warn!(session = %session.label(), error = %err, "failed to close browser session");
        }
    }

    /// Runs `op` on a leased session. A crash is retried exactly once on a
    /// freshly acquired session; a second crash is returned to the caller.
    pub async fn with_session<T, F, Fut>(&self, mut op: F) -> Result<T, StageError>
    where
        F: FnMut(SharedSession) -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        let lease = self.acquire().await?;
        let result = op(lease.session()).await;
        match result {
            Err(StageError::BrowserCrash(reason)) => {
                warn!(reason = %reason, "browser crashed mid-stage, re-acquiring session once");
                lease.discard().await;
                let lease = self.acquire().await?;
                let retried = op(lease.session()).await;
                lease.release_after(&retried).await;
                retried
            }
            other => {
                lease.release_after(&other).await;
                other
            }
        }
    }

    /// Closes a parked session, if any.
    pub async fn shutdown(&self) {
        let parked = self.parked.lock().await.take();
        if let Some(session) = parked {
            info!(session = %session.label(), "shutting down browser session");
            if let Err(err) = session.close().await {
                warn!(error = %err, "failed to close browser session");
            }
        }
    }
}

impl std::fmt::Debug for BrowserSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserSessionManager")
            .field("request", &self.request)
            .field("keep_alive", &self.keep_alive)
            .field("busy", &self.busy.load(Ordering::Relaxed))
            .finish()
    }
}

struct BusyFlag(Arc<AtomicBool>);

impl Drop for BusyFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Exclusive use of the manager's session. Dropping a lease without
/// releasing it closes the session in the background.
pub struct SessionLease<'a> {
    manager: &'a BrowserSessionManager,
    session: SharedSession,
    settled: bool,
    _claim: BusyFlag,
}

impl<'a> SessionLease<'a> {
    fn new(manager: &'a BrowserSessionManager, session: SharedSession, claim: BusyFlag) -> Self {
        Self {
            manager,
            session,
            settled: false,
            _claim: claim,
        }
    }

    pub fn session(&self) -> SharedSession {
        Arc::clone(&self.session)
    }

    pub async fn release(self) {
        self.settle(true).await;
    }

    pub async fn discard(self) {
        self.settle(false).await;
    }

    async fn release_after<T>(self, result: &Result<T, StageError>) {
        let reusable = !matches!(result, Err(StageError::BrowserCrash(_)));
        self.settle(reusable).await;
    }

    async fn settle(mut self, reusable: bool) {
        self.settled = true;
        let session = Arc::clone(&self.session);
        self.manager.finish(session, reusable).await;
    }
}

impl Drop for SessionLease<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let session = Arc::clone(&self.session);
        warn!(session = %session.label(), "session lease dropped without release");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = session.close().await {
                        warn!(error = %err, "background session close failed");
                    }
                });
            }
            Err(_) => warn!("no runtime available to close browser session"),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// In-memory page: a selector "exists" when it is in `present`, unless
    /// `presence` scripts it check by check. `text_sequence` scripts
    /// successive reads the same way; the last entry of a script sticks.
    #[derive(Default)]
    pub struct FakePage {
        pub present: Mutex<HashSet<String>>,
        pub presence: Mutex<HashMap<String, VecDeque<bool>>>,
        pub lookups: Mutex<Vec<String>>,
        pub clicks: Mutex<Vec<String>>,
        pub failing_clicks: Mutex<HashSet<String>>,
        pub typed: Mutex<Vec<(String, String)>>,
        pub texts: Mutex<HashMap<String, String>>,
        pub text_sequence: Mutex<HashMap<String, VecDeque<String>>>,
        pub files: Mutex<Vec<(String, Vec<PathBuf>)>>,
        /// Clicking the key writes a finished download to the value.
        pub downloads_on_click: Mutex<HashMap<String, PathBuf>>,
        pub screenshots: AtomicUsize,
    }

    impl FakePage {
        pub fn with_present(selectors: &[&str]) -> Self {
            let page = Self::default();
            page.present
                .lock()
                .unwrap()
                .extend(selectors.iter().map(|s| s.to_string()));
            page
        }

        pub fn lookup_log(&self) -> Vec<String> {
            self.lookups.lock().unwrap().clone()
        }

        pub fn click_log(&self) -> Vec<String> {
            self.clicks.lock().unwrap().clone()
        }

        pub fn script_presence(&self, selector: &str, states: &[bool]) {
            self.presence
                .lock()
                .unwrap()
                .insert(selector.to_string(), states.iter().copied().collect());
        }

        pub fn script_texts(&self, selector: &str, texts: &[&str]) {
            self.present.lock().unwrap().insert(selector.to_string());
            self.text_sequence.lock().unwrap().insert(
                selector.to_string(),
                texts.iter().map(|t| t.to_string()).collect(),
            );
        }
    }

    fn next_scripted<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }

    #[async_trait]
    impl PageDriver for FakePage {
        async fn goto(&self, _url: &str) -> BrowserResult<()> {
            Ok(())
        }

        async fn is_present(&self, selector: &str) -> BrowserResult<bool> {
            self.lookups.lock().unwrap().push(selector.to_string());
            if let Some(states) = self.presence.lock().unwrap().get_mut(selector) {
                return Ok(next_scripted(states).unwrap_or(false));
            }
            Ok(self.present.lock().unwrap().contains(selector))
        }

        async fn click(&self, selector: &str) -> BrowserResult<()> {
            self.clicks.lock().unwrap().push(selector.to_string());
            if self.failing_clicks.lock().unwrap().contains(selector) {
                return Err(BrowserError::Timeout(format!("click on {selector}")));
            }
            let download = self.downloads_on_click.lock().unwrap().get(selector).cloned();
            if let Some(path) = download {
                std::fs::write(path, b"rendered video")?;
            }
            Ok(())
        }

        async fn type_text(&self, selector: &str, text: &str) -> BrowserResult<()> {
            self.typed
                .lock()
                .unwrap()
                .push((selector.to_string(), text.to_string()));
            Ok(())
        }

        async fn read_text(&self, selector: &str) -> BrowserResult<String> {
            if let Some(texts) = self.text_sequence.lock().unwrap().get_mut(selector) {
                return Ok(next_scripted(texts).unwrap_or_default());
            }
            Ok(self
                .texts
                .lock()
                .unwrap()
                .get(selector)
                .cloned()
                .unwrap_or_default())
        }

        async fn read_attribute(
            &self,
            _selector: &str,
            _name: &str,
        ) -> BrowserResult<Option<String>> {
            Ok(None)
        }

        async fn set_files(&self, selector: &str, files: &[PathBuf]) -> BrowserResult<()> {
            self.files
                .lock()
                .unwrap()
                .push((selector.to_string(), files.to_vec()));
            Ok(())
        }

        async fn set_download_dir(&self, _dir: &Path) -> BrowserResult<()> {
            Ok(())
        }

        async fn screenshot(&self) -> BrowserResult<Vec<u8>> {
            self.screenshots.fetch_add(1, Ordering::SeqCst);
            Ok(b"\x89PNG fake".to_vec())
        }
    }

    pub struct FakeSession {
        pub label: String,
        pub page: FakePage,
        pub alive: AtomicBool,
        pub closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BrowserSession for FakeSession {
        fn label(&self) -> String {
            self.label.clone()
        }

        fn page(&self) -> &dyn PageDriver {
            &self.page
        }

        async fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn close(&self) -> BrowserResult<()> {
            self.alive.store(false, Ordering::SeqCst);
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeDriver {
        pub failing: Mutex<HashSet<BrowserKind>>,
        pub attach_fails: AtomicBool,
        pub launches: Mutex<Vec<BrowserKind>>,
        pub attaches: AtomicUsize,
        pub closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SessionDriver for FakeDriver {
        async fn launch(
            &self,
            kind: BrowserKind,
            _headless: bool,
            _profile: Option<&Path>,
        ) -> BrowserResult<SharedSession> {
            self.launches.lock().unwrap().push(kind);
            if self.failing.lock().unwrap().contains(&kind) {
                return Err(BrowserError::Launch(format!("{kind} executable missing")));
            }
            Ok(Arc::new(FakeSession {
                label: kind.to_string(),
                page: FakePage::default(),
                alive: AtomicBool::new(true),
                closed: Arc::clone(&self.closed),
            }))
        }

        async fn attach(&self, endpoint: &str) -> BrowserResult<SharedSession> {
            self.attaches.fetch_add(1, Ordering::SeqCst);
            if self.attach_fails.load(Ordering::SeqCst) {
                return Err(BrowserError::Attach {
                    endpoint: endpoint.to_string(),
                    reason: "connection refused".into(),
                });
            }
            Ok(Arc::new(FakeSession {
                label: format!("attached:{endpoint}"),
                page: FakePage::default(),
                alive: AtomicBool::new(true),
                closed: Arc::clone(&self.closed),
            }))
        }
    }
}
