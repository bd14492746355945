use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::browser::{
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::cdp::browser_protocol::dom::SetFileInputFilesParams;
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::element::Element;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{BrowserSection, ExecutablesSection};

use super::error::{BrowserError, BrowserResult};
use super::profile::ProfileManager;
use super::session::{BrowserSession, PageDriver, SessionDriver, SharedSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowserKind {
    Chrome,
    Edge,
    Chromium,
}

impl BrowserKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserKind::Chrome => "chrome",
            BrowserKind::Edge => "edge",
            BrowserKind::Chromium => "chromium",
        }
    }
}

impl fmt::Display for BrowserKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BrowserKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chrome" => Ok(BrowserKind::Chrome),
            "edge" => Ok(BrowserKind::Edge),
            "chromium" => Ok(BrowserKind::Chromium),
            other => Err(format!("unknown browser: {other}")),
        }
    }
}

/// Launches chromium-family browsers over CDP.
#[derive(Debug, Clone)]
pub struct ChromiumDriver {
    executables: ExecutablesSection,
    sandbox: bool,
    page_load_timeout: Duration,
    profiles: Option<ProfileManager>,
}

impl ChromiumDriver {
    pub fn new(config: &BrowserSection, profiles: Option<ProfileManager>) -> Self {
        Self {
            executables: config.executables.clone(),
            sandbox: config.sandbox,
            page_load_timeout: config.page_load_timeout(),
            profiles,
        }
    }

    fn build_config(
        &self,
        kind: BrowserKind,
        headless: bool,
        user_data_dir: &Path,
    ) -> BrowserResult<ChromiumConfig> {
        let mut builder = ChromiumConfig::builder()
            .user_data_dir(user_data_dir)
            .request_timeout(self.page_load_timeout);

        match (kind, self.executables.for_kind(kind)) {
            (_, Some(path)) => builder = builder.chrome_executable(path),
            (BrowserKind::Edge, None) => {
                return Err(BrowserError::Launch(
                    "no executable configured for edge".into(),
                ))
            }
            // chromiumoxide locates a chrome/chromium install on its own
            (_, None) => {}
        }

        if !headless {
            builder = builder.with_head();
        }
        if !self.sandbox {
            builder = builder.no_sandbox();
        }

        builder = builder.args(vec![
            "--no-first-run".to_string(),
            "--disable-blink-features=AutomationControlled".to_string(),
            "--disable-features=AutomationControlled".to_string(),
            "--password-store=basic".to_string(),
        ]);

        builder.build().map_err(BrowserError::Configuration)
    }
}

fn spawn_handler(mut handler: chromiumoxide::handler::Handler) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(err) = event {
                debug!(error = %err, "browser handler reported error");
            }
        }
    })
}

#[async_trait]
impl SessionDriver for ChromiumDriver {
    async fn launch(
        &self,
        kind: BrowserKind,
        headless: bool,
        profile: Option<&Path>,
    ) -> BrowserResult<SharedSession> {
        let (user_data_dir, scratch) = match profile {
            Some(dir) => {
                let dir = match &self.profiles {
                    Some(profiles) => profiles.prepare(dir).await?,
                    None => dir.to_path_buf(),
                };
                (dir, None)
            }
            None => {
                let scratch = tempfile::Builder::new()
                    .prefix("autoreel-profile-")
                    .tempdir()?;
                (scratch.path().to_path_buf(), Some(scratch))
            }
        };

        let config = self.build_config(kind, headless, &user_data_dir)?;
        info!(
            browser = %kind,
            profile = %user_data_dir.display(),
            headless,
            "launching chromium instance"
        );
        let (browser, handler) = Browser::launch(config)
            .await
            .map_err(|err| BrowserError::Launch(format!("{kind}: {err}")))?;
        let handler_task = spawn_handler(handler);

        let page = match browser.new_page(CreateTargetParams::new("about:blank")).await {
            Ok(page) => page,
            Err(err) => {
                handler_task.abort();
                return Err(BrowserError::Launch(format!("{kind}: {err}")));
            }
        };

        Ok(std::sync::Arc::new(ChromiumSession {
            label: kind.to_string(),
            browser: AsyncMutex::new(browser),
            page,
            handler_task: Mutex::new(Some(handler_task)),
            attached: false,
            page_load_timeout: self.page_load_timeout,
            _scratch_profile: scratch,
        }))
    }

    async fn attach(&self, endpoint: &str) -> BrowserResult<SharedSession> {
        let (browser, handler) =
            Browser::connect(endpoint)
                .await
                .map_err(|err| BrowserError::Attach {
                    endpoint: endpoint.to_string(),
                    reason: err.to_string(),
                })?;
        let handler_task = spawn_handler(handler);
        let page = browser
            .new_page(CreateTargetParams::new("about:blank"))
            .await
            .map_err(|err| BrowserError::Attach {
                endpoint: endpoint.to_string(),
                reason: err.to_string(),
            })?;
        Ok(std::sync::Arc::new(ChromiumSession {
            label: format!("attached:{endpoint}"),
            browser: AsyncMutex::new(browser),
            page,
            handler_task: Mutex::new(Some(handler_task)),
            attached: true,
            page_load_timeout: self.page_load_timeout,
            _scratch_profile: None,
        }))
    }
}

const TARGET_ATTRIBUTE: &str = "data-autoreel-target";

fn lookup_script(selector: &str) -> BrowserResult<String> {
    let quoted = serde_json::to_string(selector)
        .map_err(|err| BrowserError::Unexpected(format!("unencodable selector: {err}")))?;
    Ok(format!(
        "const sel = {quoted};\n\
         const node = (sel.startsWith('/') || sel.startsWith('('))\n\
           ? document.evaluate(sel, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue\n\
           : document.querySelector(sel);"
    ))
}

pub struct ChromiumSession {
    label: String,
    browser: AsyncMutex<Browser>,
    page: Page,
    handler_task: Mutex<Option<JoinHandle<()>>>,
    attached: bool,
    page_load_timeout: Duration,
    _scratch_profile: Option<TempDir>,
}

impl ChromiumSession {
    pub fn raw_page(&self) -> &Page {
        &self.page
    }

    /// Marks the node matched by `selector` and resolves it as a CDP element.
    async fn element(&self, selector: &str) -> BrowserResult<Element> {
        let marker = Uuid::new_v4().simple().to_string();
        let script = format!(
            "(() => {{\n{lookup}\nif (!node) return false;\nnode.setAttribute('{TARGET_ATTRIBUTE}', '{marker}');\nreturn true;\n}})()",
            lookup = lookup_script(selector)?,
        );
        let found: bool = self
            .page
            .evaluate(script.as_str())
            .await?
            .into_value()
            .map_err(|err| BrowserError::Unexpected(format!("failed to tag element: {err}")))?;
        if !found {
            return Err(BrowserError::Timeout(format!("element {selector}")));
        }
        let element = self
            .page
            .find_element(format!("[{TARGET_ATTRIBUTE}='{marker}']"))
            .await?;
        Ok(element)
    }
}

#[async_trait]
impl PageDriver for ChromiumSession {
    async fn goto(&self, url: &str) -> BrowserResult<()> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(BrowserError::Configuration)?;
        let navigation = async {
            self.page.goto(params).await?;
            self.page.wait_for_navigation().await?;
            Ok::<_, BrowserError>(())
        };
        timeout(self.page_load_timeout, navigation)
            .await
            .map_err(|_| BrowserError::Timeout(format!("page load {url}")))?
    }

    async fn is_present(&self, selector: &str) -> BrowserResult<bool> {
        let script = format!(
            "(() => {{\n{lookup}\nif (!node) return false;\n\
             if (node.disabled) return false;\n\
             if (node.tagName === 'INPUT' && node.type === 'file') return true;\n\
             const rect = node.getBoundingClientRect();\n\
             const style = window.getComputedStyle(node);\n\
             return rect.width > 0 && rect.height > 0 && style.visibility !== 'hidden' && style.display !== 'none';\n\
             }})()",
            lookup = lookup_script(selector)?,
        );
        let visible: bool = self
            .page
            .evaluate(script.as_str())
            .await?
            .into_value()
            .map_err(|err| BrowserError::Unexpected(format!("failed to look up {selector}: {err}")))?;
        Ok(visible)
    }

    async fn click(&self, selector: &str) -> BrowserResult<()> {
        let element = self.element(selector).await?;
        element.scroll_into_view().await?;
        element.click().await?;
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> BrowserResult<()> {
        let element = self.element(selector).await?;
        element.click().await?;
        let value = serde_json::to_string(text)
            .map_err(|err| BrowserError::Unexpected(format!("unencodable text: {err}")))?;
        // Long scripts are pasted rather than typed key by key.
        let function = format!(
            "function() {{\n\
               const value = {value};\n\
               if ('value' in this) {{ this.value = value; }} else {{ this.textContent = value; }}\n\
               this.dispatchEvent(new Event('input', {{ bubbles: true }}));\n\
               this.dispatchEvent(new Event('change', {{ bubbles: true }}));\n\
             }}"
        );
        element.call_js_fn(function, false).await?;
        Ok(())
    }

    async fn read_text(&self, selector: &str) -> BrowserResult<String> {
        let element = self.element(selector).await?;
        Ok(element.inner_text().await?.unwrap_or_default())
    }

    async fn read_attribute(&self, selector: &str, name: &str) -> BrowserResult<Option<String>> {
        let element = self.element(selector).await?;
        Ok(element.attribute(name).await?)
    }

    async fn set_files(&self, selector: &str, files: &[PathBuf]) -> BrowserResult<()> {
        let element = self.element(selector).await?;
        let files = files
            .iter()
            .map(|path| path.display().to_string())
            .collect::<Vec<_>>();
        let params = SetFileInputFilesParams::builder()
            .files(files)
            .backend_node_id(element.backend_node_id)
            .build()
            .map_err(BrowserError::Configuration)?;
        self.page.execute(params).await?;
        Ok(())
    }

    async fn set_download_dir(&self, dir: &Path) -> BrowserResult<()> {
        let params = SetDownloadBehaviorParams::builder()
            .behavior(SetDownloadBehaviorBehavior::Allow)
            .download_path(dir.display().to_string())
            .build()
            .map_err(BrowserError::Configuration)?;
        self.page.execute(params).await?;
        Ok(())
    }

    async fn screenshot(&self) -> BrowserResult<Vec<u8>> {
        let params = ScreenshotParams::builder().full_page(true).build();
        Ok(self.page.screenshot(params).await?)
    }
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn page(&self) -> &dyn PageDriver {
        self
    }

    async fn is_alive(&self) -> bool {
        let browser = self.browser.lock().await;
        browser.version().await.is_ok()
    }

    async fn close(&self) -> BrowserResult<()> {
        let handle = match self.handler_task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if self.attached {
            // Leave an externally prepared browser running.
            info!(session = %self.label, "detaching from browser");
            if let Some(handle) = handle {
                handle.abort();
            }
            return Ok(());
        }

        info!(session = %self.label, "shutting down chromium instance");
        {
            let mut browser = self.browser.lock().await;
            if let Err(err) = browser.close().await {
                warn!(error = %err, "failed to close browser gracefully");
            }
        }
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!(error = %err, "browser handler join error");
                }
            }
        }
        Ok(())
    }
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        let pending = match self.handler_task.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = pending {
            if !handle.is_finished() {
                warn!(session = %self.label, "browser session dropped without explicit close");
                handle.abort();
            }
        }
    }
}
