mod automation;
mod error;
mod locator;
mod profile;
mod session;

pub use automation::{BrowserKind, ChromiumDriver, ChromiumSession};
pub use error::{BrowserError, BrowserResult};
pub use locator::{ElementHandle, ElementLocator, LocatorError, SelectorCandidate, SelectorCatalog};
pub use profile::ProfileManager;
pub use session::{
    BrowserSession, BrowserSessionManager, PageDriver, SessionDriver, SessionLease,
    SessionRequest, SessionTarget, SharedSession,
};

#[cfg(test)]
pub(crate) use session::testing;
