//! Browser driver: one page, navigation, element actions and a response feed.
//!
//! The driver never filters responses. Every finished (or failed) network
//! response is pushed onto the subscriber channel; deciding which ones matter
//! is the router's job.

mod chromium;
mod config;
pub mod scripted;
mod selector;
mod stealth;
mod types;

pub use chromium::ChromiumDriver;
pub use config::{default_login_fragments, BrowserEngineConfig};
pub use scripted::{ClickEffect, ScriptedDriver, ScriptedPage, ScriptedResponse};
pub use selector::Selector;
pub use types::{BodyHandle, BodySource, ElementRef, PageState, RawResponse, ResourceKind};

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Result, ScrapeError};
use crate::session::SessionCookie;

/// Polling interval for selector waits.
const SELECTOR_POLL: Duration = Duration::from_millis(250);

/// Operations the scrape core needs from a browser page.
#[async_trait]
pub trait PageDriver: Send {
    /// Navigate and wait for DOM readiness, then (non-fatally) for network idle.
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<PageState>;

    /// Find the first element matching `selector`, if any.
    async fn locate(&mut self, selector: &str) -> Result<Option<ElementRef>>;

    async fn click(&mut self, element: &ElementRef) -> Result<()>;

    /// Replace the response subscriber. Earlier receivers stop getting events.
    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<RawResponse>;

    async fn current_url(&mut self) -> Result<String>;

    async fn cookies(&mut self) -> Result<Vec<SessionCookie>>;

    async fn set_cookies(&mut self, cookies: &[SessionCookie]) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    /// Poll `locate` until the element appears or `timeout` elapses.
    async fn wait_for_selector(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> Result<Option<ElementRef>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.locate(selector).await {
                Ok(Some(el)) if el.visible => return Ok(Some(el)),
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::debug!("locate {} failed while waiting: {}", selector, e),
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(SELECTOR_POLL).await;
        }
    }

}

/// Error for operations attempted on a closed driver.
pub(crate) fn closed() -> ScrapeError {
    ScrapeError::BrowserClosed("driver already closed".to_string())
}
