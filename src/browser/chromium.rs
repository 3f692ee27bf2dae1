//! Chromium page driver over the DevTools protocol.
//!
//! Uses chromiumoxide (CDP). One browser, one page; network events are
//! pumped on a background task and turned into `RawResponse`s whose bodies
//! are fetched lazily with `Network.getResponseBody`.

#[cfg(feature = "browser")]
use std::collections::HashMap;
#[cfg(feature = "browser")]
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "browser")]
use std::sync::{Arc, Mutex};
use std::time::Duration;
#[cfg(feature = "browser")]
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::mpsc;
#[cfg(feature = "browser")]
use tokio::task::JoinHandle;
#[cfg(feature = "browser")]
use tracing::{debug, info, warn};

#[cfg(feature = "browser")]
use base64::Engine;
#[cfg(feature = "browser")]
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, EnableParams, EventLoadingFailed, EventLoadingFinished, EventResponseReceived,
    GetResponseBodyParams, RequestId, ResourceType, SetUserAgentOverrideParams, TimeSinceEpoch,
};
#[cfg(feature = "browser")]
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, NavigateParams,
};
#[cfg(feature = "browser")]
use chromiumoxide::{Browser, BrowserConfig, Page};
#[cfg(feature = "browser")]
use futures::StreamExt;
#[cfg(feature = "browser")]
use serde::Deserialize;

use super::config::BrowserEngineConfig;
#[cfg(feature = "browser")]
use super::selector::Selector;
#[cfg(feature = "browser")]
use super::stealth::{STEALTH_ARGS, STEALTH_SCRIPTS};
#[cfg(feature = "browser")]
use super::types::{BodyHandle, BodySource, ResourceKind};
use super::types::{ElementRef, PageState, RawResponse};
use super::PageDriver;
use crate::error::{Result, ScrapeError};
use crate::session::SessionCookie;

#[cfg(feature = "browser")]
const WAIT_FOR_READY_SCRIPT: &str = r#"
    new Promise((resolve) => {
        if (document.readyState === 'complete' || document.readyState === 'interactive') {
            resolve(document.readyState);
        } else {
            document.addEventListener('DOMContentLoaded', () => resolve(document.readyState));
        }
    })
"#;

#[cfg(feature = "browser")]
type Sink = Arc<Mutex<Option<mpsc::UnboundedSender<RawResponse>>>>;

/// Milliseconds since the driver started at which the network was last active.
#[cfg(feature = "browser")]
struct ActivityClock {
    origin: Instant,
    last_ms: AtomicU64,
}

#[cfg(feature = "browser")]
impl ActivityClock {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Relaxed);
    }

    fn quiet_for(&self) -> Duration {
        let now = self.origin.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_ms.load(Ordering::Relaxed)))
    }
}

#[cfg(feature = "browser")]
fn cdp_error(e: impl std::fmt::Display) -> ScrapeError {
    ScrapeError::from_browser_message(e.to_string())
}

/// Real browser driver.
#[cfg(feature = "browser")]
pub struct ChromiumDriver {
    config: BrowserEngineConfig,
    browser: Option<Browser>,
    page: Option<Page>,
    handler_task: Option<JoinHandle<()>>,
    pump_task: Option<JoinHandle<()>>,
    sink: Sink,
    activity: Arc<ActivityClock>,
}

#[cfg(feature = "browser")]
impl ChromiumDriver {
    /// Common Chrome executable paths to check.
    const CHROME_PATHS: &'static [&'static str] = &[
        // Linux
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/snap/bin/chromium",
        // macOS
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
        "/opt/google/chrome/google-chrome",
    ];

    const CHROME_COMMANDS: &'static [&'static str] = &[
        "google-chrome",
        "google-chrome-stable",
        "chromium",
        "chromium-browser",
    ];

    fn find_chrome() -> Result<std::path::PathBuf> {
        for path in Self::CHROME_PATHS {
            let p = std::path::Path::new(path);
            if p.exists() {
                info!("Found Chrome at: {}", path);
                return Ok(p.to_path_buf());
            }
        }

        for cmd in Self::CHROME_COMMANDS {
            if let Ok(path) = which::which(cmd) {
                info!("Found Chrome in PATH: {}", path.display());
                return Ok(path);
            }
        }

        Err(ScrapeError::Config(
            "Chrome/Chromium not found. Please install it:\n\
             - Arch/Manjaro: sudo pacman -S chromium\n\
             - Ubuntu/Debian: sudo apt install chromium-browser\n\
             - Fedora: sudo dnf install chromium\n\
             - Or download from: https://www.google.com/chrome/"
                .to_string(),
        ))
    }

    /// Launch (or connect to) a browser and open the working page.
    pub async fn launch(config: BrowserEngineConfig) -> Result<Self> {
        let (browser, mut handler) = match config.remote_url.clone() {
            Some(remote_url) => Self::connect_remote(&remote_url).await?,
            None => {
                info!("Launching browser (headless={})", config.headless);
                let chrome_path = Self::find_chrome()?;
                let mut builder = BrowserConfig::builder()
                    .chrome_executable(chrome_path)
                    .window_size(config.viewport.0, config.viewport.1);

                // with_head means NOT headless
                if !config.headless {
                    builder = builder.with_head();
                }
                if let Some(ref proxy) = config.proxy {
                    builder = builder.arg(format!("--proxy-server={}", proxy));
                }
                if config.stealth {
                    for arg in STEALTH_ARGS {
                        builder = builder.arg(*arg);
                    }
                }
                for arg in &config.chrome_args {
                    builder = builder.arg(arg);
                }

                let browser_config = builder
                    .build()
                    .map_err(|e| ScrapeError::Config(format!("Failed to build browser config: {}", e)))?;
                Browser::launch(browser_config).await.map_err(cdp_error)?
            }
        };

        let handler_task = tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if h.is_err() {
                    break;
                }
            }
        });

        let page = browser.new_page("about:blank").await.map_err(cdp_error)?;
        page.execute(SetUserAgentOverrideParams::new(config.user_agent.clone()))
            .await
            .map_err(cdp_error)?;
        if config.stealth {
            for script in STEALTH_SCRIPTS {
                page.execute(AddScriptToEvaluateOnNewDocumentParams::new(script.to_string()))
                    .await
                    .map_err(cdp_error)?;
            }
        }
        page.execute(EnableParams::default()).await.map_err(cdp_error)?;

        let mut driver = Self {
            config,
            browser: Some(browser),
            page: Some(page),
            handler_task: Some(handler_task),
            pump_task: None,
            sink: Arc::new(Mutex::new(None)),
            activity: Arc::new(ActivityClock::new()),
        };
        driver.start_event_pump().await?;
        Ok(driver)
    }

    /// Connect to a remote Chrome instance via its `/json/version` endpoint.
    async fn connect_remote(url: &str) -> Result<(Browser, chromiumoxide::Handler)> {
        info!("Connecting to remote browser at {}", url);

        let http_url = url
            .replace("ws://", "http://")
            .replace("wss://", "https://");
        let version_url = format!("{}/json/version", http_url.trim_end_matches('/'));

        let resp: serde_json::Value = reqwest::Client::new()
            .get(&version_url)
            .send()
            .await
            .map_err(|e| ScrapeError::ConnectionReset(format!("{}: {}", version_url, e)))?
            .json()
            .await
            .map_err(|e| ScrapeError::Browser(format!("Failed to parse browser version info: {}", e)))?;

        let ws_url = resp
            .get("webSocketDebuggerUrl")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ScrapeError::Browser("No webSocketDebuggerUrl in response".to_string()))?;

        info!("Connecting to WebSocket: {}", ws_url);
        Browser::connect(ws_url).await.map_err(cdp_error)
    }

    fn page(&self) -> Result<&Page> {
        self.page.as_ref().ok_or_else(super::closed)
    }

    async fn start_event_pump(&mut self) -> Result<()> {
        let page = self.page()?.clone();
        let mut received = page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(cdp_error)?;
        let mut finished = page
            .event_listener::<EventLoadingFinished>()
            .await
            .map_err(cdp_error)?;
        let mut failed = page
            .event_listener::<EventLoadingFailed>()
            .await
            .map_err(cdp_error)?;

        let sink = self.sink.clone();
        let activity = self.activity.clone();

        self.pump_task = Some(tokio::spawn(async move {
            let mut pending: HashMap<String, PendingResponse> = HashMap::new();
            loop {
                tokio::select! {
                    Some(ev) = received.next() => {
                        activity.touch();
                        pending.insert(
                            ev.request_id.inner().clone(),
                            PendingResponse {
                                url: ev.response.url.clone(),
                                status: u16::try_from(ev.response.status).unwrap_or(0),
                                resource_kind: resource_kind(&ev.r#type),
                                mime_type: ev.response.mime_type.clone(),
                                received_at: std::time::Instant::now(),
                            },
                        );
                    }
                    Some(ev) = finished.next() => {
                        activity.touch();
                        let request_id = ev.request_id.inner().clone();
                        if let Some(meta) = pending.remove(&request_id) {
                            let body = BodyHandle::new(CdpBody {
                                page: page.clone(),
                                request_id: request_id.clone(),
                            });
                            emit(&sink, meta.into_raw(request_id, Some(body)));
                        }
                    }
                    Some(ev) = failed.next() => {
                        activity.touch();
                        let request_id = ev.request_id.inner().clone();
                        if let Some(meta) = pending.remove(&request_id) {
                            debug!("Loading failed for {}: {}", meta.url, ev.error_text);
                            emit(&sink, meta.into_raw(request_id, None));
                        }
                    }
                    else => break,
                }
            }
            debug!("Network event pump stopped");
        }));
        Ok(())
    }

    /// Wait until no network event has been seen for the quiet period.
    /// Never fails; a busy page just means we move on.
    async fn wait_for_network_idle(&self) {
        let quiet = Duration::from_millis(self.config.idle_quiet_ms);
        let deadline = Instant::now() + Duration::from_millis(self.config.network_idle_timeout_ms);
        while Instant::now() < deadline {
            if self.activity.quiet_for() >= quiet {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        debug!("Network did not go idle within {}ms", self.config.network_idle_timeout_ms);
    }
}

#[cfg(feature = "browser")]
struct PendingResponse {
    url: String,
    status: u16,
    resource_kind: ResourceKind,
    mime_type: String,
    /// When the headers arrived; the body may finish much later.
    received_at: std::time::Instant,
}

#[cfg(feature = "browser")]
impl PendingResponse {
    fn into_raw(self, request_id: String, body: Option<BodyHandle>) -> RawResponse {
        RawResponse {
            request_id,
            url: self.url,
            status: self.status,
            resource_kind: self.resource_kind,
            mime_type: self.mime_type,
            observed_at: self.received_at,
            body,
        }
    }
}

#[cfg(feature = "browser")]
fn emit(sink: &Sink, response: RawResponse) {
    if let Ok(guard) = sink.lock() {
        if let Some(tx) = guard.as_ref() {
            // Receiver dropped between entities; nothing to deliver to.
            let _ = tx.send(response);
        }
    }
}

#[cfg(feature = "browser")]
fn resource_kind(kind: &ResourceType) -> ResourceKind {
    match kind {
        ResourceType::Document => ResourceKind::Document,
        ResourceType::Xhr => ResourceKind::Xhr,
        ResourceType::Fetch => ResourceKind::Fetch,
        ResourceType::Script => ResourceKind::Script,
        _ => ResourceKind::Other,
    }
}

/// Body retrieved on demand from the browser's network cache.
#[cfg(feature = "browser")]
struct CdpBody {
    page: Page,
    request_id: String,
}

#[cfg(feature = "browser")]
#[async_trait]
impl BodySource for CdpBody {
    async fn fetch(&self) -> Result<Vec<u8>> {
        let params = GetResponseBodyParams::new(RequestId::new(self.request_id.clone()));
        let returns = self.page.execute(params).await.map_err(|e| {
            match ScrapeError::from_browser_message(e.to_string()) {
                ScrapeError::Browser(msg) => ScrapeError::BodyUnavailable(msg),
                other => other,
            }
        })?;
        let body = &returns.result;
        if body.base64_encoded {
            base64::engine::general_purpose::STANDARD
                .decode(&body.body)
                .map_err(|e| ScrapeError::BodyUnavailable(format!("bad base64 body: {}", e)))
        } else {
            Ok(body.body.clone().into_bytes())
        }
    }
}

#[cfg(feature = "browser")]
#[derive(Deserialize)]
struct LocateResult {
    found: bool,
    index: usize,
    visible: bool,
    enabled: bool,
}

#[cfg(feature = "browser")]
#[async_trait]
impl PageDriver for ChromiumDriver {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<PageState> {
        let page = self.page()?.clone();

        info!("Navigating to {}", url);
        let nav_params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(|e| ScrapeError::Browser(format!("Invalid URL {}: {}", url, e)))?;

        let nav = tokio::time::timeout(timeout, page.execute(nav_params))
            .await
            .map_err(|_| ScrapeError::Timeout(format!("navigation to {}", url)))?
            .map_err(cdp_error)?;
        if let Some(error_text) = nav.result.error_text.as_ref() {
            return Err(ScrapeError::from_browser_message(format!("{}: {}", url, error_text)));
        }

        let dom_timeout = Duration::from_secs(self.config.dom_ready_timeout);
        match tokio::time::timeout(dom_timeout, page.evaluate(WAIT_FOR_READY_SCRIPT.to_string()))
            .await
        {
            Ok(Ok(result)) => {
                let state: String = result.into_value().unwrap_or_else(|_| "unknown".to_string());
                debug!("Page ready state: {}", state);
            }
            Ok(Err(e)) => debug!("Could not check ready state: {}", e),
            Err(_) => return Err(ScrapeError::Timeout(format!("DOM ready for {}", url))),
        }

        self.wait_for_network_idle().await;

        let final_url = page
            .url()
            .await
            .map_err(cdp_error)?
            .unwrap_or_else(|| url.to_string());
        let title = page.get_title().await.ok().flatten().unwrap_or_default();
        let login_page = self.config.is_login_url(&final_url);
        if login_page {
            warn!("Navigation to {} landed on login page {}", url, final_url);
        }

        Ok(PageState {
            url: final_url,
            title,
            login_page,
        })
    }

    async fn locate(&mut self, selector: &str) -> Result<Option<ElementRef>> {
        let page = self.page()?;
        let script = Selector::parse(selector).locate_script();
        let result: LocateResult = page
            .evaluate(script)
            .await
            .map_err(cdp_error)?
            .into_value()
            .map_err(|e| ScrapeError::Browser(format!("locate {}: {}", selector, e)))?;

        Ok(result.found.then(|| ElementRef {
            selector: selector.to_string(),
            index: result.index,
            visible: result.visible,
            enabled: result.enabled,
        }))
    }

    async fn click(&mut self, element: &ElementRef) -> Result<()> {
        let page = self.page()?;
        let selector = Selector::parse(&element.selector);
        let elements = page.find_elements(selector.css.as_str()).await.map_err(cdp_error)?;
        let target = elements
            .get(element.index)
            .ok_or_else(|| ScrapeError::NotFound(element.selector.clone()))?;
        target.scroll_into_view().await.map_err(cdp_error)?;
        target.click().await.map_err(cdp_error)?;
        debug!("Clicked {}", element.selector);
        Ok(())
    }

    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<RawResponse> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut guard) = self.sink.lock() {
            *guard = Some(tx);
        }
        rx
    }

    async fn current_url(&mut self) -> Result<String> {
        Ok(self
            .page()?
            .url()
            .await
            .map_err(cdp_error)?
            .unwrap_or_default())
    }

    async fn cookies(&mut self) -> Result<Vec<SessionCookie>> {
        let cookies = self.page()?.get_cookies().await.map_err(cdp_error)?;
        debug!("Got {} cookies from browser", cookies.len());
        Ok(cookies
            .into_iter()
            .map(|c| SessionCookie {
                name: c.name,
                value: c.value,
                domain: c.domain,
                path: c.path,
                expires: (!c.session && c.expires > 0.0).then_some(c.expires),
                secure: c.secure,
                http_only: c.http_only,
                same_site: c.same_site.map(|s| s.as_ref().to_string()),
            })
            .collect())
    }

    async fn set_cookies(&mut self, cookies: &[SessionCookie]) -> Result<()> {
        let mut params = Vec::with_capacity(cookies.len());
        for cookie in cookies.iter().filter(|c| c.is_usable()) {
            let mut builder = CookieParam::builder()
                .name(cookie.name.clone())
                .value(cookie.value.clone())
                .domain(cookie.domain.clone())
                .path(cookie.path.clone())
                .secure(cookie.secure)
                .http_only(cookie.http_only);
            if let Some(expires) = cookie.expires.filter(|e| *e > 0.0) {
                builder = builder.expires(TimeSinceEpoch::new(expires));
            }
            match builder.build() {
                Ok(param) => params.push(param),
                Err(e) => warn!("Failed to build cookie {}: {}", cookie.name, e),
            }
        }
        if params.is_empty() {
            return Ok(());
        }
        let count = params.len();
        self.page()?.set_cookies(params).await.map_err(cdp_error)?;
        debug!("Injected {} cookies", count);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Ok(mut guard) = self.sink.lock() {
            guard.take();
        }
        if let Some(task) = self.pump_task.take() {
            task.abort();
        }
        if let Some(page) = self.page.take() {
            let _ = page.close().await;
        }
        if let Some(mut browser) = self.browser.take() {
            if let Err(e) = browser.close().await {
                debug!("Browser close: {}", e);
            }
        }
        if let Some(task) = self.handler_task.take() {
            task.abort();
        }
        Ok(())
    }
}

#[cfg(feature = "browser")]
impl Drop for ChromiumDriver {
    fn drop(&mut self) {
        if let Some(task) = self.pump_task.take() {
            task.abort();
        }
        if let Some(task) = self.handler_task.take() {
            task.abort();
        }
    }
}

// Stub for when browser feature is disabled
#[cfg(not(feature = "browser"))]
pub struct ChromiumDriver {
    #[allow(dead_code)]
    config: BrowserEngineConfig,
}

#[cfg(not(feature = "browser"))]
fn not_compiled() -> ScrapeError {
    ScrapeError::Config(
        "Browser support not compiled. Rebuild with: cargo build --features browser".to_string(),
    )
}

#[cfg(not(feature = "browser"))]
impl ChromiumDriver {
    pub async fn launch(_config: BrowserEngineConfig) -> Result<Self> {
        Err(not_compiled())
    }
}

#[cfg(not(feature = "browser"))]
#[async_trait]
impl PageDriver for ChromiumDriver {
    async fn navigate(&mut self, _url: &str, _timeout: Duration) -> Result<PageState> {
        Err(not_compiled())
    }

    async fn locate(&mut self, _selector: &str) -> Result<Option<ElementRef>> {
        Err(not_compiled())
    }

    async fn click(&mut self, _element: &ElementRef) -> Result<()> {
        Err(not_compiled())
    }

    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<RawResponse> {
        mpsc::unbounded_channel().1
    }

    async fn current_url(&mut self) -> Result<String> {
        Err(not_compiled())
    }

    async fn cookies(&mut self) -> Result<Vec<SessionCookie>> {
        Err(not_compiled())
    }

    async fn set_cookies(&mut self, _cookies: &[SessionCookie]) -> Result<()> {
        Err(not_compiled())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
