//! In-memory page driver that replays a fixed script.
//!
//! Pages are keyed by URL. Each page declares its elements, the responses its
//! load produces, and what clicking an element does. Used by the test suites
//! and by `--dry-run` style wiring checks; no browser is involved.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::types::{BodyHandle, ElementRef, PageState, RawResponse, ResourceKind};
use super::PageDriver;
use crate::error::{Result, ScrapeError};
use crate::session::SessionCookie;

type Sink = Arc<Mutex<Option<mpsc::UnboundedSender<RawResponse>>>>;

/// One response the script produces.
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub url: String,
    pub status: u16,
    pub kind: ResourceKind,
    /// None makes the body fetch fail.
    pub body: Option<Vec<u8>>,
    /// The load failed outright; no body handle is attached.
    pub load_failed: bool,
    pub delay: Duration,
}

impl ScriptedResponse {
    /// A 200 XHR response carrying `payload`.
    pub fn json(url: impl Into<String>, payload: &serde_json::Value) -> Self {
        Self {
            url: url.into(),
            status: 200,
            kind: ResourceKind::Xhr,
            body: Some(payload.to_string().into_bytes()),
            load_failed: false,
            delay: Duration::ZERO,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_kind(mut self, kind: ResourceKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn without_body(mut self) -> Self {
        self.body = None;
        self
    }

    pub fn failed(mut self) -> Self {
        self.load_failed = true;
        self
    }

    /// Deliver the response this long after the triggering action.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ElementState {
    visible: bool,
    enabled: bool,
}

/// What one click on an element does.
#[derive(Debug, Clone, Default)]
pub struct ClickEffect {
    pub responses: Vec<ScriptedResponse>,
    /// Element changes applied after the click; None removes the element.
    updates: Vec<(String, Option<ElementState>)>,
}

impl ClickEffect {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            responses,
            updates: Vec::new(),
        }
    }

    pub fn set_element(mut self, selector: impl Into<String>, visible: bool, enabled: bool) -> Self {
        self.updates
            .push((selector.into(), Some(ElementState { visible, enabled })));
        self
    }

    pub fn remove_element(mut self, selector: impl Into<String>) -> Self {
        self.updates.push((selector.into(), None));
        self
    }
}

/// Scripted page template; copied into the live page on navigation.
#[derive(Debug, Clone, Default)]
pub struct ScriptedPage {
    title: String,
    redirect_to: Option<String>,
    elements: HashMap<String, ElementState>,
    on_load: Vec<ScriptedResponse>,
    on_click: HashMap<String, VecDeque<ClickEffect>>,
}

impl ScriptedPage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Navigation to this page ends on `url` instead.
    pub fn redirect(mut self, url: impl Into<String>) -> Self {
        self.redirect_to = Some(url.into());
        self
    }

    pub fn element(mut self, selector: impl Into<String>, visible: bool, enabled: bool) -> Self {
        self.elements
            .insert(selector.into(), ElementState { visible, enabled });
        self
    }

    pub fn respond(mut self, response: ScriptedResponse) -> Self {
        self.on_load.push(response);
        self
    }

    /// Queue an effect for the next click on `selector`. Effects are consumed
    /// in order; once exhausted, clicks do nothing.
    pub fn on_click(mut self, selector: impl Into<String>, effect: ClickEffect) -> Self {
        self.on_click.entry(selector.into()).or_default().push_back(effect);
        self
    }
}

struct AuthGate {
    cookie: SessionCookie,
    login_url: String,
    /// Locate calls on the login page before the simulated user finishes.
    login_after_polls: Option<(usize, String)>,
    polls: usize,
}

/// Driver that replays `ScriptedPage`s.
pub struct ScriptedDriver {
    pages: HashMap<String, ScriptedPage>,
    live: Option<(String, ScriptedPage)>,
    sink: Sink,
    cookies: Vec<SessionCookie>,
    auth: Option<AuthGate>,
    navigation_failures: usize,
    next_request: u64,
    navigations: Vec<String>,
    clicks: Vec<String>,
    closed: bool,
}

impl Default for ScriptedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self {
            pages: HashMap::new(),
            live: None,
            sink: Arc::new(Mutex::new(None)),
            cookies: Vec::new(),
            auth: None,
            navigation_failures: 0,
            next_request: 0,
            navigations: Vec::new(),
            clicks: Vec::new(),
            closed: false,
        }
    }

    pub fn page(mut self, url: impl Into<String>, page: ScriptedPage) -> Self {
        self.pages.insert(url.into(), page);
        self
    }

    /// Every navigation lands on `login_url` unless `cookie` has been set.
    pub fn requires_cookie(mut self, cookie: SessionCookie, login_url: impl Into<String>) -> Self {
        self.auth = Some(AuthGate {
            cookie,
            login_url: login_url.into(),
            login_after_polls: None,
            polls: 0,
        });
        self
    }

    /// Simulate a user completing the login form after `polls` element
    /// lookups on the login page, after which the page moves to `landing_url`.
    pub fn login_after_polls(mut self, polls: usize, landing_url: impl Into<String>) -> Self {
        if let Some(auth) = self.auth.as_mut() {
            auth.login_after_polls = Some((polls, landing_url.into()));
        }
        self
    }

    /// The next `count` navigations fail with a timeout.
    pub fn fail_navigations(mut self, count: usize) -> Self {
        self.navigation_failures = count;
        self
    }

    pub fn navigations(&self) -> &[String] {
        &self.navigations
    }

    pub fn clicks(&self) -> &[String] {
        &self.clicks
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn authenticated(&self) -> bool {
        match &self.auth {
            None => true,
            Some(auth) => self
                .cookies
                .iter()
                .any(|c| c.name == auth.cookie.name && c.value == auth.cookie.value),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(super::closed())
        } else {
            Ok(())
        }
    }

    fn load(&mut self, url: &str) {
        let page = self.pages.get(url).cloned().unwrap_or_default();
        let responses = page.on_load.clone();
        self.live = Some((url.to_string(), page));
        self.emit_all(responses);
    }

    fn emit_all(&mut self, responses: Vec<ScriptedResponse>) {
        for response in responses {
            self.next_request += 1;
            let request_id = format!("req-{}", self.next_request);
            let sink = self.sink.clone();
            if response.delay.is_zero() {
                deliver(&sink, request_id, response);
            } else {
                tokio::spawn(async move {
                    tokio::time::sleep(response.delay).await;
                    deliver(&sink, request_id, response);
                });
            }
        }
    }

    /// Complete the simulated login when enough polls have happened.
    fn poll_login(&mut self) {
        let on_login_page = matches!(
            (&self.live, &self.auth),
            (Some((url, _)), Some(auth)) if *url == auth.login_url
        );
        if !on_login_page {
            return;
        }
        let Some(auth) = self.auth.as_mut() else {
            return;
        };
        auth.polls += 1;
        let landing = match &auth.login_after_polls {
            Some((polls, landing)) if auth.polls >= *polls => landing.clone(),
            _ => return,
        };
        let cookie = auth.cookie.clone();
        self.cookies.retain(|c| c.name != cookie.name);
        self.cookies.push(cookie);
        self.load(&landing);
    }
}

fn deliver(sink: &Sink, request_id: String, response: ScriptedResponse) {
    let body = if response.load_failed {
        None
    } else {
        Some(match response.body {
            Some(bytes) => BodyHandle::ready(bytes),
            None => BodyHandle::unavailable(format!("no body for {}", response.url)),
        })
    };
    let raw = RawResponse {
        request_id,
        url: response.url,
        status: response.status,
        resource_kind: response.kind,
        mime_type: "application/json".to_string(),
        observed_at: Instant::now(),
        body,
    };
    if let Ok(guard) = sink.lock() {
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(raw);
        }
    }
}

#[async_trait]
impl PageDriver for ScriptedDriver {
    async fn navigate(&mut self, url: &str, _timeout: Duration) -> Result<PageState> {
        self.ensure_open()?;
        self.navigations.push(url.to_string());
        if self.navigation_failures > 0 {
            self.navigation_failures -= 1;
            return Err(ScrapeError::Timeout(format!("navigation to {}", url)));
        }

        let mut target = url.to_string();
        if let Some(redirect) = self.pages.get(url).and_then(|p| p.redirect_to.clone()) {
            target = redirect;
        }
        let mut login_page = false;
        if let Some(auth) = &self.auth {
            if target == auth.login_url {
                login_page = true;
            } else if !self.authenticated() {
                target = auth.login_url.clone();
                login_page = true;
            }
        }

        self.load(&target);
        let title = self
            .live
            .as_ref()
            .map(|(_, page)| page.title.clone())
            .unwrap_or_default();
        Ok(PageState {
            url: target,
            title,
            login_page,
        })
    }

    async fn locate(&mut self, selector: &str) -> Result<Option<ElementRef>> {
        self.ensure_open()?;
        self.poll_login();
        Ok(self.live.as_ref().and_then(|(_, page)| {
            page.elements.get(selector).map(|state| ElementRef {
                selector: selector.to_string(),
                index: 0,
                visible: state.visible,
                enabled: state.enabled,
            })
        }))
    }

    async fn click(&mut self, element: &ElementRef) -> Result<()> {
        self.ensure_open()?;
        let Some((_, page)) = self.live.as_mut() else {
            return Err(ScrapeError::NotFound(element.selector.clone()));
        };
        if !page.elements.contains_key(&element.selector) {
            return Err(ScrapeError::NotFound(element.selector.clone()));
        }
        self.clicks.push(element.selector.clone());

        let effect = page
            .on_click
            .get_mut(&element.selector)
            .and_then(|queue| queue.pop_front());
        if let Some(effect) = effect {
            for (selector, state) in effect.updates {
                match state {
                    Some(state) => {
                        page.elements.insert(selector, state);
                    }
                    None => {
                        page.elements.remove(&selector);
                    }
                }
            }
            self.emit_all(effect.responses);
        }
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
        self.ensure_open()?;
        Ok(self
            .live
            .as_ref()
            .map(|(url, _)| url.clone())
            .unwrap_or_else(|| "about:blank".to_string()))
    }

    async fn cookies(&mut self) -> Result<Vec<SessionCookie>> {
        self.ensure_open()?;
        Ok(self.cookies.clone())
    }

    async fn set_cookies(&mut self, cookies: &[SessionCookie]) -> Result<()> {
        self.ensure_open()?;
        for cookie in cookies.iter().filter(|c| c.is_usable()) {
            self.cookies.retain(|c| c.name != cookie.name || c.domain != cookie.domain);
            self.cookies.push(cookie.clone());
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        if let Ok(mut guard) = self.sink.lock() {
            guard.take();
        }
        Ok(())
    }
}
