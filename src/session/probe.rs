//! Liveness probe: cheap check of whether the browser session is logged in.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::browser::{default_login_fragments, PageDriver};
use crate::error::Result;

const PROBE_NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Probe result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The logged-in marker was found.
    Authenticated,
    /// Redirected to login, or an explicit logout control was seen.
    LoggedOut,
    /// Neither signal; treated as valid until a request proves otherwise.
    Ambiguous,
}

/// What the probe saw on the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeObservation {
    pub final_url: String,
    pub authenticated_marker: bool,
    pub logout_marker: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessProbe {
    /// Page visited by the probe.
    #[serde(default = "default_probe_url")]
    pub url: String,
    /// Element only present for logged-in users.
    #[serde(default = "default_authenticated_selector")]
    pub authenticated_selector: String,
    #[serde(default = "default_login_fragments")]
    pub login_url_fragments: Vec<String>,
    /// Element only present for logged-out users (e.g. a login button).
    #[serde(default)]
    pub logout_selector: Option<String>,
    /// How long to wait for the authenticated marker to render.
    #[serde(default = "default_marker_wait_ms")]
    pub marker_wait_ms: u64,
}

fn default_probe_url() -> String {
    "https://pgy.xiaohongshu.com/solar/pre-trade/home".to_string()
}

fn default_authenticated_selector() -> String {
    ".home_head_user_info".to_string()
}

fn default_marker_wait_ms() -> u64 {
    5_000
}

impl Default for LivenessProbe {
    fn default() -> Self {
        Self {
            url: default_probe_url(),
            authenticated_selector: default_authenticated_selector(),
            login_url_fragments: default_login_fragments(),
            logout_selector: None,
            marker_wait_ms: default_marker_wait_ms(),
        }
    }
}

impl LivenessProbe {
    pub fn is_login_url(&self, url: &str) -> bool {
        self.login_url_fragments
            .iter()
            .any(|fragment| !fragment.is_empty() && url.contains(fragment.as_str()))
    }

    /// Pure classification of an observation.
    pub fn evaluate(&self, observation: &ProbeObservation) -> Liveness {
        if observation.authenticated_marker {
            Liveness::Authenticated
        } else if observation.logout_marker || self.is_login_url(&observation.final_url) {
            Liveness::LoggedOut
        } else {
            Liveness::Ambiguous
        }
    }

    /// Navigate to the probe page and record the markers. Does not click or
    /// submit anything.
    pub async fn observe<D: PageDriver + ?Sized>(&self, driver: &mut D) -> Result<ProbeObservation> {
        let state = driver.navigate(&self.url, PROBE_NAVIGATION_TIMEOUT).await?;
        if state.login_page || self.is_login_url(&state.url) {
            return Ok(ProbeObservation {
                final_url: state.url,
                authenticated_marker: false,
                logout_marker: false,
            });
        }

        let authenticated_marker = driver
            .wait_for_selector(
                &self.authenticated_selector,
                Duration::from_millis(self.marker_wait_ms),
            )
            .await?
            .is_some();

        let logout_marker = match (&self.logout_selector, authenticated_marker) {
            (Some(selector), false) => matches!(driver.locate(selector).await?, Some(el) if el.visible),
            _ => false,
        };

        Ok(ProbeObservation {
            final_url: state.url,
            authenticated_marker,
            logout_marker,
        })
    }

    /// Observe and classify. Transient failures are ambiguous, not logged out.
    pub async fn check<D: PageDriver + ?Sized>(&self, driver: &mut D) -> Result<Liveness> {
        match self.observe(driver).await {
            Ok(observation) => {
                let liveness = self.evaluate(&observation);
                debug!("Liveness probe at {}: {:?}", observation.final_url, liveness);
                Ok(liveness)
            }
            Err(e) if e.is_transient() => {
                warn!("Liveness probe inconclusive: {}", e);
                Ok(Liveness::Ambiguous)
            }
            Err(e) => Err(e),
        }
    }
}
