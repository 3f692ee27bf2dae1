//! Session lifecycle: reuse saved cookies, fall back to interactive login.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::probe::{Liveness, LivenessProbe};
use super::state::SessionState;
use super::store::SessionStore;
use crate::browser::PageDriver;
use crate::error::{Result, ScrapeError};

/// Session settings from the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Where the user logs in.
    #[serde(default = "default_login_url")]
    pub login_url: String,
    /// Upper bound on waiting for a human to finish logging in, in seconds.
    #[serde(default = "default_login_timeout")]
    pub login_timeout: u64,
    /// Marker poll interval during interactive login, in seconds.
    #[serde(default = "default_login_poll")]
    pub login_poll: u64,
    #[serde(default)]
    pub probe: LivenessProbe,
}

fn default_login_url() -> String {
    "https://pgy.xiaohongshu.com".to_string()
}

fn default_login_timeout() -> u64 {
    300
}

fn default_login_poll() -> u64 {
    2
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            login_url: default_login_url(),
            login_timeout: default_login_timeout(),
            login_poll: default_login_poll(),
            probe: LivenessProbe::default(),
        }
    }
}

pub struct SessionManager {
    store: SessionStore,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(store: SessionStore, config: SessionConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn probe(&self) -> &LivenessProbe {
        &self.config.probe
    }

    /// Make sure the browser is logged in before any work starts.
    ///
    /// Saved cookies are reused when the probe does not report a concrete
    /// logout. Otherwise the file is discarded and the user is asked to log
    /// in, which is fatal if it does not finish within `login_timeout`.
    pub async fn ensure_session<D: PageDriver + ?Sized>(&self, driver: &mut D) -> Result<Liveness> {
        if let Some(state) = self.store.load() {
            let liveness = self
                .store
                .probe_state(driver, &state, &self.config.probe)
                .await?;
            if liveness != Liveness::LoggedOut {
                info!("Reusing saved session ({:?})", liveness);
                return Ok(liveness);
            }
            warn!("Saved session is no longer valid");
            if let Err(e) = self.store.discard() {
                warn!("Failed to discard stale session file: {}", e);
            }
        }

        self.interactive_login(driver).await?;
        Ok(Liveness::Authenticated)
    }

    /// Log in again after a concrete session-invalid signal.
    ///
    /// Failure here ends the run.
    pub async fn reauthenticate<D: PageDriver + ?Sized>(&self, driver: &mut D) -> Result<()> {
        warn!("Session rejected mid-run; re-authenticating");
        if let Err(e) = self.store.discard() {
            warn!("Failed to discard stale session file: {}", e);
        }
        match self.interactive_login(driver).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => Err(ScrapeError::SessionInvalid(format!("re-authentication failed: {}", e))),
        }
    }

    /// Open the login page and wait for the logged-in marker, then save the
    /// new cookies. Saving is best effort.
    async fn interactive_login<D: PageDriver + ?Sized>(&self, driver: &mut D) -> Result<()> {
        let timeout = Duration::from_secs(self.config.login_timeout);
        let poll = Duration::from_secs(self.config.login_poll.max(1));
        driver.navigate(&self.config.login_url, timeout).await?;

        info!(
            "Waiting up to {}s for login to complete in the browser window",
            self.config.login_timeout
        );
        let selector = self.config.probe.authenticated_selector.as_str();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match driver.locate(selector).await {
                Ok(Some(el)) if el.visible => break,
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("Login marker check failed: {}", e),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ScrapeError::LoginTimeout(self.config.login_timeout));
            }
            tokio::time::sleep(poll).await;
        }
        info!("Login detected");

        let cookies = driver.cookies().await?;
        if let Err(e) = self.store.save(&SessionState::new(cookies)) {
            warn!("Could not persist session: {}", e);
        }
        Ok(())
    }
}
