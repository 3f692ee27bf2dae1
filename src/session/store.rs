//! Cookie file persistence.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::probe::{Liveness, LivenessProbe};
use super::state::SessionState;
use crate::browser::PageDriver;
use crate::error::Result;

/// Loads and saves the session cookie file.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the saved state.
    ///
    /// Returns None when the file is missing, unreadable, empty, or corrupt.
    /// A corrupt file is deleted so the next login starts clean.
    pub fn load(&self) -> Option<SessionState> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No session file at {:?}", self.path);
                return None;
            }
            Err(e) => {
                warn!("Could not read session file {:?}: {}", self.path, e);
                return None;
            }
        };

        match serde_json::from_str::<SessionState>(&content) {
            Ok(state) if state.is_empty() => {
                debug!("Session file {:?} holds no cookies", self.path);
                None
            }
            Ok(state) => {
                debug!("Loaded {} cookies from {:?}", state.cookies.len(), self.path);
                Some(state)
            }
            Err(e) => {
                warn!("Session file {:?} is corrupt ({}); deleting it", self.path, e);
                if let Err(e) = std::fs::remove_file(&self.path) {
                    warn!("Failed to delete corrupt session file: {}", e);
                }
                None
            }
        }
    }

    /// Write the state atomically (temp file in the same directory, then rename).
    pub fn save(&self, state: &SessionState) -> Result<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)?;

        let json = serde_json::to_string_pretty(state)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
        tmp.write_all(json.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        info!("Saved {} cookies to {:?}", state.cookies.len(), self.path);
        Ok(())
    }

    /// Remove the saved state, if any.
    pub fn discard(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!("Discarded session file {:?}", self.path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Apply `state` to the browser and run the liveness probe.
    ///
    /// Ambiguous probes count as valid; only a concrete logged-out signal
    /// returns false.
    pub async fn validate<D: PageDriver + ?Sized>(
        &self,
        driver: &mut D,
        state: &SessionState,
        probe: &LivenessProbe,
    ) -> Result<bool> {
        let liveness = self.probe_state(driver, state, probe).await?;
        Ok(liveness != Liveness::LoggedOut)
    }

    /// Like `validate`, keeping the probe's verdict.
    ///
    /// A cookie the browser refuses is logged and skipped; the probe decides.
    pub async fn probe_state<D: PageDriver + ?Sized>(
        &self,
        driver: &mut D,
        state: &SessionState,
        probe: &LivenessProbe,
    ) -> Result<Liveness> {
        let cookies = state.usable_cookies();
        let skipped = state.cookies.len() - cookies.len();
        if skipped > 0 {
            warn!("Skipping {} unusable or expired cookies", skipped);
        }
        if let Err(e) = driver.set_cookies(&cookies).await {
            if e.is_fatal() {
                return Err(e);
            }
            warn!("Failed to apply saved cookies: {}", e);
        }
        probe.check(driver).await
    }
}
