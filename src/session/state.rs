//! Persisted authentication state.

use serde::{Deserialize, Serialize};

/// Cookie captured from (or injected into) the browser session.
///
/// Field names follow the browser-export format (`httpOnly`, `sameSite`) so
/// cookie files exported by other tools load unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCookie {
    #[serde(alias = "key")]
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_path")]
    pub path: String,
    /// Seconds since the epoch; None or negative means a session cookie.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<f64>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
}

fn default_path() -> String {
    "/".to_string()
}

impl SessionCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: default_path(),
            expires: None,
            secure: false,
            http_only: false,
            same_site: None,
        }
    }

    /// Cookies without a name or domain cannot be injected.
    pub fn is_usable(&self) -> bool {
        !self.name.is_empty() && !self.domain.is_empty()
    }

    pub fn is_expired_at(&self, epoch_secs: f64) -> bool {
        matches!(self.expires, Some(exp) if exp > 0.0 && exp < epoch_secs)
    }
}

/// Opaque cookie set for one target site.
///
/// Serialized as a bare JSON array so the file stays compatible with
/// browser cookie exports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionState {
    pub cookies: Vec<SessionCookie>,
}

impl SessionState {
    pub fn new(cookies: Vec<SessionCookie>) -> Self {
        Self { cookies }
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Cookies that can be applied, dropping unusable and expired entries.
    pub fn usable_cookies(&self) -> Vec<SessionCookie> {
        let now = chrono::Utc::now().timestamp() as f64;
        self.cookies
            .iter()
            .filter(|c| c.is_usable() && !c.is_expired_at(now))
            .cloned()
            .collect()
    }
}
