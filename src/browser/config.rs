//! Browser engine configuration types.

use serde::{Deserialize, Serialize};

/// Browser engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserEngineConfig {
    /// Run in headless mode (default: false).
    /// Interactive login needs a visible window, so headless is opt-in.
    #[serde(default)]
    pub headless: bool,

    /// Apply stealth patches (default: true).
    #[serde(default = "default_stealth")]
    pub stealth: bool,

    /// Proxy server URL (e.g., "socks5://127.0.0.1:1080").
    #[serde(default)]
    pub proxy: Option<String>,

    /// Short DOM-ready wait after navigation, in seconds.
    #[serde(default = "default_dom_ready_timeout")]
    pub dom_ready_timeout: u64,

    /// Separate, non-fatal network-idle wait, in milliseconds.
    #[serde(default = "default_network_idle_timeout_ms")]
    pub network_idle_timeout_ms: u64,

    /// Quiet period that counts as network idle, in milliseconds.
    #[serde(default = "default_idle_quiet_ms")]
    pub idle_quiet_ms: u64,

    /// Viewport width and height.
    #[serde(default = "default_viewport")]
    pub viewport: (u32, u32),

    /// User agent override.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// URL fragments that identify the site's login page.
    #[serde(default = "default_login_fragments")]
    pub login_url_fragments: Vec<String>,

    /// Additional Chrome arguments.
    #[serde(default)]
    pub chrome_args: Vec<String>,

    /// Remote Chrome DevTools URL (e.g., "ws://localhost:9222").
    /// If set, connects to existing browser instead of launching one.
    #[serde(default)]
    pub remote_url: Option<String>,
}

impl Default for BrowserEngineConfig {
    fn default() -> Self {
        Self {
            headless: false,
            stealth: default_stealth(),
            proxy: None,
            dom_ready_timeout: default_dom_ready_timeout(),
            network_idle_timeout_ms: default_network_idle_timeout_ms(),
            idle_quiet_ms: default_idle_quiet_ms(),
            viewport: default_viewport(),
            user_agent: default_user_agent(),
            login_url_fragments: default_login_fragments(),
            chrome_args: Vec::new(),
            remote_url: None,
        }
    }
}

impl BrowserEngineConfig {
    pub fn is_login_url(&self, url: &str) -> bool {
        self.login_url_fragments
            .iter()
            .any(|fragment| !fragment.is_empty() && url.contains(fragment.as_str()))
    }
}

fn default_stealth() -> bool {
    true
}

fn default_dom_ready_timeout() -> u64 {
    20
}

fn default_network_idle_timeout_ms() -> u64 {
    5_000
}

fn default_idle_quiet_ms() -> u64 {
    500
}

fn default_viewport() -> (u32, u32) {
    (1012, 768)
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36".to_string()
}

pub fn default_login_fragments() -> Vec<String> {
    vec!["/login".to_string(), "passport".to_string()]
}
