//! Error taxonomy for scrape sessions.
//!
//! Errors are classified so the retry policy and the orchestrator can decide
//! what to do without string matching: transient failures are retried, fatal
//! ones end the run, everything else fails only the current work item.

use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T, E = ScrapeError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Connection reset: {0}")]
    ConnectionReset(String),
    #[error("Response body unavailable: {0}")]
    BodyUnavailable(String),
    #[error("Session is not authenticated (landed on {0})")]
    SessionInvalid(String),
    #[error("Interactive login did not complete within {0}s")]
    LoginTimeout(u64),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },
    #[error("Browser error: {0}")]
    Browser(String),
    #[error("Browser process is gone: {0}")]
    BrowserClosed(String),
    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ScrapeError {
    /// Infrastructure hiccups worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ScrapeError::Timeout(_)
                | ScrapeError::ConnectionReset(_)
                | ScrapeError::BodyUnavailable(_)
        )
    }

    /// Errors that end the whole run rather than a single work item.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ScrapeError::SessionInvalid(_)
                | ScrapeError::LoginTimeout(_)
                | ScrapeError::BrowserClosed(_)
        )
    }

    /// Classify a free-form browser error message.
    ///
    /// CDP errors arrive as strings; timeouts and dropped sockets are the
    /// only ones we can safely retry.
    pub fn from_browser_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("timeout") || lower.contains("timed out") {
            ScrapeError::Timeout(message)
        } else if lower.contains("connection reset")
            || lower.contains("err_connection")
            || lower.contains("err_network_changed")
            || lower.contains("err_empty_response")
        {
            ScrapeError::ConnectionReset(message)
        } else if lower.contains("channelsendfailed")
            || lower.contains("browser closed")
            || lower.contains("websocket")
        {
            ScrapeError::BrowserClosed(message)
        } else {
            ScrapeError::Browser(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ScrapeError::Timeout("nav".into()).is_transient());
        assert!(ScrapeError::BodyUnavailable("x".into()).is_transient());
        assert!(!ScrapeError::NotFound("x".into()).is_transient());
        assert!(!ScrapeError::Http {
            status: 404,
            url: "https://example.com".into()
        }
        .is_transient());
        assert!(ScrapeError::SessionInvalid("/login".into()).is_fatal());
        assert!(!ScrapeError::Timeout("x".into()).is_fatal());
    }

    #[test]
    fn test_from_browser_message() {
        assert!(matches!(
            ScrapeError::from_browser_message("Request timed out."),
            ScrapeError::Timeout(_)
        ));
        assert!(matches!(
            ScrapeError::from_browser_message("net::ERR_CONNECTION_RESET"),
            ScrapeError::ConnectionReset(_)
        ));
        assert!(matches!(
            ScrapeError::from_browser_message("No node found for selector"),
            ScrapeError::Browser(_)
        ));
    }
}
