//! Types exchanged between the page driver and its consumers.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::error::{Result, ScrapeError};

/// Network resource type as reported by the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Document,
    Xhr,
    Fetch,
    Script,
    Other,
}

impl ResourceKind {
    /// Background calls issued by page scripts (the only ones worth routing).
    pub fn is_api_call(&self) -> bool {
        matches!(self, ResourceKind::Xhr | ResourceKind::Fetch)
    }
}

/// Lazily fetched response body.
#[async_trait]
pub trait BodySource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<u8>>;
}

/// Cloneable handle to a response body source.
#[derive(Clone)]
pub struct BodyHandle(Arc<dyn BodySource>);

impl BodyHandle {
    pub fn new(source: impl BodySource + 'static) -> Self {
        Self(Arc::new(source))
    }

    /// A body that is already in memory.
    pub fn ready(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(ReadyBody(bytes.into()))
    }

    /// A body that can no longer be retrieved (page navigated away, evicted).
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::new(MissingBody(reason.into()))
    }

    pub async fn fetch(&self) -> Result<Vec<u8>> {
        self.0.fetch().await
    }
}

impl fmt::Debug for BodyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BodyHandle(..)")
    }
}

struct ReadyBody(Vec<u8>);

#[async_trait]
impl BodySource for ReadyBody {
    async fn fetch(&self) -> Result<Vec<u8>> {
        Ok(self.0.clone())
    }
}

struct MissingBody(String);

#[async_trait]
impl BodySource for MissingBody {
    async fn fetch(&self) -> Result<Vec<u8>> {
        Err(ScrapeError::BodyUnavailable(self.0.clone()))
    }
}

/// One response observed on the page, before any filtering.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub request_id: String,
    pub url: String,
    pub status: u16,
    pub resource_kind: ResourceKind,
    pub mime_type: String,
    /// When the driver saw the response finish.
    pub observed_at: Instant,
    /// None when the load failed before a body was produced.
    pub body: Option<BodyHandle>,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Where a navigation ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageState {
    pub url: String,
    pub title: String,
    /// The final URL looks like the site's login page.
    pub login_page: bool,
}

/// A located element; re-resolved by selector and index on click.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementRef {
    pub selector: String,
    pub index: usize,
    pub visible: bool,
    pub enabled: bool,
}

impl ElementRef {
    pub fn is_actionable(&self) -> bool {
        self.visible && self.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_body_handles() {
        let body = BodyHandle::ready(b"{}".to_vec());
        assert_eq!(body.fetch().await.unwrap(), b"{}".to_vec());

        let gone = BodyHandle::unavailable("navigated away");
        let err = gone.fetch().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_api_call_kinds() {
        assert!(ResourceKind::Xhr.is_api_call());
        assert!(ResourceKind::Fetch.is_api_call());
        assert!(!ResourceKind::Document.is_api_call());
        assert!(!ResourceKind::Script.is_api_call());
    }
}
