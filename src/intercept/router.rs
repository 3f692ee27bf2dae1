//! Matches raw responses against endpoint patterns and dispatches them.

use std::fmt;

use tracing::{debug, warn};

use super::context::EntityContext;
use super::types::{EndpointPattern, InterceptedResponse};
use crate::browser::RawResponse;
use crate::extract;

/// Handler invoked for an accepted response.
pub type Handler = Box<dyn Fn(&mut EntityContext, &InterceptedResponse) + Send + Sync>;

/// Why a matched response was not dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    Status(u16),
    LoadFailed,
    BodyUnavailable,
    NotJson,
    NotObject,
    /// Envelope `code` other than 0.
    Envelope(i64),
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Status(status) => write!(f, "HTTP {}", status),
            DropReason::LoadFailed => f.write_str("load failed"),
            DropReason::BodyUnavailable => f.write_str("body unavailable"),
            DropReason::NotJson => f.write_str("body is not JSON"),
            DropReason::NotObject => f.write_str("body is not a JSON object"),
            DropReason::Envelope(code) => write!(f, "envelope code {}", code),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Not an API call, or no pattern matched.
    Ignored,
    Dropped(DropReason),
    /// Matched, but belongs to another entity (or was already processed).
    Rejected,
    /// Number of handlers run.
    Dispatched(usize),
}

struct Route {
    pattern: EndpointPattern,
    handlers: Vec<Handler>,
}

#[derive(Default)]
pub struct ResponseRouter {
    routes: Vec<Route>,
}

impl ResponseRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Router where each pattern runs its endpoint's extractor and stores
    /// the output in the entity context.
    pub fn with_extractors(patterns: impl IntoIterator<Item = EndpointPattern>) -> Self {
        let mut router = Self::new();
        for pattern in patterns {
            if !extract::has_extractor(&pattern.id) {
                warn!(
                    endpoint = %pattern.id,
                    "No built-in extractor; responses will only count as fired"
                );
            }
            router.register(pattern, |ctx, response| {
                let extraction = extract::extract(&response.endpoint, &response.payload);
                if extraction.is_empty() {
                    debug!(endpoint = %response.endpoint, "Extraction produced nothing");
                    return;
                }
                if !extraction.fields.is_empty() {
                    ctx.merge_endpoint_fields(&response.endpoint, extraction.fields);
                }
                if !extraction.records.is_empty() {
                    ctx.push_records(extraction.records);
                }
            });
        }
        router
    }

    /// Add a handler for `pattern`. Handlers registered for a pattern with an
    /// existing id are appended to that route.
    pub fn register<F>(&mut self, pattern: EndpointPattern, handler: F)
    where
        F: Fn(&mut EntityContext, &InterceptedResponse) + Send + Sync + 'static,
    {
        match self.routes.iter_mut().find(|r| r.pattern.id == pattern.id) {
            Some(route) => route.handlers.push(Box::new(handler)),
            None => self.routes.push(Route {
                pattern,
                handlers: vec![Box::new(handler)],
            }),
        }
    }

    pub fn patterns(&self) -> impl Iterator<Item = &EndpointPattern> {
        self.routes.iter().map(|r| &r.pattern)
    }

    /// Route one response into `ctx`.
    ///
    /// The body is only fetched once a pattern matched. Fetch failures and
    /// bad envelopes mean "no data" for that endpoint, never an error.
    pub async fn route(&self, raw: RawResponse, ctx: &mut EntityContext) -> RouteOutcome {
        if !raw.resource_kind.is_api_call() {
            return RouteOutcome::Ignored;
        }
        let matched: Vec<&Route> = self
            .routes
            .iter()
            .filter(|r| r.pattern.matches(&raw.url))
            .collect();
        if matched.is_empty() {
            return RouteOutcome::Ignored;
        }

        if !raw.is_success() {
            warn!(url = %raw.url, "Dropping response with status {}", raw.status);
            return RouteOutcome::Dropped(DropReason::Status(raw.status));
        }

        let Some(body) = raw.body.as_ref() else {
            debug!(url = %raw.url, "Response failed to load");
            return RouteOutcome::Dropped(DropReason::LoadFailed);
        };
        let bytes = match body.fetch().await {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(url = %raw.url, "Response body unavailable: {}", e);
                return RouteOutcome::Dropped(DropReason::BodyUnavailable);
            }
        };

        let payload: serde_json::Value = match serde_json::from_slice(&bytes) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(url = %raw.url, "Response is not JSON: {}", e);
                return RouteOutcome::Dropped(DropReason::NotJson);
            }
        };
        if !payload.is_object() {
            warn!(url = %raw.url, "Response is not a JSON object");
            return RouteOutcome::Dropped(DropReason::NotObject);
        }
        if let Some(code) = payload.get("code") {
            let code = envelope_code(code);
            if code != 0 {
                warn!(
                    url = %raw.url,
                    "API returned code {}: {}",
                    code,
                    payload.get("msg").and_then(|m| m.as_str()).unwrap_or_default()
                );
                return RouteOutcome::Dropped(DropReason::Envelope(code));
            }
        }

        let responses: Vec<(&Route, InterceptedResponse)> = matched
            .into_iter()
            .map(|route| {
                let response = InterceptedResponse {
                    endpoint: route.pattern.id.clone(),
                    url: raw.url.clone(),
                    status: raw.status,
                    request_id: raw.request_id.clone(),
                    correlated_key: route.pattern.derive_key(&raw.url, &payload),
                    payload: payload.clone(),
                    arrived_at: raw.observed_at,
                };
                (route, response)
            })
            .collect();

        let admitted: Vec<&(&Route, InterceptedResponse)> =
            responses.iter().filter(|(_, r)| ctx.admits(r)).collect();
        let Some((_, first)) = admitted.first().copied().or_else(|| responses.first()) else {
            return RouteOutcome::Ignored;
        };
        // Records the request id once, or counts and logs the rejection.
        if !ctx.accept(first) {
            return RouteOutcome::Rejected;
        }

        let mut dispatched = 0;
        for (route, response) in admitted {
            for handler in &route.handlers {
                handler(ctx, response);
                dispatched += 1;
            }
            ctx.mark_fired(&route.pattern.id);
            debug!(
                key = ctx.current_key().unwrap_or_default(),
                endpoint = %route.pattern.id,
                "Dispatched {}",
                response.url
            );
        }
        RouteOutcome::Dispatched(dispatched)
    }
}

/// Envelope codes arrive as numbers or numeric strings; anything else is
/// an error code.
fn envelope_code(code: &serde_json::Value) -> i64 {
    code.as_i64()
        .or_else(|| code.as_str().and_then(|s| s.trim().parse().ok()))
        .unwrap_or(-1)
}
