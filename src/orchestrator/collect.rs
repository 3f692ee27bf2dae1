//! Bounded response collection.
//!
//! Responses are drained from the driver's channel and routed until the
//! completion signal fires or the window closes, whichever is first.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::browser::RawResponse;
use crate::intercept::{EntityContext, ResponseRouter, RouteOutcome};

/// Decides when enough responses have arrived.
pub trait CompletionSignal: Send + Sync {
    fn is_complete(&self, ctx: &EntityContext) -> bool;
}

impl<F> CompletionSignal for F
where
    F: Fn(&EntityContext) -> bool + Send + Sync,
{
    fn is_complete(&self, ctx: &EntityContext) -> bool {
        self(ctx)
    }
}

/// Complete once every endpoint fired at least once more than it had when
/// the signal was created.
#[derive(Debug, Clone, Default)]
pub struct ExpectedEndpoints {
    baseline: BTreeMap<String, usize>,
}

impl ExpectedEndpoints {
    pub fn new<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            baseline: endpoints.into_iter().map(|e| (e.into(), 0)).collect(),
        }
    }

    /// Like `new`, counting only dispatches after this point.
    pub fn since<I, S>(ctx: &EntityContext, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            baseline: endpoints
                .into_iter()
                .map(|e| {
                    let e = e.into();
                    let seen = ctx.fire_count(&e);
                    (e, seen)
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.baseline.is_empty()
    }
}

impl CompletionSignal for ExpectedEndpoints {
    fn is_complete(&self, ctx: &EntityContext) -> bool {
        !self.baseline.is_empty()
            && self
                .baseline
                .iter()
                .all(|(endpoint, seen)| ctx.fire_count(endpoint) > *seen)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectStats {
    pub dispatched: usize,
    pub rejected: usize,
    pub dropped: usize,
    pub completed: bool,
    pub cancelled: bool,
    /// The driver dropped its end of the channel.
    pub disconnected: bool,
}

/// Responses and timing for one collection window.
pub struct Collector<'a> {
    pub router: &'a ResponseRouter,
    pub poll_interval: Duration,
    pub cancel: &'a watch::Receiver<bool>,
}

impl Collector<'_> {
    pub async fn collect(
        &self,
        responses: &mut mpsc::UnboundedReceiver<RawResponse>,
        ctx: &mut EntityContext,
        signal: &dyn CompletionSignal,
        window: Duration,
    ) -> CollectStats {
        let mut stats = CollectStats::default();
        let deadline = tokio::time::Instant::now() + window;
        loop {
            loop {
                match responses.try_recv() {
                    Ok(raw) => match self.router.route(raw, ctx).await {
                        RouteOutcome::Dispatched(_) => stats.dispatched += 1,
                        RouteOutcome::Rejected => stats.rejected += 1,
                        RouteOutcome::Dropped(_) => stats.dropped += 1,
                        RouteOutcome::Ignored => {}
                    },
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        stats.disconnected = true;
                        break;
                    }
                }
            }

            if signal.is_complete(ctx) {
                stats.completed = true;
                break;
            }
            if *self.cancel.borrow() {
                stats.cancelled = true;
                break;
            }
            if stats.disconnected || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        debug!(
            key = ctx.current_key().unwrap_or_default(),
            dispatched = stats.dispatched,
            rejected = stats.rejected,
            dropped = stats.dropped,
            completed = stats.completed,
            "Collection window closed"
        );
        stats
    }
}

/// Throw away responses left over from a previous page.
pub fn discard_pending(responses: &mut mpsc::UnboundedReceiver<RawResponse>) -> usize {
    let mut discarded = 0;
    while responses.try_recv().is_ok() {
        discarded += 1;
    }
    if discarded > 0 {
        debug!("Discarded {} stale responses", discarded);
    }
    discarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{BodyHandle, ResourceKind};
    use crate::intercept::EndpointPattern;
    use serde_json::json;
    use std::time::Instant;

    fn raw(id: &str, url: &str) -> RawResponse {
        RawResponse {
            request_id: id.to_string(),
            url: url.to_string(),
            status: 200,
            resource_kind: ResourceKind::Fetch,
            mime_type: "application/json".to_string(),
            observed_at: Instant::now(),
            body: Some(BodyHandle::ready(
                json!({"code": 0, "data": {"fans_count": 10}}).to_string(),
            )),
        }
    }

    #[test]
    fn test_expected_endpoints_since_baseline() {
        let mut ctx = EntityContext::new();
        ctx.begin_key("U1");
        ctx.mark_fired("notes_rate");

        assert!(ExpectedEndpoints::new(["notes_rate"]).is_complete(&ctx));
        let again = ExpectedEndpoints::since(&ctx, ["notes_rate"]);
        assert!(!again.is_complete(&ctx));
        ctx.mark_fired("notes_rate");
        assert!(again.is_complete(&ctx));
        assert!(!ExpectedEndpoints::default().is_complete(&ctx));
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_stops_early_on_completion() {
        let router = ResponseRouter::with_extractors(vec![EndpointPattern::new(
            "fans_summary",
            "fans_summary",
        )]);
        let (_cancel_tx, cancel) = watch::channel(false);
        let collector = Collector {
            router: &router,
            poll_interval: Duration::from_millis(100),
            cancel: &cancel,
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut ctx = EntityContext::new();
        ctx.begin_key("U1");

        tx.send(raw("r1", "https://x.test/fans_summary")).unwrap();
        let start = tokio::time::Instant::now();
        let stats = collector
            .collect(
                &mut rx,
                &mut ctx,
                &ExpectedEndpoints::new(["fans_summary"]),
                Duration::from_secs(30),
            )
            .await;
        assert!(stats.completed);
        assert_eq!(stats.dispatched, 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_times_out_and_honours_cancel() {
        let router = ResponseRouter::new();
        let (cancel_tx, cancel) = watch::channel(false);
        let collector = Collector {
            router: &router,
            poll_interval: Duration::from_millis(100),
            cancel: &cancel,
        };
        let (_tx, mut rx) = mpsc::unbounded_channel::<RawResponse>();
        let mut ctx = EntityContext::new();
        ctx.begin_key("U1");
        let never = |_: &EntityContext| false;

        let start = tokio::time::Instant::now();
        let stats = collector
            .collect(&mut rx, &mut ctx, &never, Duration::from_secs(2))
            .await;
        assert!(!stats.completed);
        assert!(start.elapsed() >= Duration::from_secs(2));

        cancel_tx.send(true).unwrap();
        let stats = collector
            .collect(&mut rx, &mut ctx, &never, Duration::from_secs(2))
            .await;
        assert!(stats.cancelled);
    }
}
