//! Listing jobs: one page, walked with its next-page control.
//!
//! Records are persisted page by page so a crash mid-listing keeps what was
//! already seen. Paging stops on the first of: no usable next control, the
//! page cap, or a run of pages that brought nothing new.

use std::time::Instant;

use tracing::{info, warn};

use super::collect::{discard_pending, Collector, ExpectedEndpoints};
use super::job::Job;
use super::outcome::{ItemReport, RunSummary, WorkItem, WorkOutcome};
use super::{still_invalid, Orchestrator};
use crate::browser::PageDriver;
use crate::error::{Result, ScrapeError};
use crate::pagination::{PaginationController, SeenSet, StopReason};
use crate::repository::BatchReport;

impl<D: PageDriver + ?Sized> Orchestrator<'_, D> {
    pub async fn run_listing(&mut self, job: &Job) -> Result<RunSummary> {
        let started = Instant::now();
        let next_selector = job.config.next_selector.clone().ok_or_else(|| {
            ScrapeError::Config(format!("job {} has no next_selector", job.name))
        })?;
        let key = job.listing_key().to_string();
        let mut summary = RunSummary::default();

        let mut seen = SeenSet::new();
        info!(key = %key, "Starting listing {}", job.name);
        let mut pager = PaginationController::new(self.pagination.clone());
        let mut ctx = job.entity_context();
        let item = WorkItem::adhoc(key.clone(), job.target_url(&key));
        ctx.begin(&item);
        discard_pending(&mut self.responses);

        match self.open(&item.target_url).await {
            Err(ScrapeError::SessionInvalid(reason)) => {
                self.recover_session(&reason, &mut summary).await?;
                ctx.begin(&item);
                discard_pending(&mut self.responses);
                match self.open(&item.target_url).await {
                    Err(ScrapeError::SessionInvalid(reason)) => return Err(still_invalid(reason)),
                    other => other?,
                };
            }
            other => {
                other?;
            }
        }
        pager.start();

        let collector = Collector {
            router: job.router(),
            poll_interval: self.collect.poll_interval(),
            cancel: &self.cancel,
        };
        let mut written = BatchReport::default();
        // The first page's responses may already be in the channel.
        let mut signal = ExpectedEndpoints::new(job.config.expected_endpoints.iter().cloned());

        loop {
            let stats = collector
                .collect(&mut self.responses, &mut ctx, &signal, self.collect.collect_timeout())
                .await;
            if stats.cancelled {
                pager.stop(StopReason::Cancelled);
                summary.cancelled = true;
                break;
            }

            let records = ctx.drain_records();
            let candidates: Vec<String> = records.iter().map(|r| r.natural_key.clone()).collect();
            seen.absorb_stored(&self.store, &key, &candidates).await?;
            let new_keys = seen.count_new(records.iter().map(|r| r.natural_key.as_str()));
            let duplicates = records.len() - new_keys;
            let batch = self.persist(&records, job.config.batch_size).await;
            if batch.failed_batches == 0 {
                seen.observe(records.into_iter().map(|r| r.natural_key));
            }
            written.merge(&batch);

            if pager.record_page(new_keys, duplicates).is_some() {
                break;
            }
            if self.is_cancelled() {
                pager.stop(StopReason::Cancelled);
                summary.cancelled = true;
                break;
            }

            self.limiter.jitter().await;
            self.limiter.acquire().await;
            signal = ExpectedEndpoints::since(&ctx, job.config.expected_endpoints.iter().cloned());
            if pager.advance(&mut *self.driver, &next_selector).await?.is_some() {
                break;
            }
        }

        // Profile fields a listing endpoint may have produced.
        if let Some(harvest) = ctx.finish() {
            let leftovers = harvest.into_records();
            if !leftovers.is_empty() {
                let batch = self.persist(&leftovers, job.config.batch_size).await;
                written.merge(&batch);
            }
        }

        let report = pager.report();
        let outcome = if written.failed_batches > 0 {
            WorkOutcome::Failed
        } else if written.written() == 0 && report.total_new == 0 {
            WorkOutcome::NoData
        } else {
            WorkOutcome::Succeeded
        };
        info!(
            key = %key,
            pages = report.pages,
            new = report.total_new,
            "Listing {} finished: {}",
            job.name,
            outcome
        );
        if written.failed_batches > 0 {
            warn!(key = %key, "{} records were not persisted", written.failed_records);
        }

        summary.pages = report.pages;
        summary.stop_reason = report.stop_reason;
        summary.record(ItemReport {
            external_key: key,
            outcome,
            records_created: written.created,
            records_updated: written.updated,
            failed_batches: written.failed_batches,
            attempts: 1,
            error: (written.failed_batches > 0)
                .then(|| format!("{} records could not be persisted", written.failed_records)),
        });
        summary.elapsed = started.elapsed();
        summary.rate_limit_wait = self.limiter.stats().total_wait;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{ClickEffect, ScriptedDriver, ScriptedPage, ScriptedResponse};
    use crate::intercept::{EndpointPattern, KeySource};
    use crate::orchestrator::{CollectConfig, JobConfig, JobKind};
    use crate::pagination::PaginationPolicy;
    use crate::rate_limit::RateLimiter;
    use crate::repository::DbContext;
    use crate::session::{SessionConfig, SessionManager, SessionStore};
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::sync::watch;

    const LIST_URL: &str = "https://site.test/messages";
    const NEXT: &str = "li.next";

    fn job() -> Job {
        let config = JobConfig {
            kind: JobKind::Listing,
            url_template: LIST_URL.to_string(),
            endpoints: vec![EndpointPattern::new("message_list", "/message/list")
                .keyed_by(KeySource::None)],
            steps: Vec::new(),
            expected_endpoints: vec!["message_list".to_string()],
            load_expect: Vec::new(),
            load_phase: None,
            phased_endpoints: None,
            next_selector: Some(NEXT.to_string()),
            listing_key: Some("inbox".to_string()),
            no_data_is_failure: false,
            batch_size: 2,
        };
        Job::new("messages", config)
    }

    fn messages(page: usize, ids: &[u32]) -> ScriptedResponse {
        let list: Vec<_> = ids
            .iter()
            .map(|id| json!({"id": id, "title": format!("message {}", id)}))
            .collect();
        ScriptedResponse::json(
            format!("https://api.site.test/api/message/list?page={}", page),
            &json!({"code": 0, "data": {"messageList": list}}),
        )
    }

    /// First page 1..3, then a page of new ids, then the same ids forever.
    fn driver() -> ScriptedDriver {
        let mut page = ScriptedPage::new()
            .respond(messages(1, &[1, 2, 3]))
            .element(NEXT, true, true)
            .on_click(NEXT, ClickEffect::new(vec![messages(2, &[4, 5])]));
        for n in 3..=8 {
            page = page.on_click(NEXT, ClickEffect::new(vec![messages(n, &[4, 5])]));
        }
        ScriptedDriver::new().page(LIST_URL, page)
    }

    fn collect() -> CollectConfig {
        CollectConfig {
            nav_timeout_ms: 1_000,
            collect_timeout_ms: 2_000,
            step_timeout_ms: 1_000,
            poll_interval_ms: 50,
        }
    }

    struct Fixture {
        dir: TempDir,
        db: DbContext,
    }

    impl Fixture {
        async fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let db = DbContext::new(&dir.path().join("harvest.db"));
            db.init_schema().await.unwrap();
            Self { dir, db }
        }

        fn session(&self) -> SessionManager {
            SessionManager::new(
                SessionStore::new(self.dir.path().join("cookies.json")),
                SessionConfig::default(),
            )
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_listing_stops_after_consecutive_duplicate_pages() {
        let fx = Fixture::new().await;
        let session = fx.session();
        let mut driver = driver();
        let (_cancel_tx, cancel) = watch::channel(false);

        let summary = Orchestrator::new(&mut driver, &session, fx.db.records(), cancel)
            .with_limiter(RateLimiter::unlimited())
            .with_collect(collect())
            .run_listing(&job())
            .await
            .unwrap();

        assert_eq!(summary.stop_reason, Some(StopReason::ConsecutiveDuplicates));
        // 2 pages with new ids, then 3 duplicate pages.
        assert_eq!(summary.pages, 5);
        assert_eq!(summary.records_created, 5);
        assert_eq!(summary.count(WorkOutcome::Succeeded), 1);
        assert_eq!(driver.clicks().len(), 4);
        assert_eq!(fx.db.records().count(Some("message")).await.unwrap(), 5);
        assert!(fx.db.records().exists("inbox", "message:4").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rerun_uses_stored_keys_to_stop_early() {
        let fx = Fixture::new().await;
        let session = fx.session();
        let (_cancel_tx, cancel) = watch::channel(false);
        let job = job();

        let mut first = driver();
        Orchestrator::new(&mut first, &session, fx.db.records(), cancel.clone())
            .with_limiter(RateLimiter::unlimited())
            .with_collect(collect())
            .run_listing(&job)
            .await
            .unwrap();

        let mut second = driver();
        let summary = Orchestrator::new(&mut second, &session, fx.db.records(), cancel)
            .with_limiter(RateLimiter::unlimited())
            .with_collect(collect())
            .run_listing(&job)
            .await
            .unwrap();

        // Every page is already known, so three pages are enough.
        assert_eq!(summary.pages, 3);
        assert_eq!(summary.records_created, 0);
        assert_eq!(summary.records_updated, 7);
        assert_eq!(summary.stop_reason, Some(StopReason::ConsecutiveDuplicates));
    }

    async fn seed(store: &crate::repository::RecordStore, ids: &[u32]) {
        for id in ids {
            store
                .upsert(&crate::extract::ExtractedRecord {
                    kind: "message".to_string(),
                    external_key: "inbox".to_string(),
                    natural_key: format!("message:{}", id),
                    fields: Default::default(),
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stored_keys_count_as_duplicates() {
        let fx = Fixture::new().await;
        let session = fx.session();
        seed(&fx.db.records(), &[1, 2, 3]).await;
        let mut driver = driver();
        let (_cancel_tx, cancel) = watch::channel(false);

        let summary = Orchestrator::new(&mut driver, &session, fx.db.records(), cancel)
            .with_limiter(RateLimiter::unlimited())
            .with_collect(collect())
            .run_listing(&job())
            .await
            .unwrap();

        // Page 1 is all stored, page 2 is new, pages 3-5 repeat page 2.
        assert_eq!(summary.pages, 5);
        assert_eq!(summary.records_created, 2);
        assert_eq!(summary.records_updated, 9);
        assert_eq!(summary.stop_reason, Some(StopReason::ConsecutiveDuplicates));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_burst_counts_stored_keys() {
        let fx = Fixture::new().await;
        let session = fx.session();
        seed(&fx.db.records(), &[1, 2, 3]).await;
        let mut driver = driver();
        let (_cancel_tx, cancel) = watch::channel(false);
        let policy = PaginationPolicy {
            duplicate_burst_stop: Some(3),
            ..PaginationPolicy::default()
        };

        let summary = Orchestrator::new(&mut driver, &session, fx.db.records(), cancel)
            .with_limiter(RateLimiter::unlimited())
            .with_collect(collect())
            .with_pagination(policy)
            .run_listing(&job())
            .await
            .unwrap();

        assert_eq!(summary.stop_reason, Some(StopReason::DuplicateBurst));
        assert_eq!(summary.pages, 1);
        assert_eq!(summary.records_created, 0);
        assert_eq!(summary.records_updated, 3);
        assert!(driver.clicks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_next_control_ends_listing() {
        let fx = Fixture::new().await;
        let session = fx.session();
        let page = ScriptedPage::new().respond(messages(1, &[7]));
        let mut driver = ScriptedDriver::new().page(LIST_URL, page);
        let (_cancel_tx, cancel) = watch::channel(false);

        let summary = Orchestrator::new(&mut driver, &session, fx.db.records(), cancel)
            .with_limiter(RateLimiter::unlimited())
            .with_collect(collect())
            .run_listing(&job())
            .await
            .unwrap();

        assert_eq!(summary.stop_reason, Some(StopReason::NoNextControl));
        assert_eq!(summary.pages, 1);
        assert_eq!(summary.records_created, 1);
        assert!(driver.clicks().is_empty());
    }

    #[tokio::test]
    async fn test_listing_requires_next_selector() {
        let fx = Fixture::new().await;
        let session = fx.session();
        let mut driver = ScriptedDriver::new();
        let (_cancel_tx, cancel) = watch::channel(false);
        let mut job = job();
        job.config.next_selector = None;

        let err = Orchestrator::new(&mut driver, &session, fx.db.records(), cancel)
            .run_listing(&job)
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::Config(_)));
    }
}
