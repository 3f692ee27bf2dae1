//! Detail jobs: one page per work item.

use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::collect::{discard_pending, Collector, ExpectedEndpoints};
use super::job::Job;
use super::outcome::{ItemReport, RunSummary, WorkItem, WorkOutcome};
use super::work_source::WorkSource;
use super::{still_invalid, Orchestrator};
use crate::browser::PageDriver;
use crate::error::{Result, ScrapeError};
use crate::intercept::EntityContext;

/// How far one item got.
enum Processed {
    Done(ItemReport),
    /// Cancelled mid-item; nothing was written.
    Cancelled,
}

impl<D: PageDriver + ?Sized> Orchestrator<'_, D> {
    /// Work through `source` until it runs dry or the run is cancelled.
    ///
    /// Only fatal errors (session, browser gone) end the run early; any other
    /// failure is recorded against its item.
    pub async fn run_detail(
        &mut self,
        job: &Job,
        source: &mut dyn WorkSource,
    ) -> Result<RunSummary> {
        let started = Instant::now();
        let mut summary = RunSummary::default();
        let mut ctx = job.entity_context();
        let mut first = true;

        loop {
            if self.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let Some(item) = source.next().await? else {
                break;
            };
            if !first {
                self.limiter.jitter().await;
                if self.is_cancelled() {
                    source.release(&item).await?;
                    summary.cancelled = true;
                    break;
                }
            }
            first = false;

            info!(key = %item.external_key, attempt = item.attempts, "Processing {}", item.display_name());
            let report = match self.process_with_recovery(job, &mut ctx, &item, &mut summary).await {
                Ok(Processed::Done(report)) => report,
                Ok(Processed::Cancelled) => {
                    source.release(&item).await?;
                    summary.cancelled = true;
                    break;
                }
                Err(e) if e.is_fatal() => {
                    if let Err(release_error) = source.release(&item).await {
                        warn!(key = %item.external_key, "Could not release item: {}", release_error);
                    }
                    return Err(e);
                }
                Err(e) => ItemReport {
                    external_key: item.external_key.clone(),
                    outcome: WorkOutcome::Failed,
                    records_created: 0,
                    records_updated: 0,
                    failed_batches: 0,
                    attempts: item.attempts,
                    error: Some(e.to_string()),
                },
            };

            match report.outcome {
                WorkOutcome::Failed => error!(
                    key = %item.external_key,
                    attempt = item.attempts,
                    "Item failed: {}",
                    report.error.as_deref().unwrap_or("unknown error")
                ),
                outcome => info!(
                    key = %item.external_key,
                    created = report.records_created,
                    updated = report.records_updated,
                    "Item finished: {}",
                    outcome
                ),
            }
            source
                .report(&item, report.outcome, report.error.as_deref())
                .await?;
            summary.record(report);
        }

        summary.elapsed = started.elapsed();
        summary.rate_limit_wait = self.limiter.stats().total_wait;
        Ok(summary)
    }

    /// Process one item; on a session-invalid signal log in again and retry
    /// the item once.
    async fn process_with_recovery(
        &mut self,
        job: &Job,
        ctx: &mut EntityContext,
        item: &WorkItem,
        summary: &mut RunSummary,
    ) -> Result<Processed> {
        match self.process_item(job, ctx, item).await {
            Err(ScrapeError::SessionInvalid(reason)) => {
                self.recover_session(&reason, summary).await?;
                match self.process_item(job, ctx, item).await {
                    Err(ScrapeError::SessionInvalid(reason)) => Err(still_invalid(reason)),
                    other => other,
                }
            }
            other => other,
        }
    }

    async fn process_item(
        &mut self,
        job: &Job,
        ctx: &mut EntityContext,
        item: &WorkItem,
    ) -> Result<Processed> {
        ctx.begin(item);
        discard_pending(&mut self.responses);
        ctx.set_phase(job.config.load_phase.clone());

        let url = if item.target_url.is_empty() {
            job.target_url(&item.external_key)
        } else {
            item.target_url.clone()
        };
        self.open(&url).await?;

        let collector = Collector {
            router: job.router(),
            poll_interval: self.collect.poll_interval(),
            cancel: &self.cancel,
        };

        let load_signal = ExpectedEndpoints::new(job.config.load_expect.iter().cloned());
        let stats = collector
            .collect(&mut self.responses, ctx, &load_signal, self.collect.collect_timeout())
            .await;
        if stats.cancelled {
            return Ok(Processed::Cancelled);
        }

        for step in &job.config.steps {
            ctx.set_phase(step.phase.clone());
            let control = self
                .driver
                .wait_for_selector(&step.selector, Duration::from_millis(step.wait_ms))
                .await?;
            let control = match control {
                Some(control) if control.is_actionable() => control,
                _ if step.required => {
                    return Err(ScrapeError::NotFound(format!(
                        "control for step {} ({})",
                        step.name, step.selector
                    )));
                }
                _ => {
                    debug!(key = %item.external_key, "Skipping step {}: control not available", step.name);
                    continue;
                }
            };

            let signal = ExpectedEndpoints::since(ctx, step.expect.iter().cloned());
            self.limiter.acquire().await;
            if let Err(e) = self.driver.click(&control).await {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!(key = %item.external_key, "Step {} click failed: {}", step.name, e);
                continue;
            }
            let stats = collector
                .collect(&mut self.responses, ctx, &signal, self.collect.step_timeout(step))
                .await;
            if stats.cancelled {
                return Ok(Processed::Cancelled);
            }
            if !signal.is_empty() && !stats.completed {
                debug!(key = %item.external_key, "Step {} did not produce {:?}", step.name, step.expect);
            }
        }
        ctx.set_phase(None);

        let Some(harvest) = ctx.finish() else {
            return Ok(Processed::Done(no_data(item)));
        };
        if harvest.is_empty() {
            warn!(key = %item.external_key, "No data intercepted");
            return Ok(Processed::Done(no_data(item)));
        }
        if harvest.rejected > 0 {
            debug!(key = %item.external_key, "{} responses belonged to other entities", harvest.rejected);
        }

        let missing: Vec<&str> = job
            .config
            .expected_endpoints
            .iter()
            .map(String::as_str)
            .filter(|e| !harvest.fired_endpoints.contains(*e))
            .collect();
        let complete = missing.is_empty();
        if !complete {
            info!(key = %item.external_key, "Missing endpoints: {}", missing.join(", "));
        }

        let records = harvest.into_records();
        let batch = self.persist(&records, job.config.batch_size).await;
        let (outcome, error) = if batch.failed_batches > 0 {
            (
                WorkOutcome::Failed,
                Some(format!("{} records could not be persisted", batch.failed_records)),
            )
        } else if complete {
            (WorkOutcome::Succeeded, None)
        } else {
            (WorkOutcome::SucceededPartial, None)
        };
        Ok(Processed::Done(ItemReport {
            external_key: item.external_key.clone(),
            outcome,
            records_created: batch.created,
            records_updated: batch.updated,
            failed_batches: batch.failed_batches,
            attempts: item.attempts,
            error,
        }))
    }
}

fn no_data(item: &WorkItem) -> ItemReport {
    ItemReport {
        external_key: item.external_key.clone(),
        outcome: WorkOutcome::NoData,
        records_created: 0,
        records_updated: 0,
        failed_batches: 0,
        attempts: item.attempts,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{ClickEffect, ScriptedDriver, ScriptedPage, ScriptedResponse};
    use crate::intercept::{EndpointPattern, KeySource};
    use crate::orchestrator::{CollectConfig, JobConfig, JobKind, UiStep, VecWorkSource};
    use crate::rate_limit::{RateLimiter, RetryPolicy};
    use crate::repository::DbContext;
    use crate::session::{
        LivenessProbe, SessionConfig, SessionCookie, SessionManager, SessionStore,
    };
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::sync::watch;

    const HOME: &str = "https://site.test/home";
    const LOGIN: &str = "https://site.test/login";

    fn job() -> Job {
        let user_id = || KeySource::QueryParam {
            name: "userId".to_string(),
        };
        let config = JobConfig {
            kind: JobKind::Detail,
            url_template: "https://site.test/creator/{key}".to_string(),
            endpoints: vec![
                EndpointPattern::new("blogger", "/api/blogger/").keyed_by(KeySource::PathAfter {
                    segment: "/blogger/".to_string(),
                }),
                EndpointPattern::new("notes_rate", "/api/notes_rate").keyed_by(user_id()),
                EndpointPattern::new("data_summary", "/api/data_summary").keyed_by(user_id()),
            ],
            steps: vec![
                UiStep {
                    wait_ms: 100,
                    ..UiStep::new("dismiss", "button.dismiss")
                },
                UiStep::new("by-cost", "button.cost").expect("data_summary"),
                UiStep::new("coop", "button.coop").phase("coop").expect("notes_rate"),
            ],
            expected_endpoints: vec![
                "blogger".to_string(),
                "notes_rate".to_string(),
                "data_summary".to_string(),
            ],
            load_expect: vec!["blogger".to_string(), "notes_rate".to_string()],
            load_phase: Some("daily".to_string()),
            phased_endpoints: Some(vec!["notes_rate".to_string()]),
            next_selector: None,
            listing_key: None,
            no_data_is_failure: false,
            batch_size: 100,
        };
        Job::new("detail", config)
    }

    fn collect() -> CollectConfig {
        CollectConfig {
            nav_timeout_ms: 1_000,
            collect_timeout_ms: 2_000,
            step_timeout_ms: 1_000,
            poll_interval_ms: 50,
        }
    }

    fn blogger(key: &str, name: &str) -> ScriptedResponse {
        ScriptedResponse::json(
            format!("https://api.site.test/api/blogger/{}", key),
            &json!({"code": 0, "data": {"name": name, "picturePrice": 2000, "videoPrice": 4000}}),
        )
    }

    fn notes_rate(key: &str, exposure: i64) -> ScriptedResponse {
        ScriptedResponse::json(
            format!("https://api.site.test/api/notes_rate?userId={}&business=0", key),
            &json!({"code": 0, "data": {"impMedian": exposure, "readMedian": 100}}),
        )
    }

    fn data_summary(key: &str) -> ScriptedResponse {
        ScriptedResponse::json(
            format!("https://api.site.test/api/data_summary?userId={}", key),
            &json!({"code": 0, "data": {"responseRate": 0.9}}),
        )
    }

    /// A creator page where both UI steps are present and fire their calls.
    fn full_page(key: &str, name: &str) -> ScriptedPage {
        ScriptedPage::new()
            .respond(blogger(key, name))
            .respond(notes_rate(key, 1_000))
            .element("button.cost", true, true)
            .element("button.coop", true, true)
            .on_click("button.cost", ClickEffect::new(vec![data_summary(key)]))
            .on_click("button.coop", ClickEffect::new(vec![notes_rate(key, 500)]))
    }

    fn item(key: &str) -> WorkItem {
        WorkItem::adhoc(key, "")
    }

    struct Fixture {
        _dir: TempDir,
        db: DbContext,
        session: SessionManager,
    }

    async fn fixture(session: SessionConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = DbContext::new(&dir.path().join("harvest.db"));
        db.init_schema().await.unwrap();
        let session = SessionManager::new(SessionStore::new(dir.path().join("cookies.json")), session);
        Fixture {
            _dir: dir,
            db,
            session,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_item_merges_phases_and_rejects_foreign_responses() {
        let fx = fixture(SessionConfig::default()).await;
        let page = full_page("U1", "Alice").respond(notes_rate("U2", 9_999));
        let mut driver = ScriptedDriver::new().page("https://site.test/creator/U1", page);
        let (_cancel_tx, cancel) = watch::channel(false);
        let job = job();
        let mut source = VecWorkSource::new([item("U1")]);

        let summary = Orchestrator::new(&mut driver, &fx.session, fx.db.records(), cancel)
            .with_limiter(RateLimiter::unlimited())
            .with_retry(RetryPolicy::no_retry())
            .with_collect(collect())
            .run_detail(&job, &mut source)
            .await
            .unwrap();

        assert_eq!(summary.count(WorkOutcome::Succeeded), 1);
        assert_eq!(summary.records_created, 1);
        assert_eq!(source.reported()[0].1, WorkOutcome::Succeeded);
        assert_eq!(driver.clicks(), &["button.cost".to_string(), "button.coop".to_string()]);

        let stored = fx.db.records().get("U1", "profile").await.unwrap().unwrap();
        let fields = &stored.record.fields;
        assert_eq!(fields["nickname"], json!("Alice"));
        assert!(!fields.contains_key("daily_nickname"));
        assert_eq!(fields["daily_exposure_median"], json!(1_000));
        assert_eq!(fields["coop_exposure_median"], json!(500));
        assert_eq!(fields["reply_rate_48h"], json!(0.9));
        assert!(fields.contains_key("daily_cpm"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_and_empty_items_do_not_stop_the_run() {
        let fx = fixture(SessionConfig::default()).await;
        let partial = ScriptedPage::new()
            .respond(blogger("U1", "Alice"))
            .respond(notes_rate("U1", 1_000));
        let mut driver = ScriptedDriver::new()
            .page("https://site.test/creator/U1", partial)
            .page("https://site.test/creator/U2", ScriptedPage::new())
            .page("https://site.test/creator/U3", full_page("U3", "Carol"));
        let (_cancel_tx, cancel) = watch::channel(false);
        let job = job();
        let mut source = VecWorkSource::new([item("U1"), item("U2"), item("U3")]);

        let summary = Orchestrator::new(&mut driver, &fx.session, fx.db.records(), cancel)
            .with_limiter(RateLimiter::unlimited())
            .with_collect(collect())
            .run_detail(&job, &mut source)
            .await
            .unwrap();

        let outcomes: Vec<WorkOutcome> = source.reported().iter().map(|r| r.1).collect();
        assert_eq!(
            outcomes,
            vec![
                WorkOutcome::SucceededPartial,
                WorkOutcome::NoData,
                WorkOutcome::Succeeded
            ]
        );
        assert_eq!(summary.records_created, 2);
        assert!(fx.db.records().get("U2", "profile").await.unwrap().is_none());
        // Nothing from U1's page leaks into U3.
        let carol = fx.db.records().get("U3", "profile").await.unwrap().unwrap();
        assert_eq!(carol.record.fields["nickname"], json!("Carol"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_required_control_fails_only_that_item() {
        let fx = fixture(SessionConfig::default()).await;
        let mut job = job();
        job.config.steps[1].required = true;
        let without_cost = ScriptedPage::new()
            .respond(blogger("U1", "Alice"))
            .respond(notes_rate("U1", 1_000));
        let mut driver = ScriptedDriver::new()
            .page("https://site.test/creator/U1", without_cost)
            .page("https://site.test/creator/U2", full_page("U2", "Bob"));
        let (_cancel_tx, cancel) = watch::channel(false);
        let mut source = VecWorkSource::new([item("U1"), item("U2")]);

        let summary = Orchestrator::new(&mut driver, &fx.session, fx.db.records(), cancel)
            .with_limiter(RateLimiter::unlimited())
            .with_collect(collect())
            .run_detail(&job, &mut source)
            .await
            .unwrap();

        let (failed, outcome, error) = &source.reported()[0];
        assert_eq!(failed.external_key, "U1");
        assert_eq!(*outcome, WorkOutcome::Failed);
        assert!(error.as_deref().unwrap().contains("by-cost"));
        assert_eq!(source.reported()[1].1, WorkOutcome::Succeeded);
        assert_eq!(summary.count(WorkOutcome::Failed), 1);
        assert!(fx.db.records().get("U1", "profile").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_redirect_reauthenticates_and_retries_item() {
        let fx = fixture(SessionConfig {
            login_url: LOGIN.to_string(),
            login_timeout: 30,
            login_poll: 1,
            probe: LivenessProbe {
                url: HOME.to_string(),
                authenticated_selector: ".user".to_string(),
                login_url_fragments: vec!["/login".to_string()],
                logout_selector: None,
                marker_wait_ms: 10,
            },
        })
        .await;
        let mut driver = ScriptedDriver::new()
            .requires_cookie(SessionCookie::new("web_session", "valid", ".site.test"), LOGIN)
            .login_after_polls(2, HOME)
            .page(HOME, ScriptedPage::new().element(".user", true, true))
            .page("https://site.test/creator/U1", full_page("U1", "Alice"));
        let (_cancel_tx, cancel) = watch::channel(false);
        let job = job();
        let mut source = VecWorkSource::new([item("U1")]);

        let summary = Orchestrator::new(&mut driver, &fx.session, fx.db.records(), cancel)
            .with_limiter(RateLimiter::unlimited())
            .with_collect(collect())
            .run_detail(&job, &mut source)
            .await
            .unwrap();

        assert_eq!(summary.reauthentications, 1);
        assert_eq!(summary.count(WorkOutcome::Succeeded), 1);
        assert!(driver.navigations().iter().any(|url| url == LOGIN));
        assert!(fx.session.store().load().is_some());
    }

    #[tokio::test]
    async fn test_cancel_before_start_leaves_items_queued() {
        let fx = fixture(SessionConfig::default()).await;
        let mut driver = ScriptedDriver::new();
        let (cancel_tx, cancel) = watch::channel(false);
        cancel_tx.send(true).unwrap();
        let job = job();
        let mut source = VecWorkSource::new([item("U1"), item("U2")]);

        let summary = Orchestrator::new(&mut driver, &fx.session, fx.db.records(), cancel)
            .with_limiter(RateLimiter::unlimited())
            .run_detail(&job, &mut source)
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert!(summary.items.is_empty());
        assert_eq!(source.remaining(), 2);
        assert!(driver.navigations().is_empty());
    }
}
