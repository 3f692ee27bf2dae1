//! Job orchestration: work items in, one entity at a time, outcomes out.
//!
//! The orchestrator owns the response channel and the record store for the
//! duration of a run. Everything on the page happens sequentially; the only
//! concurrency is the browser delivering responses into the channel while
//! the orchestrator waits.

mod collect;
mod detail;
mod job;
mod listing;
mod outcome;
mod work_source;

pub use collect::{discard_pending, CollectStats, Collector, CompletionSignal, ExpectedEndpoints};
pub use job::{
    default_jobs, CollectConfig, Job, JobConfig, JobKind, UiStep, KEY_PLACEHOLDER, PGY_DETAIL_JOB,
    PGY_MESSAGES_JOB,
};
pub use outcome::{ItemReport, RunSummary, WorkItem, WorkOutcome};
pub use work_source::{DbWorkSource, VecWorkSource, WorkSource};

use tokio::sync::{mpsc, watch};
use tracing::{error, warn};

use crate::browser::{PageDriver, PageState, RawResponse};
use crate::error::{Result, ScrapeError};
use crate::extract::ExtractedRecord;
use crate::pagination::PaginationPolicy;
use crate::rate_limit::{RateLimitConfig, RateLimiter, RetryPolicy};
use crate::repository::{BatchReport, RecordStore};
use crate::session::{Liveness, SessionManager};

pub struct Orchestrator<'a, D: PageDriver + ?Sized> {
    driver: &'a mut D,
    session: &'a SessionManager,
    store: RecordStore,
    limiter: RateLimiter,
    retry: RetryPolicy,
    collect: CollectConfig,
    pagination: PaginationPolicy,
    cancel: watch::Receiver<bool>,
    responses: mpsc::UnboundedReceiver<RawResponse>,
}

impl<'a, D: PageDriver + ?Sized> Orchestrator<'a, D> {
    /// Takes over the driver's response feed.
    pub fn new(
        driver: &'a mut D,
        session: &'a SessionManager,
        store: RecordStore,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let responses = driver.subscribe();
        let rate_limit = RateLimitConfig::default();
        Self {
            driver,
            session,
            store,
            limiter: RateLimiter::from_config(&rate_limit),
            retry: rate_limit.retry,
            collect: CollectConfig::default(),
            pagination: PaginationPolicy::default(),
            cancel,
            responses,
        }
    }

    pub fn with_rate_limit(mut self, config: &RateLimitConfig) -> Self {
        self.limiter = RateLimiter::from_config(config);
        self.retry = config.retry.clone();
        self
    }

    pub fn with_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_collect(mut self, collect: CollectConfig) -> Self {
        self.collect = collect;
        self
    }

    pub fn with_pagination(mut self, policy: PaginationPolicy) -> Self {
        self.pagination = policy;
        self
    }

    /// Reuse the saved session or wait for an interactive login.
    pub async fn ensure_session(&mut self) -> Result<Liveness> {
        self.session.ensure_session(&mut *self.driver).await
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Navigate with pacing and transient retries. Landing on the login page
    /// is reported as `SessionInvalid`, never retried.
    async fn open(&mut self, url: &str) -> Result<PageState> {
        let timeout = self.collect.nav_timeout();
        let mut attempt = 1;
        loop {
            self.limiter.acquire().await;
            let error = match self.driver.navigate(url, timeout).await {
                Ok(state) if state.login_page => {
                    return Err(ScrapeError::SessionInvalid(state.url));
                }
                Ok(state) => return Ok(state),
                Err(e) => e,
            };
            let Some(delay) = self.retry.retry_delay(&error, attempt) else {
                return Err(error);
            };
            warn!(url, attempt, "Navigation failed, retrying in {:?}: {}", delay, error);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Log in again after a session-invalid signal. Failure ends the run.
    async fn recover_session(&mut self, reason: &str, summary: &mut RunSummary) -> Result<()> {
        warn!("Session invalid ({}); logging in again", reason);
        self.session.reauthenticate(&mut *self.driver).await?;
        summary.reauthentications += 1;
        Ok(())
    }

    /// Write records in batches. Failures are logged and counted, never raised.
    async fn persist(&self, records: &[ExtractedRecord], batch_size: usize) -> BatchReport {
        if records.is_empty() {
            return BatchReport::default();
        }
        match self.store.upsert_batch(records, batch_size).await {
            Ok(report) => {
                if report.failed_batches > 0 {
                    error!(
                        failed_batches = report.failed_batches,
                        "{} records were not persisted", report.failed_records
                    );
                }
                report
            }
            Err(e) => {
                error!("Could not open the database: {}", e);
                BatchReport {
                    failed_batches: 1,
                    failed_records: records.len(),
                    ..BatchReport::default()
                }
            }
        }
    }
}

/// Error for a second session-invalid signal right after logging in again.
fn still_invalid(reason: String) -> ScrapeError {
    ScrapeError::SessionInvalid(format!("still not authenticated after logging in again: {}", reason))
}
