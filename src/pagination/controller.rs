//! "Next page" state machine.
//!
//! The listing has no end marker, so paging stops on whichever comes first:
//! the next control is gone or disabled, the page cap is hit, or several
//! pages in a row added nothing new.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::browser::PageDriver;
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PaginationPolicy {
    pub max_pages: usize,
    /// Stop after this many consecutive pages with zero unseen keys.
    pub max_consecutive_duplicate_pages: usize,
    /// Stop as soon as a single page holds at least this many already-seen
    /// keys. Off by default.
    pub duplicate_burst_stop: Option<usize>,
    /// Pause before the single retry of a missing or failed next control.
    pub retry_pause_ms: u64,
}

impl Default for PaginationPolicy {
    fn default() -> Self {
        Self {
            max_pages: 50,
            max_consecutive_duplicate_pages: 3,
            duplicate_burst_stop: None,
            retry_pause_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    NoNextControl,
    ControlDisabled,
    PageCap,
    ConsecutiveDuplicates,
    DuplicateBurst,
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StopReason::NoNextControl => "no next-page control",
            StopReason::ControlDisabled => "next-page control disabled",
            StopReason::PageCap => "page cap reached",
            StopReason::ConsecutiveDuplicates => "consecutive pages without new records",
            StopReason::DuplicateBurst => "too many duplicates on one page",
            StopReason::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagerState {
    Idle,
    Paging { page: usize },
    Stopped(StopReason),
}

/// What one finished listing run looked like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaginationReport {
    pub pages: usize,
    pub total_new: usize,
    pub stop_reason: Option<StopReason>,
}

#[derive(Debug, Clone)]
pub struct PaginationController {
    policy: PaginationPolicy,
    state: PagerState,
    pages: usize,
    consecutive_duplicates: usize,
    total_new: usize,
}

impl PaginationController {
    pub fn new(policy: PaginationPolicy) -> Self {
        Self {
            policy,
            state: PagerState::Idle,
            pages: 0,
            consecutive_duplicates: 0,
            total_new: 0,
        }
    }

    pub fn policy(&self) -> &PaginationPolicy {
        &self.policy
    }

    pub fn state(&self) -> PagerState {
        self.state
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self.state, PagerState::Stopped(_))
    }

    /// Idle -> Paging on the first page.
    pub fn start(&mut self) {
        if self.state == PagerState::Idle {
            self.state = PagerState::Paging { page: 1 };
        }
    }

    /// Account for the page just loaded. `duplicates` is how many of its
    /// keys were already known. Returns the stop reason if paging ends here.
    pub fn record_page(&mut self, new_keys: usize, duplicates: usize) -> Option<StopReason> {
        if let PagerState::Stopped(reason) = self.state {
            return Some(reason);
        }
        self.start();
        self.pages += 1;
        self.total_new += new_keys;
        if new_keys == 0 {
            self.consecutive_duplicates += 1;
        } else {
            self.consecutive_duplicates = 0;
        }
        debug!(
            page = self.pages,
            new_keys, duplicates, consecutive = self.consecutive_duplicates, "Page recorded"
        );

        let reason = match self.policy.duplicate_burst_stop {
            Some(limit) if duplicates >= limit => Some(StopReason::DuplicateBurst),
            _ if self.consecutive_duplicates >= self.policy.max_consecutive_duplicate_pages.max(1) => {
                Some(StopReason::ConsecutiveDuplicates)
            }
            _ if self.pages >= self.policy.max_pages.max(1) => Some(StopReason::PageCap),
            _ => None,
        };
        match reason {
            Some(reason) => self.stop(reason),
            None => self.state = PagerState::Paging { page: self.pages + 1 },
        }
        reason
    }

    pub fn stop(&mut self, reason: StopReason) {
        if !self.is_stopped() {
            info!(pages = self.pages, new = self.total_new, "Pagination stopped: {}", reason);
            self.state = PagerState::Stopped(reason);
        }
    }

    /// Click the next-page control. The control is looked up (and clicked)
    /// a second time after a short pause before giving up on it.
    /// Returns `Some(reason)` when paging ends instead.
    pub async fn advance<D: PageDriver + ?Sized>(
        &mut self,
        driver: &mut D,
        next_selector: &str,
    ) -> Result<Option<StopReason>> {
        if let PagerState::Stopped(reason) = self.state {
            return Ok(Some(reason));
        }
        let pause = Duration::from_millis(self.policy.retry_pause_ms);

        for attempt in 1..=2 {
            if attempt > 1 {
                tokio::time::sleep(pause).await;
            }
            let control = match driver.locate(next_selector).await {
                Ok(control) => control,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    debug!(attempt, "Locating next control failed: {}", e);
                    None
                }
            };
            let Some(control) = control.filter(|c| c.visible) else {
                continue;
            };
            if !control.enabled {
                self.stop(StopReason::ControlDisabled);
                return Ok(Some(StopReason::ControlDisabled));
            }
            match driver.click(&control).await {
                Ok(()) => return Ok(None),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(attempt, "Clicking next control failed: {}", e),
            }
        }

        self.stop(StopReason::NoNextControl);
        Ok(Some(StopReason::NoNextControl))
    }

    pub fn report(&self) -> PaginationReport {
        PaginationReport {
            pages: self.pages,
            total_new: self.total_new,
            stop_reason: match self.state {
                PagerState::Stopped(reason) => Some(reason),
                _ => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{ClickEffect, ScriptedDriver, ScriptedPage};

    #[test]
    fn test_three_empty_pages_after_fresh_one_stop() {
        let mut pager = PaginationController::new(PaginationPolicy::default());
        assert_eq!(pager.state(), PagerState::Idle);
        assert_eq!(pager.record_page(10, 0), None);
        assert_eq!(pager.record_page(0, 10), None);
        assert_eq!(pager.record_page(0, 10), None);
        assert_eq!(
            pager.record_page(0, 10),
            Some(StopReason::ConsecutiveDuplicates)
        );
        let report = pager.report();
        assert_eq!(report.pages, 4);
        assert_eq!(report.total_new, 10);
    }

    #[test]
    fn test_mixed_page_resets_counter() {
        let mut pager = PaginationController::new(PaginationPolicy::default());
        pager.record_page(5, 0);
        pager.record_page(0, 5);
        pager.record_page(0, 5);
        assert_eq!(pager.record_page(1, 4), None);
        pager.record_page(0, 5);
        assert_eq!(pager.record_page(0, 5), None);
        assert_eq!(pager.record_page(0, 5), Some(StopReason::ConsecutiveDuplicates));
    }

    #[test]
    fn test_empty_page_counts_as_zero_new() {
        let policy = PaginationPolicy {
            max_consecutive_duplicate_pages: 1,
            ..PaginationPolicy::default()
        };
        let mut pager = PaginationController::new(policy);
        assert_eq!(pager.record_page(0, 0), Some(StopReason::ConsecutiveDuplicates));
    }

    #[test]
    fn test_burst_stop_is_opt_in() {
        let mut pager = PaginationController::new(PaginationPolicy::default());
        assert_eq!(pager.record_page(3, 7), None);

        let mut strict = PaginationController::new(PaginationPolicy {
            duplicate_burst_stop: Some(5),
            ..PaginationPolicy::default()
        });
        assert_eq!(strict.record_page(3, 7), Some(StopReason::DuplicateBurst));
    }

    #[test]
    fn test_always_stops_within_page_cap() {
        for max_pages in 1..8 {
            for n in 1..5 {
                for pattern in 0u32..32 {
                    let mut pager = PaginationController::new(PaginationPolicy {
                        max_pages,
                        max_consecutive_duplicate_pages: n,
                        ..PaginationPolicy::default()
                    });
                    let mut calls = 0;
                    let mut zero_run = 0;
                    loop {
                        let new = if pattern & (1 << (calls % 5)) != 0 { 1 } else { 0 };
                        zero_run = if new == 0 { zero_run + 1 } else { 0 };
                        calls += 1;
                        if pager.record_page(new, 0).is_some() {
                            break;
                        }
                        assert!(zero_run < n);
                    }
                    assert!(calls <= max_pages);
                    assert!(pager.is_stopped());
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_advance_clicks_until_control_disabled() {
        let next = "button.next";
        let mut driver = ScriptedDriver::new().page(
            "https://x.test/list",
            ScriptedPage::new()
                .element(next, true, true)
                .on_click(next, ClickEffect::new(vec![]))
                .on_click(next, ClickEffect::new(vec![]).set_element(next, true, false)),
        );
        driver
            .navigate("https://x.test/list", Duration::from_secs(5))
            .await
            .unwrap();

        let mut pager = PaginationController::new(PaginationPolicy::default());
        pager.start();
        assert_eq!(pager.advance(&mut driver, next).await.unwrap(), None);
        assert_eq!(pager.advance(&mut driver, next).await.unwrap(), None);
        assert_eq!(
            pager.advance(&mut driver, next).await.unwrap(),
            Some(StopReason::ControlDisabled)
        );
        assert_eq!(driver.clicks().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_advance_retries_once_then_stops() {
        let mut driver = ScriptedDriver::new().page("https://x.test/list", ScriptedPage::new());
        driver
            .navigate("https://x.test/list", Duration::from_secs(5))
            .await
            .unwrap();

        let mut pager = PaginationController::new(PaginationPolicy::default());
        let start = tokio::time::Instant::now();
        assert_eq!(
            pager.advance(&mut driver, "button.next").await.unwrap(),
            Some(StopReason::NoNextControl)
        );
        assert!(start.elapsed() >= Duration::from_millis(1_000));
        assert_eq!(pager.report().stop_reason, Some(StopReason::NoNextControl));
    }
}
