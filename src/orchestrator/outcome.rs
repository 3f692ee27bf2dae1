//! Work items and their outcomes.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pagination::StopReason;

/// One entity to scrape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: i64,
    pub external_key: String,
    pub target_url: String,
    pub label: Option<String>,
    pub attempts: u32,
}

impl WorkItem {
    /// Item not backed by a queue row.
    pub fn adhoc(external_key: impl Into<String>, target_url: impl Into<String>) -> Self {
        Self {
            id: 0,
            external_key: external_key.into(),
            target_url: target_url.into(),
            label: None,
            attempts: 0,
        }
    }

    /// Name for logs: the label when there is one.
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.external_key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkOutcome {
    /// Every expected endpoint fired.
    Succeeded,
    /// Some data, but not every expected endpoint fired.
    SucceededPartial,
    /// The page loaded but the site had nothing for this entity.
    NoData,
    Failed,
}

impl WorkOutcome {
    /// Queue status stored for this outcome.
    pub fn as_status(&self, no_data_is_failure: bool) -> &'static str {
        match self {
            WorkOutcome::Succeeded => "succeeded",
            WorkOutcome::SucceededPartial => "partial",
            WorkOutcome::NoData if no_data_is_failure => "failed",
            WorkOutcome::NoData => "no_data",
            WorkOutcome::Failed => "failed",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, WorkOutcome::Succeeded | WorkOutcome::SucceededPartial)
    }
}

impl fmt::Display for WorkOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_status(false))
    }
}

/// Result of one item, for logging and the run summary.
#[derive(Debug, Clone)]
pub struct ItemReport {
    pub external_key: String,
    pub outcome: WorkOutcome,
    pub records_created: usize,
    pub records_updated: usize,
    /// Store batches that could not be written.
    pub failed_batches: usize,
    pub attempts: u32,
    pub error: Option<String>,
}

/// Totals for one run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub items: Vec<ItemReport>,
    pub records_created: usize,
    pub records_updated: usize,
    pub failed_batches: usize,
    pub pages: usize,
    /// Why a listing stopped paging.
    pub stop_reason: Option<StopReason>,
    pub reauthentications: u32,
    pub cancelled: bool,
    pub elapsed: Duration,
    pub rate_limit_wait: Duration,
}

impl RunSummary {
    pub fn record(&mut self, report: ItemReport) {
        self.records_created += report.records_created;
        self.records_updated += report.records_updated;
        self.failed_batches += report.failed_batches;
        self.items.push(report);
    }

    pub fn count(&self, outcome: WorkOutcome) -> usize {
        self.items.iter().filter(|r| r.outcome == outcome).count()
    }

    pub fn by_outcome(&self) -> BTreeMap<WorkOutcome, usize> {
        let mut counts = BTreeMap::new();
        for report in &self.items {
            *counts.entry(report.outcome).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_data_status_is_configurable() {
        assert_eq!(WorkOutcome::NoData.as_status(false), "no_data");
        assert_eq!(WorkOutcome::NoData.as_status(true), "failed");
        assert_eq!(WorkOutcome::SucceededPartial.as_status(true), "partial");
        assert!(!WorkOutcome::NoData.is_success());
    }

    #[test]
    fn test_summary_totals() {
        let mut summary = RunSummary::default();
        for (key, outcome, created) in [
            ("a", WorkOutcome::Succeeded, 3),
            ("b", WorkOutcome::NoData, 0),
            ("c", WorkOutcome::Succeeded, 2),
        ] {
            summary.record(ItemReport {
                external_key: key.to_string(),
                outcome,
                records_created: created,
                records_updated: 1,
                failed_batches: 0,
                attempts: 1,
                error: None,
            });
        }
        assert_eq!(summary.records_created, 5);
        assert_eq!(summary.records_updated, 3);
        assert_eq!(summary.count(WorkOutcome::Succeeded), 2);
        assert_eq!(summary.by_outcome()[&WorkOutcome::NoData], 1);
    }
}
