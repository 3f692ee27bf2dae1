//! Where work items come from and where their outcomes go.

use std::collections::VecDeque;

use async_trait::async_trait;
use tracing::debug;

use super::outcome::{WorkItem, WorkOutcome};
use crate::error::Result;
use crate::repository::WorkItemRepository;

#[async_trait]
pub trait WorkSource: Send {
    async fn next(&mut self) -> Result<Option<WorkItem>>;

    async fn report(
        &mut self,
        item: &WorkItem,
        outcome: WorkOutcome,
        error: Option<&str>,
    ) -> Result<()>;

    /// Return an item that was handed out but not processed.
    async fn release(&mut self, _item: &WorkItem) -> Result<()> {
        Ok(())
    }
}

/// Pending rows of one job in the `work_items` table.
pub struct DbWorkSource {
    queue: WorkItemRepository,
    job: String,
    no_data_is_failure: bool,
    limit: Option<usize>,
    claimed: usize,
}

impl DbWorkSource {
    pub fn new(queue: WorkItemRepository, job: impl Into<String>) -> Self {
        Self {
            queue,
            job: job.into(),
            no_data_is_failure: false,
            limit: None,
            claimed: 0,
        }
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn no_data_is_failure(mut self, value: bool) -> Self {
        self.no_data_is_failure = value;
        self
    }
}

#[async_trait]
impl WorkSource for DbWorkSource {
    async fn next(&mut self) -> Result<Option<WorkItem>> {
        if self.limit.is_some_and(|limit| self.claimed >= limit) {
            debug!("Item limit of {} reached", self.claimed);
            return Ok(None);
        }
        let item = self.queue.claim_next(&self.job).await?;
        if item.is_some() {
            self.claimed += 1;
        }
        Ok(item)
    }

    async fn report(
        &mut self,
        item: &WorkItem,
        outcome: WorkOutcome,
        error: Option<&str>,
    ) -> Result<()> {
        self.queue
            .mark_outcome(item.id, outcome, error, self.no_data_is_failure)
            .await?;
        Ok(())
    }

    async fn release(&mut self, item: &WorkItem) -> Result<()> {
        self.queue.release(item.id).await?;
        Ok(())
    }
}

/// In-memory items; outcomes are kept for inspection.
#[derive(Debug, Default)]
pub struct VecWorkSource {
    items: VecDeque<WorkItem>,
    reported: Vec<(WorkItem, WorkOutcome, Option<String>)>,
    released: Vec<WorkItem>,
}

impl VecWorkSource {
    pub fn new(items: impl IntoIterator<Item = WorkItem>) -> Self {
        Self {
            items: items.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn reported(&self) -> &[(WorkItem, WorkOutcome, Option<String>)] {
        &self.reported
    }

    pub fn released(&self) -> &[WorkItem] {
        &self.released
    }

    pub fn remaining(&self) -> usize {
        self.items.len()
    }
}

#[async_trait]
impl WorkSource for VecWorkSource {
    async fn next(&mut self) -> Result<Option<WorkItem>> {
        Ok(self.items.pop_front().map(|mut item| {
            item.attempts += 1;
            item
        }))
    }

    async fn report(
        &mut self,
        item: &WorkItem,
        outcome: WorkOutcome,
        error: Option<&str>,
    ) -> Result<()> {
        self.reported
            .push((item.clone(), outcome, error.map(str::to_string)));
        Ok(())
    }

    async fn release(&mut self, item: &WorkItem) -> Result<()> {
        self.released.push(item.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::DbContext;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_db_source_respects_limit_and_reports() {
        let dir = tempdir().unwrap();
        let ctx = DbContext::new(&dir.path().join("work.db"));
        ctx.init_schema().await.unwrap();
        let queue = ctx.work_items();
        for key in ["A", "B", "C"] {
            queue.enqueue("detail", key, key, None).await.unwrap();
        }

        let mut source = DbWorkSource::new(queue.clone(), "detail")
            .with_limit(Some(2))
            .no_data_is_failure(true);
        let a = source.next().await.unwrap().unwrap();
        source.report(&a, WorkOutcome::NoData, None).await.unwrap();
        let b = source.next().await.unwrap().unwrap();
        source.release(&b).await.unwrap();
        assert!(source.next().await.unwrap().is_none());

        assert_eq!(queue.get(a.id).await.unwrap().unwrap().status, "failed");
        assert_eq!(queue.get(b.id).await.unwrap().unwrap().status, "pending");
    }
}
