//! Work-item queue backed by the `work_items` table.

use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};

use super::models::{NewWorkItem, WorkItemRow};
use super::pool::{DbPool, DieselError};
use super::util::now_rfc3339;
use crate::orchestrator::{WorkItem, WorkOutcome};
use crate::schema::work_items;
use crate::with_conn;

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_PROCESSING: &str = "processing";

impl From<WorkItemRow> for WorkItem {
    fn from(row: WorkItemRow) -> Self {
        Self {
            id: i64::from(row.id),
            external_key: row.external_key,
            target_url: row.target_url,
            label: row.label,
            attempts: row.attempts.max(0) as u32,
        }
    }
}

/// Row count per `(job, status)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCount {
    pub job: String,
    pub status: String,
    pub count: i64,
}

#[derive(Clone)]
pub struct WorkItemRepository {
    pool: DbPool,
}

impl WorkItemRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Queue one item. Returns false if the job already has this key.
    pub async fn enqueue(
        &self,
        job: &str,
        external_key: &str,
        target_url: &str,
        label: Option<&str>,
    ) -> Result<bool, DieselError> {
        let now = now_rfc3339();
        with_conn!(self.pool, conn, {
            let rows = diesel::insert_or_ignore_into(work_items::table)
                .values(&NewWorkItem {
                    job,
                    external_key,
                    target_url,
                    label,
                    status: STATUS_PENDING,
                    attempts: 0,
                    enqueued_at: &now,
                })
                .execute(&mut conn)
                .await?;
            Ok(rows > 0)
        })
    }

    /// Queue many items in one transaction. Returns how many were new.
    pub async fn enqueue_many(&self, job: &str, items: &[WorkItem]) -> Result<usize, DieselError> {
        if items.is_empty() {
            return Ok(0);
        }
        let job = job.to_string();
        let items = items.to_vec();
        with_conn!(self.pool, conn, {
            conn.transaction(|conn| {
                let job = job.clone();
                let items = items.clone();
                Box::pin(async move {
                    let now = now_rfc3339();
                    let mut inserted = 0;
                    for item in &items {
                        inserted += diesel::insert_or_ignore_into(work_items::table)
                            .values(&NewWorkItem {
                                job: &job,
                                external_key: &item.external_key,
                                target_url: &item.target_url,
                                label: item.label.as_deref(),
                                status: STATUS_PENDING,
                                attempts: 0,
                                enqueued_at: &now,
                            })
                            .execute(conn)
                            .await?;
                    }
                    Ok(inserted)
                })
            })
            .await
        })
    }

    /// Atomically move the oldest pending item of `job` to processing.
    pub async fn claim_next(&self, job: &str) -> Result<Option<WorkItem>, DieselError> {
        let job = job.to_string();
        with_conn!(self.pool, conn, {
            conn.transaction(|conn| {
                let job = job.clone();
                Box::pin(async move {
                    let row: Option<WorkItemRow> = work_items::table
                        .filter(work_items::job.eq(&job))
                        .filter(work_items::status.eq(STATUS_PENDING))
                        .order(work_items::id.asc())
                        .select(WorkItemRow::as_select())
                        .first(conn)
                        .await
                        .optional()?;

                    let Some(row) = row else {
                        return Ok(None);
                    };
                    diesel::update(work_items::table.find(row.id))
                        .set((
                            work_items::status.eq(STATUS_PROCESSING),
                            work_items::attempts.eq(work_items::attempts + 1),
                        ))
                        .execute(conn)
                        .await?;

                    let mut item = WorkItem::from(row);
                    item.attempts += 1;
                    Ok(Some(item))
                })
            })
            .await
        })
    }

    /// Record the terminal status of an item.
    pub async fn mark_outcome(
        &self,
        id: i64,
        outcome: WorkOutcome,
        error: Option<&str>,
        no_data_is_failure: bool,
    ) -> Result<(), DieselError> {
        let now = now_rfc3339();
        let id = row_id(id)?;
        with_conn!(self.pool, conn, {
            diesel::update(work_items::table.find(id))
                .set((
                    work_items::status.eq(outcome.as_status(no_data_is_failure)),
                    work_items::last_error.eq(error),
                    work_items::finished_at.eq(Some(now.as_str())),
                ))
                .execute(&mut conn)
                .await?;
            Ok(())
        })
    }

    /// Put a claimed item back in the queue without counting the attempt.
    pub async fn release(&self, id: i64) -> Result<(), DieselError> {
        let id = row_id(id)?;
        with_conn!(self.pool, conn, {
            diesel::update(
                work_items::table
                    .find(id)
                    .filter(work_items::status.eq(STATUS_PROCESSING)),
            )
            .set((
                work_items::status.eq(STATUS_PENDING),
                work_items::attempts.eq(work_items::attempts - 1),
            ))
            .execute(&mut conn)
            .await?;
            Ok(())
        })
    }

    /// Items left in processing by a crashed run go back to pending.
    pub async fn reset_stale(&self, job: &str) -> Result<usize, DieselError> {
        self.move_status(job, STATUS_PROCESSING, STATUS_PENDING).await
    }

    pub async fn requeue_failed(&self, job: &str) -> Result<usize, DieselError> {
        self.move_status(job, "failed", STATUS_PENDING).await
    }

    async fn move_status(&self, job: &str, from: &str, to: &str) -> Result<usize, DieselError> {
        with_conn!(self.pool, conn, {
            diesel::update(
                work_items::table
                    .filter(work_items::job.eq(job))
                    .filter(work_items::status.eq(from)),
            )
            .set(work_items::status.eq(to))
            .execute(&mut conn)
            .await
        })
    }

    pub async fn get(&self, id: i64) -> Result<Option<WorkItemRow>, DieselError> {
        let id = row_id(id)?;
        with_conn!(self.pool, conn, {
            work_items::table
                .find(id)
                .select(WorkItemRow::as_select())
                .first(&mut conn)
                .await
                .optional()
        })
    }

    pub async fn counts(&self, job: Option<&str>) -> Result<Vec<StatusCount>, DieselError> {
        with_conn!(self.pool, conn, {
            let mut query = work_items::table
                .group_by((work_items::job, work_items::status))
                .select((work_items::job, work_items::status, diesel::dsl::count_star()))
                .order((work_items::job.asc(), work_items::status.asc()))
                .into_boxed();
            if let Some(job) = job {
                query = query.filter(work_items::job.eq(job));
            }
            query
                .load::<(String, String, i64)>(&mut conn)
                .await
                .map(|rows| {
                    rows.into_iter()
                        .map(|(job, status, count)| StatusCount { job, status, count })
                        .collect()
                })
        })
    }
}

fn row_id(id: i64) -> Result<i32, DieselError> {
    i32::try_from(id).map_err(|_| DieselError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::DbContext;
    use tempfile::tempdir;

    async fn queue(dir: &tempfile::TempDir) -> WorkItemRepository {
        let ctx = DbContext::new(&dir.path().join("queue.db"));
        ctx.init_schema().await.unwrap();
        ctx.work_items()
    }

    #[tokio::test]
    async fn test_enqueue_ignores_duplicates() {
        let dir = tempdir().unwrap();
        let queue = queue(&dir).await;
        assert!(queue.enqueue("detail", "U1", "https://x.test/U1", None).await.unwrap());
        assert!(!queue.enqueue("detail", "U1", "https://x.test/U1", None).await.unwrap());
        // same key under another job is its own item
        assert!(queue.enqueue("other", "U1", "https://x.test/U1", None).await.unwrap());

        let items = vec![
            WorkItem::adhoc("U1", "https://x.test/U1"),
            WorkItem::adhoc("U2", "https://x.test/U2"),
        ];
        assert_eq!(queue.enqueue_many("detail", &items).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_claim_in_order_then_exhaust() {
        let dir = tempdir().unwrap();
        let queue = queue(&dir).await;
        for key in ["A", "B"] {
            queue.enqueue("detail", key, key, Some("label")).await.unwrap();
        }

        let first = queue.claim_next("detail").await.unwrap().unwrap();
        assert_eq!(first.external_key, "A");
        assert_eq!(first.attempts, 1);
        assert_eq!(first.label.as_deref(), Some("label"));
        let second = queue.claim_next("detail").await.unwrap().unwrap();
        assert_eq!(second.external_key, "B");
        assert!(queue.claim_next("detail").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_outcomes_and_counts() {
        let dir = tempdir().unwrap();
        let queue = queue(&dir).await;
        for key in ["A", "B", "C"] {
            queue.enqueue("detail", key, key, None).await.unwrap();
        }
        let a = queue.claim_next("detail").await.unwrap().unwrap();
        queue.mark_outcome(a.id, WorkOutcome::Succeeded, None, false).await.unwrap();
        let b = queue.claim_next("detail").await.unwrap().unwrap();
        queue.mark_outcome(b.id, WorkOutcome::NoData, None, true).await.unwrap();
        let c = queue.claim_next("detail").await.unwrap().unwrap();
        queue.release(c.id).await.unwrap();

        let row = queue.get(b.id).await.unwrap().unwrap();
        assert_eq!(row.status, "failed");
        assert!(row.finished_at.is_some());

        let counts = queue.counts(Some("detail")).await.unwrap();
        let status = |s: &str| counts.iter().find(|c| c.status == s).map(|c| c.count);
        assert_eq!(status("succeeded"), Some(1));
        assert_eq!(status("failed"), Some(1));
        assert_eq!(status("pending"), Some(1));

        // released item keeps its attempt count
        let again = queue.claim_next("detail").await.unwrap().unwrap();
        assert_eq!(again.external_key, "C");
        assert_eq!(again.attempts, 1);

        assert_eq!(queue.reset_stale("detail").await.unwrap(), 1);
        assert_eq!(queue.requeue_failed("detail").await.unwrap(), 1);
    }
}
