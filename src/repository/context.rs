//! Database context for managing connections and repository access.
//!
//! The DbContext is the primary entry point for all database operations.
//! It holds the connection pool and hands out the record store and the
//! work-item queue.

use std::path::Path;

use diesel_async::SimpleAsyncConnection;

use super::pool::{DbPool, DieselError, SqliteConn};
use super::records::RecordStore;
use super::work_items::WorkItemRepository;
use crate::with_conn;

/// Database context that manages the connection pool and provides repository access.
///
/// # Example
/// ```ignore
/// let ctx = DbContext::new(&db_path);
/// ctx.init_schema().await?;
/// let report = ctx.records().upsert_batch(&records, 1000).await;
/// ```
#[derive(Clone, Debug)]
pub struct DbContext {
    pool: DbPool,
}

impl DbContext {
    /// Create a context from a database file path.
    pub fn new(db_path: &Path) -> Self {
        Self {
            pool: DbPool::from_path(db_path),
        }
    }

    /// Create a context from a database URL (`sqlite:` prefix optional).
    pub fn from_url(url: &str) -> Self {
        Self {
            pool: DbPool::new(url),
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn records(&self) -> RecordStore {
        RecordStore::new(self.pool.clone())
    }

    pub fn work_items(&self) -> WorkItemRepository {
        WorkItemRepository::new(self.pool.clone())
    }

    /// Create the tables if they don't exist.
    pub async fn init_schema(&self) -> Result<(), DieselError> {
        with_conn!(self.pool, conn, { Self::init_sqlite_schema(&mut conn).await })
    }

    async fn init_sqlite_schema(conn: &mut SqliteConn) -> Result<(), DieselError> {
        conn.batch_execute(
            r#"
            -- Extracted records, one row per (entity, natural key)
            CREATE TABLE IF NOT EXISTS records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                external_key TEXT NOT NULL,
                natural_key TEXT NOT NULL,
                fields TEXT NOT NULL DEFAULT '{}',
                first_seen_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                update_count INTEGER NOT NULL DEFAULT 0,
                UNIQUE(external_key, natural_key)
            );

            CREATE INDEX IF NOT EXISTS idx_records_kind ON records(kind);

            -- Work queue
            CREATE TABLE IF NOT EXISTS work_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job TEXT NOT NULL,
                external_key TEXT NOT NULL,
                target_url TEXT NOT NULL,
                label TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                enqueued_at TEXT NOT NULL,
                finished_at TEXT,
                UNIQUE(job, external_key)
            );

            CREATE INDEX IF NOT EXISTS idx_work_items_status ON work_items(job, status);
            "#,
        )
        .await?;

        Ok(())
    }

    /// Get list of all tables in the database.
    pub async fn list_tables(&self) -> Result<Vec<String>, DieselError> {
        with_conn!(self.pool, conn, {
            let rows: Vec<TableName> = diesel_async::RunQueryDsl::load(
                diesel::sql_query(
                    "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                ),
                &mut conn,
            )
            .await?;
            Ok(rows.into_iter().map(|r| r.name).collect())
        })
    }
}

#[derive(diesel::QueryableByName)]
struct TableName {
    #[diesel(sql_type = diesel::sql_types::Text)]
    name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_init_schema_is_idempotent() {
        let dir = tempdir().unwrap();
        let ctx = DbContext::new(&dir.path().join("test.db"));

        ctx.init_schema().await.unwrap();
        ctx.init_schema().await.unwrap();

        let tables = ctx.list_tables().await.unwrap();
        assert!(tables.contains(&"records".to_string()));
        assert!(tables.contains(&"work_items".to_string()));
        assert_eq!(ctx.records().count(None).await.unwrap(), 0);
    }
}
