//! Dedup/upsert store for extracted records.
//!
//! Rows are unique per `(external_key, natural_key)`. An upsert only touches
//! `fields`, `updated_at` and `update_count`; `kind` and `first_seen_at` are
//! fixed by the first insert.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::models::{NewRecord, RecordRow};
use super::parse_datetime;
use super::pool::{DbPool, DieselError, SqliteConn};
use super::util::{is_unique_violation, now_rfc3339};
use crate::extract::ExtractedRecord;
use crate::schema::records;
use crate::with_conn;

/// Stay well under SQLite's bind-variable limit.
const INDEX_CHUNK: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub created: usize,
    pub updated: usize,
    pub failed_batches: usize,
    pub failed_records: usize,
}

impl BatchReport {
    pub fn merge(&mut self, other: &BatchReport) {
        self.created += other.created;
        self.updated += other.updated;
        self.failed_batches += other.failed_batches;
        self.failed_records += other.failed_records;
    }

    pub fn written(&self) -> usize {
        self.created + self.updated
    }
}

/// A persisted record with its bookkeeping columns.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub id: i32,
    pub record: ExtractedRecord,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub update_count: i32,
}

impl From<RecordRow> for StoredRecord {
    fn from(row: RecordRow) -> Self {
        let fields = match serde_json::from_str::<Value>(&row.fields) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        Self {
            id: row.id,
            first_seen_at: parse_datetime(&row.first_seen_at),
            updated_at: parse_datetime(&row.updated_at),
            update_count: row.update_count,
            record: ExtractedRecord {
                kind: row.kind,
                external_key: row.external_key,
                natural_key: row.natural_key,
                fields,
            },
        }
    }
}

#[derive(Clone)]
pub struct RecordStore {
    pool: DbPool,
}

impl RecordStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn exists(&self, external_key: &str, natural_key: &str) -> Result<bool, DieselError> {
        with_conn!(self.pool, conn, {
            let count: i64 = records::table
                .filter(records::external_key.eq(external_key))
                .filter(records::natural_key.eq(natural_key))
                .count()
                .get_result(&mut conn)
                .await?;
            Ok(count > 0)
        })
    }

    pub async fn get(
        &self,
        external_key: &str,
        natural_key: &str,
    ) -> Result<Option<StoredRecord>, DieselError> {
        with_conn!(self.pool, conn, {
            records::table
                .filter(records::external_key.eq(external_key))
                .filter(records::natural_key.eq(natural_key))
                .select(RecordRow::as_select())
                .first(&mut conn)
                .await
                .optional()
                .map(|row| row.map(StoredRecord::from))
        })
    }

    /// Number of rows, optionally restricted to one kind.
    pub async fn count(&self, kind: Option<&str>) -> Result<i64, DieselError> {
        with_conn!(self.pool, conn, {
            let mut query = records::table.into_boxed();
            if let Some(kind) = kind {
                query = query.filter(records::kind.eq(kind));
            }
            query.count().get_result(&mut conn).await
        })
    }

    pub async fn count_by_kind(&self) -> Result<Vec<(String, i64)>, DieselError> {
        with_conn!(self.pool, conn, {
            records::table
                .group_by(records::kind)
                .select((records::kind, diesel::dsl::count_star()))
                .order(records::kind.asc())
                .load::<(String, i64)>(&mut conn)
                .await
        })
    }

    pub async fn upsert(&self, record: &ExtractedRecord) -> Result<UpsertOutcome, DieselError> {
        let fields = encode_fields(&record.fields);
        let now = now_rfc3339();
        with_conn!(self.pool, conn, {
            Self::upsert_with(&mut conn, record, &fields, &now).await
        })
    }

    /// Upsert in chunks of `batch_size`, one transaction per chunk.
    ///
    /// A failing chunk is rolled back and counted; later chunks still run.
    /// Only a failure to open the connection is returned as an error.
    pub async fn upsert_batch(
        &self,
        batch: &[ExtractedRecord],
        batch_size: usize,
    ) -> Result<BatchReport, DieselError> {
        let mut report = BatchReport::default();
        if batch.is_empty() {
            return Ok(report);
        }
        let batch_size = batch_size.max(1);

        with_conn!(self.pool, conn, {
            for (index, chunk) in batch.chunks(batch_size).enumerate() {
                let chunk = chunk.to_vec();
                let size = chunk.len();
                let result = conn
                    .transaction::<_, DieselError, _>(|conn| {
                        let chunk = chunk.clone();
                        Box::pin(async move {
                            let now = now_rfc3339();
                            let mut created = 0;
                            let mut updated = 0;
                            for record in &chunk {
                                let fields = encode_fields(&record.fields);
                                match Self::upsert_with(conn, record, &fields, &now).await? {
                                    UpsertOutcome::Created => created += 1,
                                    UpsertOutcome::Updated => updated += 1,
                                }
                            }
                            Ok((created, updated))
                        })
                    })
                    .await;

                match result {
                    Ok((created, updated)) => {
                        debug!(batch = index, created, updated, "Committed batch");
                        report.created += created;
                        report.updated += updated;
                    }
                    Err(e) => {
                        warn!(batch = index, records = size, "Batch rolled back: {}", e);
                        report.failed_batches += 1;
                        report.failed_records += size;
                    }
                }
            }
            Ok(report)
        })
    }

    /// Which of `candidates` are already stored for `external_key`.
    pub async fn bulk_index(
        &self,
        external_key: &str,
        candidates: &[String],
    ) -> Result<HashSet<String>, DieselError> {
        let mut known = HashSet::new();
        if candidates.is_empty() {
            return Ok(known);
        }
        with_conn!(self.pool, conn, {
            for chunk in candidates.chunks(INDEX_CHUNK) {
                let found: Vec<String> = records::table
                    .filter(records::external_key.eq(external_key))
                    .filter(records::natural_key.eq_any(chunk))
                    .select(records::natural_key)
                    .load(&mut conn)
                    .await?;
                known.extend(found);
            }
            Ok(known)
        })
    }

    async fn upsert_with(
        conn: &mut SqliteConn,
        record: &ExtractedRecord,
        fields: &str,
        now: &str,
    ) -> Result<UpsertOutcome, DieselError> {
        if Self::update_existing(conn, record, fields, now).await? {
            return Ok(UpsertOutcome::Updated);
        }

        let new_record = NewRecord {
            kind: &record.kind,
            external_key: &record.external_key,
            natural_key: &record.natural_key,
            fields,
            first_seen_at: now,
            updated_at: now,
            update_count: 0,
        };
        match diesel::insert_into(records::table)
            .values(&new_record)
            .execute(conn)
            .await
        {
            Ok(_) => Ok(UpsertOutcome::Created),
            // Another session inserted the same key between our update and insert.
            Err(e) if is_unique_violation(&e) => {
                debug!(
                    key = %record.external_key,
                    natural_key = %record.natural_key,
                    "Insert raced, retrying as update"
                );
                if Self::update_existing(conn, record, fields, now).await? {
                    Ok(UpsertOutcome::Updated)
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn update_existing(
        conn: &mut SqliteConn,
        record: &ExtractedRecord,
        fields: &str,
        now: &str,
    ) -> Result<bool, DieselError> {
        let rows = diesel::update(
            records::table
                .filter(records::external_key.eq(&record.external_key))
                .filter(records::natural_key.eq(&record.natural_key)),
        )
        .set((
            records::fields.eq(fields),
            records::updated_at.eq(now),
            records::update_count.eq(records::update_count + 1),
        ))
        .execute(conn)
        .await?;
        Ok(rows > 0)
    }
}

fn encode_fields(fields: &Map<String, Value>) -> String {
    Value::Object(fields.clone()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::DbContext;
    use serde_json::json;
    use tempfile::tempdir;

    fn post(key: &str, likes: i64) -> ExtractedRecord {
        ExtractedRecord {
            kind: "note".to_string(),
            external_key: "U1".to_string(),
            natural_key: key.to_string(),
            fields: json!({"like_count": likes}).as_object().cloned().unwrap(),
        }
    }

    async fn store(dir: &tempfile::TempDir) -> RecordStore {
        let ctx = DbContext::new(&dir.path().join("records.db"));
        ctx.init_schema().await.unwrap();
        ctx.records()
    }

    #[tokio::test]
    async fn test_upsert_twice_keeps_one_row_with_latest_fields() {
        let dir = tempdir().unwrap();
        let store = store(&dir).await;

        assert_eq!(store.upsert(&post("post_42", 10)).await.unwrap(), UpsertOutcome::Created);
        let first = store.get("U1", "post_42").await.unwrap().unwrap();

        assert_eq!(store.upsert(&post("post_42", 25)).await.unwrap(), UpsertOutcome::Updated);
        assert_eq!(store.count(None).await.unwrap(), 1);

        let second = store.get("U1", "post_42").await.unwrap().unwrap();
        assert_eq!(second.record.fields["like_count"], json!(25));
        assert_eq!(second.id, first.id);
        assert_eq!(second.first_seen_at, first.first_seen_at);
        assert_eq!(second.update_count, 1);
    }

    #[tokio::test]
    async fn test_same_natural_key_under_other_entity_is_separate() {
        let dir = tempdir().unwrap();
        let store = store(&dir).await;
        let mut other = post("profile", 1);
        other.external_key = "U2".to_string();

        store.upsert(&post("profile", 1)).await.unwrap();
        store.upsert(&other).await.unwrap();
        assert_eq!(store.count(Some("note")).await.unwrap(), 2);
        assert!(store.exists("U2", "profile").await.unwrap());
        assert!(!store.exists("U3", "profile").await.unwrap());
    }

    #[tokio::test]
    async fn test_batch_counts_created_and_updated() {
        let dir = tempdir().unwrap();
        let store = store(&dir).await;
        store.upsert(&post("n1", 1)).await.unwrap();

        let batch: Vec<_> = (1..=7).map(|i| post(&format!("n{}", i), i)).collect();
        let report = store.upsert_batch(&batch, 3).await.unwrap();
        assert_eq!(report.created, 6);
        assert_eq!(report.updated, 1);
        assert_eq!(report.failed_batches, 0);
        assert_eq!(store.count(None).await.unwrap(), 7);
        assert_eq!(store.count_by_kind().await.unwrap(), vec![("note".to_string(), 7)]);
    }

    #[tokio::test]
    async fn test_failed_batches_are_counted_not_raised() {
        let dir = tempdir().unwrap();
        // no schema: every chunk fails
        let store = DbContext::new(&dir.path().join("empty.db")).records();
        let batch: Vec<_> = (0..5).map(|i| post(&format!("n{}", i), i)).collect();

        let report = store.upsert_batch(&batch, 2).await.unwrap();
        assert_eq!(report.failed_batches, 3);
        assert_eq!(report.failed_records, 5);
        assert_eq!(report.written(), 0);
    }

    #[tokio::test]
    async fn test_bulk_index_spans_chunks() {
        let dir = tempdir().unwrap();
        let store = store(&dir).await;
        let stored: Vec<_> = (0..600).step_by(2).map(|i| post(&format!("m{}", i), 0)).collect();
        store.upsert_batch(&stored, 1000).await.unwrap();

        let candidates: Vec<String> = (0..1200).map(|i| format!("m{}", i)).collect();
        let known = store.bulk_index("U1", &candidates).await.unwrap();
        assert_eq!(known.len(), 300);
        assert!(known.contains("m598"));
        assert!(!known.contains("m599"));
        assert!(store.bulk_index("U2", &candidates).await.unwrap().is_empty());
    }
}
