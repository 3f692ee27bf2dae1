//! Diesel ORM models for database tables.

use diesel::prelude::*;

use crate::schema;

/// Persisted record row.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::records)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct RecordRow {
    pub id: i32,
    pub kind: String,
    pub external_key: String,
    pub natural_key: String,
    pub fields: String,
    pub first_seen_at: String,
    pub updated_at: String,
    pub update_count: i32,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = schema::records)]
pub struct NewRecord<'a> {
    pub kind: &'a str,
    pub external_key: &'a str,
    pub natural_key: &'a str,
    pub fields: &'a str,
    pub first_seen_at: &'a str,
    pub updated_at: &'a str,
    pub update_count: i32,
}

/// Work queue row.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::work_items)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct WorkItemRow {
    pub id: i32,
    pub job: String,
    pub external_key: String,
    pub target_url: String,
    pub label: Option<String>,
    pub status: String,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub enqueued_at: String,
    pub finished_at: Option<String>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = schema::work_items)]
pub struct NewWorkItem<'a> {
    pub job: &'a str,
    pub external_key: &'a str,
    pub target_url: &'a str,
    pub label: Option<&'a str>,
    pub status: &'a str,
    pub attempts: i32,
    pub enqueued_at: &'a str,
}
