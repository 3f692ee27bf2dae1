//! SQLite connection source.
//!
//! Connections are opened on demand through diesel-async's
//! `SyncConnectionWrapper`; the orchestrator holds one at a time.

use std::path::Path;

use diesel::sqlite::SqliteConnection;
use diesel_async::sync_connection_wrapper::SyncConnectionWrapper;
use diesel_async::{AsyncConnection, SimpleAsyncConnection};

use super::util::to_diesel_error;

/// Diesel error type alias.
pub type DieselError = diesel::result::Error;

/// Async SQLite connection type.
pub type SqliteConn = SyncConnectionWrapper<SqliteConnection>;

/// Per-connection settings. A busy timeout lets a second scrape process
/// wait for the writer instead of failing the batch.
const CONNECTION_PRAGMAS: &str = "PRAGMA busy_timeout = 5000; PRAGMA journal_mode = WAL;";

/// SQLite connection pool (lightweight - creates connections on demand).
#[derive(Clone, Debug)]
pub struct DbPool {
    database_url: String,
}

impl DbPool {
    pub fn new(database_url: &str) -> Self {
        // Strip sqlite: prefix if present
        let url = database_url.strip_prefix("sqlite:").unwrap_or(database_url);
        Self {
            database_url: url.to_string(),
        }
    }

    pub fn from_path(path: &Path) -> Self {
        Self::new(&path.display().to_string())
    }

    pub async fn get(&self) -> Result<SqliteConn, DieselError> {
        let mut conn = SqliteConn::establish(&self.database_url)
            .await
            .map_err(to_diesel_error)?;
        conn.batch_execute(CONNECTION_PRAGMAS).await?;
        Ok(conn)
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }
}

/// Run a block with a fresh connection bound to `$conn`.
///
/// # Example
/// ```ignore
/// with_conn!(self.pool, conn, {
///     records::table.count().get_result::<i64>(&mut conn).await
/// })
/// ```
#[macro_export]
macro_rules! with_conn {
    ($pool:expr, $conn:ident, $body:block) => {{
        #[allow(unused_mut)]
        let mut $conn = $pool.get().await?;
        $body
    }};
}

#[allow(unused_imports)]
pub use with_conn;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_sqlite_prefix() {
        assert_eq!(DbPool::new("sqlite:/tmp/x.db").database_url(), "/tmp/x.db");
        assert_eq!(DbPool::new("/tmp/y.db").database_url(), "/tmp/y.db");
    }
}
