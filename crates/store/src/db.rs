use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, NaiveDateTime, Utc};
use duckdb::Connection;
use tracekeep_core::error::{Result, TracekeepError};
use tracekeep_core::query::StatusResponse;

use crate::schema::SCHEMA_SQL;
use crate::summaries::SummaryStore;

/// One DuckDB file holding both the span log and the persisted trace index.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    db_path: String,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| TracekeepError::Io(format!("failed to create db dir: {e}")))?;
        }

        let conn = Connection::open(path)
            .map_err(|e| TracekeepError::StorageRead(format!("failed to open duckdb: {e}")))?;
        conn.execute_batch("PRAGMA threads=4;")
            .map_err(|e| TracekeepError::StorageWrite(format!("failed to set pragmas: {e}")))?;
        conn.execute_batch(SCHEMA_SQL).map_err(|e| {
            TracekeepError::StorageWrite(format!("failed to initialize schema: {e}"))
        })?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: path.display().to_string(),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            TracekeepError::StorageRead(format!("failed to open in-memory db: {e}"))
        })?;
        conn.execute_batch(SCHEMA_SQL).map_err(|e| {
            TracekeepError::StorageWrite(format!("failed to initialize schema: {e}"))
        })?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: ":memory:".to_string(),
        })
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    // A panic while holding the guard leaves DuckDB itself consistent, so the
    // poison flag is ignored.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> Result<StatusResponse> {
        let needs_rebuild = self.needs_rebuild()?;
        let conn = self.conn();

        let spans_count = scalar_usize(&conn, "SELECT COUNT(*) FROM spans")?;
        let traces_count = scalar_usize(&conn, "SELECT COUNT(*) FROM traces")?;
        let sessions_count =
            scalar_usize(&conn, "SELECT COUNT(DISTINCT session_id) FROM traces")?;

        let oldest_start = scalar_ts(&conn, "SELECT MIN(start_ts) FROM traces")?;
        let newest_start = scalar_ts(&conn, "SELECT MAX(start_ts) FROM traces")?;

        let db_size_bytes = if self.db_path == ":memory:" {
            0
        } else {
            fs::metadata(&self.db_path).map(|m| m.len()).unwrap_or(0)
        };

        Ok(StatusResponse {
            db_path: self.db_path.clone(),
            db_size_bytes,
            spans_count,
            traces_count,
            sessions_count,
            oldest_start,
            newest_start,
            needs_rebuild,
        })
    }
}

/// Renders a timestamp as a DuckDB `TIMESTAMP` literal at microsecond
/// precision.
pub(crate) fn ts_param(ts: &DateTime<Utc>) -> String {
    ts.naive_utc().format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

pub(crate) fn naive_to_utc(ts: NaiveDateTime) -> DateTime<Utc> {
    ts.and_utc()
}

fn scalar_usize(conn: &Connection, sql: &str) -> Result<usize> {
    conn.query_row(sql, [], |row| row.get::<_, i64>(0))
        .map(|v| v as usize)
        .map_err(|e| TracekeepError::StorageRead(format!("query failed: {e}")))
}

fn scalar_ts(conn: &Connection, sql: &str) -> Result<Option<DateTime<Utc>>> {
    conn.query_row(sql, [], |row| row.get::<_, Option<NaiveDateTime>>(0))
        .map(|opt| opt.map(naive_to_utc))
        .map_err(|e| TracekeepError::StorageRead(format!("query failed: {e}")))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn in_memory_store_initializes() {
        let store = Store::open_in_memory().unwrap();
        let status = store.status().unwrap();
        assert_eq!(status.spans_count, 0);
        assert_eq!(status.traces_count, 0);
        assert_eq!(status.sessions_count, 0);
        assert!(status.oldest_start.is_none());
        assert!(!status.needs_rebuild);
    }

    #[test]
    fn file_store_reopens() {
        let dir = std::env::temp_dir().join(format!("tracekeep-db-{}", std::process::id()));
        let path = dir.join("nested/traces.duckdb");
        {
            let store = Store::open(&path).unwrap();
            assert_eq!(store.db_path(), path.display().to_string());
        }
        let reopened = Store::open(&path).unwrap();
        assert!(reopened.status().unwrap().db_size_bytes > 0);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn ts_param_keeps_microseconds() {
        let ts = Utc.timestamp_opt(1_700_000_000, 123_456_000).unwrap();
        assert_eq!(ts_param(&ts), "2023-11-14 22:13:20.123456");
    }
}
