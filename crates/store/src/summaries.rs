use chrono::NaiveDateTime;
use duckdb::{params, params_from_iter};
use tracekeep_core::error::{Result, TracekeepError};
use tracekeep_core::model::trace::TraceSummary;

use crate::Store;
use crate::db::{naive_to_utc, ts_param};

const NEEDS_REBUILD_KEY: &str = "needs_rebuild";

/// Durable keyed collection of trace summaries plus the corruption flag.
pub trait SummaryStore: Send + Sync {
    /// Every persisted summary, newest start first, ties by trace id.
    fn load_summaries(&self) -> Result<Vec<TraceSummary>>;

    /// Atomically inserts or replaces the summary keyed by its trace id.
    fn put_summary(&self, summary: &TraceSummary) -> Result<()>;

    /// Writes many summaries in one transaction.
    fn put_summaries(&self, summaries: &[TraceSummary]) -> Result<()>;

    fn clear_summaries(&self) -> Result<()>;

    fn remove_summaries(&self, trace_ids: &[String]) -> Result<usize>;

    fn needs_rebuild(&self) -> Result<bool>;

    fn set_needs_rebuild(&self, flag: bool) -> Result<()>;
}

const UPSERT_SQL: &str = "INSERT OR REPLACE INTO traces
     (trace_id, root_span_name, session_id, session_title, conversation_id,
      start_ts, end_ts, span_count)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?)";

impl SummaryStore for Store {
    fn load_summaries(&self) -> Result<Vec<TraceSummary>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT trace_id, root_span_name, session_id, session_title, conversation_id,
                        start_ts, end_ts, span_count
                 FROM traces
                 ORDER BY start_ts DESC, trace_id ASC",
            )
            .map_err(|e| TracekeepError::StorageRead(format!("prepare traces failed: {e}")))?;

        let rows = stmt
            .query_map([], |row| {
                Ok(TraceSummary {
                    trace_id: row.get::<_, String>(0)?,
                    root_span_name: row.get::<_, String>(1)?,
                    session_id: row.get::<_, Option<String>>(2)?,
                    session_title: row.get::<_, Option<String>>(3)?,
                    conversation_id: row.get::<_, Option<String>>(4)?,
                    start_time: naive_to_utc(row.get::<_, NaiveDateTime>(5)?),
                    end_time: naive_to_utc(row.get::<_, NaiveDateTime>(6)?),
                    span_count: row.get::<_, i64>(7)? as u64,
                })
            })
            .map_err(|e| TracekeepError::StorageRead(format!("query traces failed: {e}")))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(
                row.map_err(|e| TracekeepError::StorageRead(format!("map trace failed: {e}")))?,
            );
        }
        Ok(out)
    }

    fn put_summary(&self, summary: &TraceSummary) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            UPSERT_SQL,
            params![
                summary.trace_id,
                summary.root_span_name,
                summary.session_id,
                summary.session_title,
                summary.conversation_id,
                ts_param(&summary.start_time),
                ts_param(&summary.end_time),
                summary.span_count as i64,
            ],
        )
        .map_err(|e| TracekeepError::StorageWrite(format!("persist trace summary failed: {e}")))?;
        Ok(())
    }

    fn put_summaries(&self, summaries: &[TraceSummary]) -> Result<()> {
        if summaries.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .map_err(|e| TracekeepError::StorageWrite(format!("begin tx failed: {e}")))?;

        {
            let mut stmt = tx.prepare(UPSERT_SQL).map_err(|e| {
                TracekeepError::StorageWrite(format!("prepare trace upsert failed: {e}"))
            })?;

            for summary in summaries {
                stmt.execute(params![
                    summary.trace_id,
                    summary.root_span_name,
                    summary.session_id,
                    summary.session_title,
                    summary.conversation_id,
                    ts_param(&summary.start_time),
                    ts_param(&summary.end_time),
                    summary.span_count as i64,
                ])
                .map_err(|e| {
                    TracekeepError::StorageWrite(format!("persist trace summary failed: {e}"))
                })?;
            }
        }

        tx.commit()
            .map_err(|e| TracekeepError::StorageWrite(format!("commit traces failed: {e}")))
    }

    fn clear_summaries(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM traces", [])
            .map_err(|e| TracekeepError::StorageWrite(format!("clear traces failed: {e}")))?;
        Ok(())
    }

    fn remove_summaries(&self, trace_ids: &[String]) -> Result<usize> {
        if trace_ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; trace_ids.len()].join(", ");
        let conn = self.conn();
        conn.execute(
            &format!("DELETE FROM traces WHERE trace_id IN ({placeholders})"),
            params_from_iter(trace_ids.iter()),
        )
        .map_err(|e| TracekeepError::StorageWrite(format!("remove traces failed: {e}")))
    }

    fn needs_rebuild(&self) -> Result<bool> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT value FROM index_meta WHERE key = ?")
            .map_err(|e| TracekeepError::StorageRead(format!("prepare index meta failed: {e}")))?;
        let mut rows = stmt
            .query_map(params![NEEDS_REBUILD_KEY], |row| row.get::<_, String>(0))
            .map_err(|e| TracekeepError::StorageRead(format!("query index meta failed: {e}")))?;
        match rows.next() {
            Some(value) => {
                let value = value.map_err(|e| {
                    TracekeepError::StorageRead(format!("map index meta failed: {e}"))
                })?;
                Ok(value == "true")
            }
            None => Ok(false),
        }
    }

    fn set_needs_rebuild(&self, flag: bool) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO index_meta (key, value) VALUES (?, ?)",
            params![NEEDS_REBUILD_KEY, flag.to_string()],
        )
        .map_err(|e| TracekeepError::StorageWrite(format!("set index flag failed: {e}")))?;
        Ok(())
    }
}
