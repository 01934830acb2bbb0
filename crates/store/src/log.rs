use std::collections::HashMap;

use chrono::NaiveDateTime;
use duckdb::{params, params_from_iter};
use tracekeep_core::error::{Result, TracekeepError};
use tracekeep_core::model::span::{SpanKind, SpanRecord};

use crate::Store;
use crate::db::{naive_to_utc, ts_param};

/// Append-only record of every ingested span.
pub trait SpanLog: Send + Sync {
    /// Durably appends one span. Repeated span ids are appended again.
    fn append(&self, span: &SpanRecord) -> Result<()>;

    /// Spans of one trace by start time, ties in ingestion order. Unknown
    /// traces yield an empty vec.
    fn spans_for_trace(&self, trace_id: &str) -> Result<Vec<SpanRecord>>;

    /// Full scan in ingestion order.
    fn all_spans(&self) -> Result<Vec<SpanRecord>>;

    /// Number of logged spans per trace id.
    fn span_counts(&self) -> Result<HashMap<String, u64>>;

    /// Bulk removal of whole traces. Returns the number of spans removed.
    fn remove_traces(&self, trace_ids: &[String]) -> Result<usize>;
}

const SPAN_COLUMNS: &str = "trace_id, span_id, parent_span_id, service, name, start_ts, end_ts, \
     status_code, status_message, kind, attrs_json, events_json";

struct SpanRow {
    trace_id: String,
    span_id: String,
    parent_span_id: Option<String>,
    service: String,
    name: String,
    start_ts: NaiveDateTime,
    end_ts: NaiveDateTime,
    status_code: String,
    status_message: Option<String>,
    kind: String,
    attrs_json: String,
    events_json: String,
}

impl SpanRow {
    fn from_row(row: &duckdb::Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            trace_id: row.get(0)?,
            span_id: row.get(1)?,
            parent_span_id: row.get(2)?,
            service: row.get(3)?,
            name: row.get(4)?,
            start_ts: row.get(5)?,
            end_ts: row.get(6)?,
            status_code: row.get(7)?,
            status_message: row.get(8)?,
            kind: row.get(9)?,
            attrs_json: row.get(10)?,
            events_json: row.get(11)?,
        })
    }

    fn into_span(self) -> Result<SpanRecord> {
        let attributes = serde_json::from_str(&self.attrs_json).map_err(|e| {
            TracekeepError::StorageRead(format!("span {} has bad attributes: {e}", self.span_id))
        })?;
        let events = serde_json::from_str(&self.events_json).map_err(|e| {
            TracekeepError::StorageRead(format!("span {} has bad events: {e}", self.span_id))
        })?;
        Ok(SpanRecord {
            trace_id: self.trace_id,
            span_id: self.span_id,
            parent_span_id: self.parent_span_id,
            service: self.service,
            name: self.name,
            start_time: naive_to_utc(self.start_ts),
            end_time: naive_to_utc(self.end_ts),
            status_code: self.status_code,
            status_message: self.status_message,
            attributes,
            events,
            kind: SpanKind::parse(&self.kind),
        })
    }
}

impl Store {
    fn select_spans(&self, sql: &str, args: &[&str]) -> Result<Vec<SpanRecord>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| TracekeepError::StorageRead(format!("prepare spans failed: {e}")))?;

        let rows = stmt
            .query_map(params_from_iter(args.iter()), SpanRow::from_row)
            .map_err(|e| TracekeepError::StorageRead(format!("query spans failed: {e}")))?;

        let mut spans = Vec::new();
        for row in rows {
            let row =
                row.map_err(|e| TracekeepError::StorageRead(format!("map span failed: {e}")))?;
            spans.push(row.into_span()?);
        }
        Ok(spans)
    }
}

impl SpanLog for Store {
    fn append(&self, span: &SpanRecord) -> Result<()> {
        let attrs_json = serde_json::to_string(&span.attributes)
            .map_err(|e| TracekeepError::Internal(format!("encode attributes failed: {e}")))?;
        let events_json = serde_json::to_string(&span.events)
            .map_err(|e| TracekeepError::Internal(format!("encode events failed: {e}")))?;

        let conn = self.conn();
        conn.execute(
            &format!(
                "INSERT INTO spans (seq, {SPAN_COLUMNS})
                 VALUES (nextval('span_seq'), ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ),
            params![
                span.trace_id,
                span.span_id,
                span.parent_span_id,
                span.service,
                span.name,
                ts_param(&span.start_time),
                ts_param(&span.end_time),
                span.status_code,
                span.status_message,
                span.kind.as_str(),
                attrs_json,
                events_json,
            ],
        )
        .map_err(|e| TracekeepError::StorageWrite(format!("append span failed: {e}")))?;
        Ok(())
    }

    fn spans_for_trace(&self, trace_id: &str) -> Result<Vec<SpanRecord>> {
        self.select_spans(
            &format!(
                "SELECT {SPAN_COLUMNS} FROM spans WHERE trace_id = ? ORDER BY start_ts ASC, seq ASC"
            ),
            &[trace_id],
        )
    }

    fn all_spans(&self) -> Result<Vec<SpanRecord>> {
        self.select_spans(
            &format!("SELECT {SPAN_COLUMNS} FROM spans ORDER BY seq ASC"),
            &[],
        )
    }

    fn span_counts(&self) -> Result<HashMap<String, u64>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT trace_id, COUNT(*) FROM spans GROUP BY trace_id")
            .map_err(|e| TracekeepError::StorageRead(format!("prepare span counts failed: {e}")))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })
            .map_err(|e| TracekeepError::StorageRead(format!("query span counts failed: {e}")))?;

        let mut counts = HashMap::new();
        for row in rows {
            let (trace_id, count) = row
                .map_err(|e| TracekeepError::StorageRead(format!("map span count failed: {e}")))?;
            counts.insert(trace_id, count);
        }
        Ok(counts)
    }

    fn remove_traces(&self, trace_ids: &[String]) -> Result<usize> {
        if trace_ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; trace_ids.len()].join(", ");
        let conn = self.conn();
        conn.execute(
            &format!("DELETE FROM spans WHERE trace_id IN ({placeholders})"),
            params_from_iter(trace_ids.iter()),
        )
        .map_err(|e| TracekeepError::StorageWrite(format!("remove trace spans failed: {e}")))
    }
}
