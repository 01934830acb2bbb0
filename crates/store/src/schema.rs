pub const SCHEMA_SQL: &str = r#"
CREATE SEQUENCE IF NOT EXISTS span_seq;

CREATE TABLE IF NOT EXISTS spans (
  seq BIGINT PRIMARY KEY,
  trace_id TEXT NOT NULL,
  span_id TEXT NOT NULL,
  parent_span_id TEXT,
  service TEXT NOT NULL,
  name TEXT NOT NULL,
  start_ts TIMESTAMP NOT NULL,
  end_ts TIMESTAMP NOT NULL,
  status_code TEXT NOT NULL,
  status_message TEXT,
  kind TEXT NOT NULL,
  attrs_json TEXT NOT NULL,
  events_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS traces (
  trace_id TEXT PRIMARY KEY,
  root_span_name TEXT NOT NULL,
  session_id TEXT,
  session_title TEXT,
  conversation_id TEXT,
  start_ts TIMESTAMP NOT NULL,
  end_ts TIMESTAMP NOT NULL,
  span_count BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS index_meta (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_spans_trace ON spans(trace_id);
"#;
