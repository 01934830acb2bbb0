use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::span::SpanRecord;
use crate::model::trace::{SessionSummary, TraceSummary};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TracesRequest {
    pub session_id: Option<String>,
    pub conversation_id: Option<String>,
    pub limit: Option<usize>,
}

impl TracesRequest {
    pub fn matches(&self, summary: &TraceSummary) -> bool {
        if let Some(session) = &self.session_id
            && summary.session_id.as_ref() != Some(session)
        {
            return false;
        }
        if let Some(conversation) = &self.conversation_id
            && summary.conversation_id.as_ref() != Some(conversation)
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRequest {
    pub trace_id: String,
    pub root_span_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceResponse {
    pub trace_id: String,
    pub summary: Option<TraceSummary>,
    pub spans: Vec<SpanRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeSessionRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub session_id: String,
    pub traces_removed: usize,
    pub spans_removed: usize,
}

/// Outcome of one `ingest` call. Rejected spans failed validation, failed
/// spans hit a storage error.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub received: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct IndexReport {
    pub traces: usize,
    pub spans: u64,
    pub mismatched: Vec<String>,
    pub rebuilt: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub db_path: String,
    pub db_size_bytes: u64,
    pub spans_count: usize,
    pub traces_count: usize,
    pub sessions_count: usize,
    pub oldest_start: Option<DateTime<Utc>>,
    pub newest_start: Option<DateTime<Utc>>,
    pub needs_rebuild: bool,
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn summary(session: Option<&str>, conversation: Option<&str>) -> TraceSummary {
        let ts = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        TraceSummary {
            trace_id: "T1".into(),
            root_span_name: "chat".into(),
            session_id: session.map(str::to_string),
            session_title: None,
            conversation_id: conversation.map(str::to_string),
            start_time: ts,
            end_time: ts,
            span_count: 1,
        }
    }

    #[test]
    fn traces_request_filters_by_correlation() {
        let req = TracesRequest {
            session_id: Some("s1".into()),
            ..TracesRequest::default()
        };
        assert!(req.matches(&summary(Some("s1"), None)));
        assert!(!req.matches(&summary(Some("s2"), None)));
        assert!(!req.matches(&summary(None, Some("c1"))));
        assert!(TracesRequest::default().matches(&summary(None, None)));
    }
}
