use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tracekeep_core::error::{Result, TracekeepError};
use tracekeep_core::model::span::SpanRecord;
use tracekeep_core::model::trace::{SessionSummary, TraceSummary, group_sessions};
use tracekeep_core::query::{
    IndexReport, PurgeReport, StatusResponse, TraceRequest, TraceResponse, TracesRequest,
};

use crate::Store;
use crate::index::TraceIndex;

/// Async read facade over the blocking store. Reads run on the blocking
/// pool and may carry a timeout; a timed-out read is abandoned, not undone,
/// which is safe because reads have no side effects.
#[derive(Clone)]
pub struct QueryService {
    index: TraceIndex,
    store: Store,
    default_timeout: Option<Duration>,
}

impl QueryService {
    pub fn new(index: TraceIndex, store: Store) -> Self {
        Self {
            index,
            store,
            default_timeout: None,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn index(&self) -> &TraceIndex {
        &self.index
    }

    /// Trace summaries, newest first, optionally narrowed by correlation key.
    pub async fn list_traces(
        &self,
        req: TracesRequest,
        timeout: Option<Duration>,
    ) -> Result<Vec<TraceSummary>> {
        let index = self.index.clone();
        self.read(timeout, move || {
            let mut traces = index
                .list()?
                .into_iter()
                .filter(|s| req.matches(s))
                .collect::<Vec<_>>();
            if let Some(limit) = req.limit {
                traces.truncate(limit);
            }
            Ok(traces)
        })
        .await
    }

    /// Spans of one trace by start time. Unknown traces yield an empty list.
    pub async fn get_trace_spans(
        &self,
        trace_id: &str,
        timeout: Option<Duration>,
    ) -> Result<Vec<SpanRecord>> {
        let index = self.index.clone();
        let trace_id = trace_id.to_string();
        self.read(timeout, move || index.spans_for_trace(&trace_id))
            .await
    }

    pub async fn get_trace(
        &self,
        req: TraceRequest,
        timeout: Option<Duration>,
    ) -> Result<TraceResponse> {
        let index = self.index.clone();
        self.read(timeout, move || {
            let spans = index.spans_for_trace(&req.trace_id)?;
            let spans = match &req.root_span_id {
                Some(root) => subtree(spans, root),
                None => spans,
            };
            Ok(TraceResponse {
                summary: index.get(&req.trace_id),
                trace_id: req.trace_id,
                spans,
            })
        })
        .await
    }

    pub async fn list_sessions(&self, timeout: Option<Duration>) -> Result<Vec<SessionSummary>> {
        let index = self.index.clone();
        self.read(timeout, move || Ok(group_sessions(&index.list()?)))
            .await
    }

    pub async fn status(&self, timeout: Option<Duration>) -> Result<StatusResponse> {
        let store = self.store.clone();
        self.read(timeout, move || store.status()).await
    }

    pub async fn repair(&self) -> Result<IndexReport> {
        let index = self.index.clone();
        blocking(move || index.repair()).await
    }

    pub async fn purge_session(&self, session_id: &str) -> Result<PurgeReport> {
        let index = self.index.clone();
        let session_id = session_id.to_string();
        blocking(move || index.purge_session(&session_id)).await
    }

    async fn read<T, F>(&self, timeout: Option<Duration>, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        match timeout.or(self.default_timeout) {
            Some(limit) => tokio::time::timeout(limit, blocking(f))
                .await
                .map_err(|_| {
                    TracekeepError::Timeout(format!("query exceeded {}ms", limit.as_millis()))
                })?,
            None => blocking(f).await,
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TracekeepError::Internal(format!("query task failed: {e}")))?
}

/// Spans reachable from `root` through parent links, by start time.
fn subtree(spans: Vec<SpanRecord>, root: &str) -> Vec<SpanRecord> {
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    for span in &spans {
        if let Some(parent) = span.parent_span_id.as_deref() {
            children.entry(parent).or_default().push(&span.span_id);
        }
    }

    let mut keep = HashSet::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        if keep.insert(id)
            && let Some(next) = children.get(id)
        {
            stack.extend(next.iter().copied());
        }
    }

    let keep = keep.into_iter().map(str::to_string).collect::<HashSet<_>>();
    spans
        .into_iter()
        .filter(|s| keep.contains(&s.span_id))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use testkit::span_at;

    use super::*;
    use crate::log::SpanLog;

    fn service() -> QueryService {
        let store = Store::open_in_memory().unwrap();
        let index = TraceIndex::open(Arc::new(store.clone()), Arc::new(store.clone())).unwrap();
        QueryService::new(index, store)
    }

    fn record(service: &QueryService, span: SpanRecord) {
        let index = service.index();
        index.record(&span).unwrap();
    }

    #[tokio::test]
    async fn example_batch_reads_back() {
        let service = service();
        record(&service, span_at("T1", "S1", None, "outer", 10, 20));
        record(&service, span_at("T1", "S2", Some("S1"), "inner", 12, 15));

        let traces = service
            .list_traces(TracesRequest::default(), None)
            .await
            .unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].root_span_name, "outer");
        assert_eq!(traces[0].span_count, 2);

        let spans = service.get_trace_spans("T1", None).await.unwrap();
        let ids = spans.iter().map(|s| s.span_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["S1", "S2"]);
    }

    #[tokio::test]
    async fn unknown_trace_is_empty_not_error() {
        let service = service();
        assert!(service.get_trace_spans("nonexistent", None).await.unwrap().is_empty());
        let trace = service
            .get_trace(
                TraceRequest {
                    trace_id: "nonexistent".into(),
                    root_span_id: None,
                },
                None,
            )
            .await
            .unwrap();
        assert!(trace.summary.is_none());
        assert!(trace.spans.is_empty());
    }

    #[tokio::test]
    async fn filters_by_session_and_limit() {
        let service = service();
        for (trace, start) in [("T1", 1), ("T2", 5), ("T3", 9)] {
            let mut span = span_at(trace, "root", None, "chat", start, start + 1);
            if trace != "T2" {
                span.attributes.insert("session.id".into(), json!("s-1"));
            }
            record(&service, span);
        }

        let req = TracesRequest {
            session_id: Some("s-1".into()),
            limit: Some(1),
            ..TracesRequest::default()
        };
        let traces = service.list_traces(req, None).await.unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].trace_id, "T3");

        let sessions = service.list_sessions(None).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].trace_count, 2);
    }

    #[tokio::test]
    async fn get_trace_filters_subtree() {
        let service = service();
        record(&service, span_at("T1", "root", None, "root", 0, 10));
        record(&service, span_at("T1", "a", Some("root"), "a", 1, 5));
        record(&service, span_at("T1", "a1", Some("a"), "a1", 2, 3));
        record(&service, span_at("T1", "b", Some("root"), "b", 6, 9));

        let trace = service
            .get_trace(
                TraceRequest {
                    trace_id: "T1".into(),
                    root_span_id: Some("a".into()),
                },
                None,
            )
            .await
            .unwrap();
        let ids = trace.spans.iter().map(|s| s.span_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["a", "a1"]);
        assert_eq!(trace.summary.unwrap().span_count, 4);
    }

    #[tokio::test]
    async fn slow_read_times_out() {
        let service = service().with_default_timeout(Some(Duration::from_millis(20)));
        let err = service
            .read(None, || {
                std::thread::sleep(Duration::from_millis(300));
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TracekeepError::Timeout(_)));

        let ok = service
            .read(Some(Duration::from_secs(5)), || Ok(7))
            .await
            .unwrap();
        assert_eq!(ok, 7);
    }

    #[tokio::test]
    async fn purge_and_repair_go_through_the_index() {
        let service = service();
        let mut span = span_at("T1", "S1", None, "chat", 1, 2);
        span.attributes.insert("session.id".into(), json!("s-1"));
        record(&service, span);

        let report = service.purge_session("s-1").await.unwrap();
        assert_eq!(report.traces_removed, 1);
        let repaired = service.repair().await.unwrap();
        assert!(!repaired.rebuilt);
        let status = service.status(None).await.unwrap();
        assert_eq!(status.traces_count, 0);
        assert_eq!(status.spans_count, 0);
    }
}
