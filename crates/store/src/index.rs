//! Incrementally maintained trace summaries.
//!
//! Each trace id owns a slot whose mutex serializes folds of that trace;
//! folds of different traces only share the storage connection. A gate
//! (read side for folds and reads, write side for rebuild, verify and
//! purge) keeps the bulk operations from interleaving with single folds.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::DashMap;
use tracekeep_core::error::{Result, TracekeepError};
use tracekeep_core::model::span::SpanRecord;
use tracekeep_core::model::trace::{TraceSummary, fold, replay, sort_newest_first};
use tracekeep_core::query::{IndexReport, PurgeReport};
use tracing::{info, warn};

use crate::log::SpanLog;
use crate::summaries::SummaryStore;

type Slot = Arc<Mutex<Option<TraceSummary>>>;

#[derive(Clone)]
pub struct TraceIndex {
    inner: Arc<Inner>,
}

struct Inner {
    log: Arc<dyn SpanLog>,
    summaries: Arc<dyn SummaryStore>,
    slots: DashMap<String, Slot>,
    gate: RwLock<()>,
}

impl TraceIndex {
    /// Loads the persisted index as-is, unless the corruption flag asks for a
    /// rebuild from the log.
    pub fn open(log: Arc<dyn SpanLog>, summaries: Arc<dyn SummaryStore>) -> Result<Self> {
        let index = Self {
            inner: Arc::new(Inner {
                log,
                summaries,
                slots: DashMap::new(),
                gate: RwLock::new(()),
            }),
        };

        if index.inner.summaries.needs_rebuild()? {
            warn!("trace index flagged for rebuild");
            index.rebuild()?;
        } else {
            for summary in index.inner.summaries.load_summaries()? {
                index
                    .inner
                    .slots
                    .insert(summary.trace_id.clone(), Arc::new(Mutex::new(Some(summary))));
            }
        }
        Ok(index)
    }

    /// Appends one span to the log and folds it into its trace. The trace's
    /// slot is held across both steps, so folds of a trace run in log order
    /// and a replay of the log reproduces the same summary. The in-memory
    /// copy is only replaced once the summary write succeeded.
    pub fn record(&self, span: &SpanRecord) -> Result<TraceSummary> {
        let _gate = self.read_gate();
        let slot = self.slot(&span.trace_id);
        let mut current = slot.lock().unwrap_or_else(PoisonError::into_inner);

        self.inner.log.append(span)?;
        let next = fold(current.as_ref(), span);
        if let Err(err) = self.inner.summaries.put_summary(&next) {
            // The log now holds a span the index does not reflect.
            if let Err(flag_err) = self.inner.summaries.set_needs_rebuild(true) {
                warn!(error = ?flag_err, "failed to flag trace index for rebuild");
            }
            return Err(err);
        }

        *current = Some(next.clone());
        Ok(next)
    }

    pub fn get(&self, trace_id: &str) -> Option<TraceSummary> {
        let _gate = self.read_gate();
        let slot = self.inner.slots.get(trace_id).map(|s| Arc::clone(s.value()))?;
        let current = slot.lock().unwrap_or_else(PoisonError::into_inner);
        current.clone()
    }

    /// All summaries, most recent trace first.
    pub fn list(&self) -> Result<Vec<TraceSummary>> {
        let _gate = self.read_gate();
        let mut summaries = self.inner.summaries.load_summaries()?;
        sort_newest_first(&mut summaries);
        Ok(summaries)
    }

    pub fn spans_for_trace(&self, trace_id: &str) -> Result<Vec<SpanRecord>> {
        let _gate = self.read_gate();
        self.inner.log.spans_for_trace(trace_id)
    }

    /// Discards the persisted index and replays the whole log through the
    /// same fold. The flag stays set until the new index is fully written,
    /// so an interrupted rebuild is retried on the next open.
    pub fn rebuild(&self) -> Result<IndexReport> {
        let _gate = self.write_gate();
        self.rebuild_locked()
    }

    /// Compares per-trace span counts in the log against the index.
    pub fn verify(&self) -> Result<IndexReport> {
        let _gate = self.write_gate();
        self.verify_locked()
    }

    /// Verifies the index and rebuilds it on corruption or when a failed
    /// write left the rebuild flag set.
    pub fn repair(&self) -> Result<IndexReport> {
        let _gate = self.write_gate();
        if self.inner.summaries.needs_rebuild()? {
            warn!("trace index flagged for rebuild");
            return self.rebuild_locked();
        }
        match self.verify_locked() {
            Err(TracekeepError::IndexCorruption(detail)) => {
                warn!(%detail, "trace index corrupted, rebuilding");
                self.rebuild_locked()
            }
            other => other,
        }
    }

    /// Drops every trace correlated with `session_id`, spans included.
    pub fn purge_session(&self, session_id: &str) -> Result<PurgeReport> {
        let _gate = self.write_gate();
        let trace_ids = self
            .inner
            .summaries
            .load_summaries()?
            .into_iter()
            .filter(|s| s.session_id.as_deref() == Some(session_id))
            .map(|s| s.trace_id)
            .collect::<Vec<_>>();

        let spans_removed = self.inner.log.remove_traces(&trace_ids)?;
        if let Err(err) = self.inner.summaries.remove_summaries(&trace_ids) {
            if let Err(flag_err) = self.inner.summaries.set_needs_rebuild(true) {
                warn!(error = ?flag_err, "failed to flag trace index for rebuild");
            }
            return Err(err);
        }
        for trace_id in &trace_ids {
            self.inner.slots.remove(trace_id);
        }

        info!(
            session_id,
            traces = trace_ids.len(),
            spans = spans_removed,
            "purged session traces"
        );
        Ok(PurgeReport {
            session_id: session_id.to_string(),
            traces_removed: trace_ids.len(),
            spans_removed,
        })
    }

    fn rebuild_locked(&self) -> Result<IndexReport> {
        self.inner.summaries.set_needs_rebuild(true)?;
        let spans = self.inner.log.all_spans()?;
        let rebuilt = replay(spans.iter());
        let mut summaries = rebuilt.into_values().collect::<Vec<_>>();
        sort_newest_first(&mut summaries);

        self.inner.summaries.clear_summaries()?;
        self.inner.summaries.put_summaries(&summaries)?;

        self.inner.slots.clear();
        for summary in &summaries {
            self.inner.slots.insert(
                summary.trace_id.clone(),
                Arc::new(Mutex::new(Some(summary.clone()))),
            );
        }
        self.inner.summaries.set_needs_rebuild(false)?;

        info!(
            traces = summaries.len(),
            spans = spans.len(),
            "trace index rebuilt"
        );
        Ok(IndexReport {
            traces: summaries.len(),
            spans: spans.len() as u64,
            mismatched: Vec::new(),
            rebuilt: true,
        })
    }

    fn verify_locked(&self) -> Result<IndexReport> {
        let counts = self.inner.log.span_counts()?;
        let summaries = self.inner.summaries.load_summaries()?;

        let mut mismatched = Vec::new();
        let mut seen = HashSet::new();
        for summary in &summaries {
            seen.insert(summary.trace_id.as_str());
            let logged = counts.get(&summary.trace_id).copied().unwrap_or(0);
            if logged != summary.span_count {
                mismatched.push(summary.trace_id.clone());
            }
        }
        for trace_id in counts.keys() {
            if !seen.contains(trace_id.as_str()) {
                mismatched.push(trace_id.clone());
            }
        }
        mismatched.sort();

        if !mismatched.is_empty() {
            return Err(TracekeepError::IndexCorruption(format!(
                "{} trace(s) disagree with the span log: {}",
                mismatched.len(),
                mismatched.join(", ")
            )));
        }

        Ok(IndexReport {
            traces: summaries.len(),
            spans: counts.values().sum(),
            mismatched,
            rebuilt: false,
        })
    }

    fn slot(&self, trace_id: &str) -> Slot {
        if let Some(slot) = self.inner.slots.get(trace_id) {
            return Arc::clone(slot.value());
        }
        let entry = self.inner.slots.entry(trace_id.to_string()).or_default();
        Arc::clone(entry.value())
    }

    fn read_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.inner.gate.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_gate(&self) -> RwLockWriteGuard<'_, ()> {
        self.inner.gate.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use serde_json::json;
    use testkit::span_at;

    use super::*;
    use crate::Store;

    fn open(store: &Store) -> TraceIndex {
        TraceIndex::open(Arc::new(store.clone()), Arc::new(store.clone())).unwrap()
    }

    fn record(index: &TraceIndex, span: &SpanRecord) -> TraceSummary {
        index.record(span).unwrap()
    }

    #[test]
    fn folds_example_scenario() {
        let store = Store::open_in_memory().unwrap();
        let index = open(&store);
        let outer = span_at("T1", "S1", None, "outer", 10, 20);
        let inner = span_at("T1", "S2", Some("S1"), "inner", 12, 15);
        record(&index, &outer);
        let summary = record(&index, &inner);

        assert_eq!(summary.root_span_name, "outer");
        assert_eq!(summary.start_time, outer.start_time);
        assert_eq!(summary.end_time, outer.end_time);
        assert_eq!(summary.span_count, 2);

        let listed = index.list().unwrap();
        assert_eq!(listed, vec![summary.clone()]);
        assert_eq!(index.get("T1"), Some(summary));
    }

    #[test]
    fn list_is_newest_first() {
        let store = Store::open_in_memory().unwrap();
        let index = open(&store);
        record(&index, &span_at("old", "a", None, "a", 1, 2));
        record(&index, &span_at("new", "b", None, "b", 50, 60));
        record(&index, &span_at("mid", "c", None, "c", 20, 30));
        let ids = index
            .list()
            .unwrap()
            .into_iter()
            .map(|s| s.trace_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[test]
    fn reopen_trusts_persisted_index() {
        let store = Store::open_in_memory().unwrap();
        let index = open(&store);
        let mut span = span_at("T1", "S1", None, "chat", 1, 2);
        span.attributes.insert("session.id".into(), json!("s-1"));
        record(&index, &span);
        drop(index);

        let reopened = open(&store);
        let summary = reopened.get("T1").unwrap();
        assert_eq!(summary.session_id.as_deref(), Some("s-1"));
        let next = record(&reopened, &span_at("T1", "S2", None, "tool", 3, 4));
        assert_eq!(next.span_count, 2);
        assert_eq!(next.session_id.as_deref(), Some("s-1"));
    }

    #[test]
    fn rebuild_matches_incremental_index() {
        let store = Store::open_in_memory().unwrap();
        let index = open(&store);
        let spans = vec![
            span_at("T1", "S2", Some("S1"), "inner", 12, 15),
            span_at("T2", "X1", None, "other", 3, 40),
            span_at("T1", "S1", None, "outer", 10, 20),
            span_at("T2", "X2", Some("X1"), "llm.call", 5, 41),
        ];
        for span in &spans {
            record(&index, span);
        }
        let incremental = index.list().unwrap();

        let report = index.rebuild().unwrap();
        assert!(report.rebuilt);
        assert_eq!(report.traces, 2);
        assert_eq!(report.spans, 4);
        assert_eq!(index.list().unwrap(), incremental);
        assert_eq!(index.get("T1"), incremental.iter().find(|s| s.trace_id == "T1").cloned());
        assert!(!store.needs_rebuild().unwrap());
    }

    #[test]
    fn verify_detects_and_repair_fixes_drift() {
        let store = Store::open_in_memory().unwrap();
        let index = open(&store);
        record(&index, &span_at("T1", "S1", None, "outer", 10, 20));
        assert!(index.verify().is_ok());

        // A span that reached the log without being folded.
        store.append(&span_at("T1", "S2", None, "inner", 12, 13)).unwrap();
        assert!(matches!(
            index.verify(),
            Err(TracekeepError::IndexCorruption(_))
        ));

        let report = index.repair().unwrap();
        assert!(report.rebuilt);
        assert_eq!(index.get("T1").unwrap().span_count, 2);
        let clean = index.repair().unwrap();
        assert!(!clean.rebuilt);
    }

    #[test]
    fn open_rebuilds_when_flagged() {
        let store = Store::open_in_memory().unwrap();
        store.append(&span_at("T9", "S1", None, "orphan", 1, 2)).unwrap();
        store.set_needs_rebuild(true).unwrap();

        let index = open(&store);
        assert_eq!(index.get("T9").unwrap().span_count, 1);
        assert!(!store.needs_rebuild().unwrap());
    }

    #[test]
    fn purge_session_removes_correlated_traces() {
        let store = Store::open_in_memory().unwrap();
        let index = open(&store);
        let mut tagged = span_at("T1", "S1", None, "chat", 1, 2);
        tagged.attributes.insert("session.id".into(), json!("s-1"));
        record(&index, &tagged);
        record(&index, &span_at("T1", "S2", None, "tool", 2, 3));
        record(&index, &span_at("T2", "S1", None, "chat", 5, 6));

        let report = index.purge_session("s-1").unwrap();
        assert_eq!(report.traces_removed, 1);
        assert_eq!(report.spans_removed, 2);
        assert!(index.get("T1").is_none());
        assert!(index.spans_for_trace("T1").unwrap().is_empty());
        assert_eq!(index.list().unwrap().len(), 1);
        assert!(index.verify().is_ok());
    }

    #[test]
    fn concurrent_folds_keep_counts_exact() {
        let store = Store::open_in_memory().unwrap();
        let index = open(&store);
        let mut handles = Vec::new();
        for worker in 0..4 {
            let index = index.clone();
            handles.push(thread::spawn(move || {
                for i in 0..25 {
                    let trace = if i % 2 == 0 { "shared" } else { "other" };
                    let start = worker * 100 + i;
                    let span_id = format!("w{worker}-{i}");
                    let span = span_at(trace, &span_id, None, "op", start, start + 1);
                    index.record(&span).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let shared = index.get("shared").unwrap();
        let other = index.get("other").unwrap();
        assert_eq!(shared.span_count + other.span_count, 100);
        assert_eq!(shared.span_count, 52);
        assert_eq!(shared.root_span_name, "op");
        assert!(index.verify().is_ok());
    }

    #[test]
    fn concurrent_folds_match_a_rebuild() {
        let store = Store::open_in_memory().unwrap();
        let index = open(&store);
        let mut handles = Vec::new();
        for worker in 0..4 {
            let index = index.clone();
            handles.push(thread::spawn(move || {
                for i in 0..20 {
                    let span_id = format!("w{worker}-{i}");
                    let name = format!("op-{worker}");
                    let mut span = span_at("T1", &span_id, None, &name, 5, 6);
                    span.attributes.insert("session.id".into(), json!(format!("sess-{worker}")));
                    index.record(&span).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let incremental = index.get("T1").unwrap();
        assert_eq!(incremental.span_count, 80);
        assert_eq!(incremental.root_span_name, "op-0");

        index.rebuild().unwrap();
        assert_eq!(index.get("T1"), Some(incremental));
    }

    #[test]
    fn get_never_sees_a_half_rebuilt_index() {
        let store = Store::open_in_memory().unwrap();
        let index = open(&store);
        record(&index, &span_at("T1", "S1", None, "outer", 10, 20));

        let rebuilder = {
            let index = index.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    index.rebuild().unwrap();
                }
            })
        };
        while !rebuilder.is_finished() {
            assert_eq!(index.get("T1").map(|s| s.span_count), Some(1));
        }
        rebuilder.join().unwrap();
    }
}
