use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::span::{
    CONVERSATION_ID_ATTR, SESSION_ID_ATTR, SESSION_TITLE_ATTR, SpanRecord,
};

/// Aggregate view of every span folded into one trace so far. The time
/// window and count only ever widen.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TraceSummary {
    pub trace_id: String,
    pub root_span_name: String,
    pub session_id: Option<String>,
    pub session_title: Option<String>,
    pub conversation_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub span_count: u64,
}

impl TraceSummary {
    pub fn seed(span: &SpanRecord) -> Self {
        Self {
            trace_id: span.trace_id.clone(),
            root_span_name: span.name.clone(),
            session_id: span.attr_str(SESSION_ID_ATTR),
            session_title: span.attr_str(SESSION_TITLE_ATTR),
            conversation_id: span.attr_str(CONVERSATION_ID_ATTR),
            start_time: span.start_time,
            end_time: span.end_time,
            span_count: 1,
        }
    }

    /// Folds one more span of the same trace into the aggregate. The span
    /// with the earliest start names the trace, regardless of parentage;
    /// equal starts go to the lexically smaller name.
    pub fn absorb(&mut self, span: &SpanRecord) {
        debug_assert_eq!(self.trace_id, span.trace_id);
        self.span_count += 1;
        if (span.start_time, span.name.as_str()) < (self.start_time, self.root_span_name.as_str()) {
            self.start_time = span.start_time;
            self.root_span_name = span.name.clone();
        }
        if span.end_time > self.end_time {
            self.end_time = span.end_time;
        }
        if self.session_id.is_none() {
            self.session_id = span.attr_str(SESSION_ID_ATTR);
        }
        if self.session_title.is_none() {
            self.session_title = span.attr_str(SESSION_TITLE_ATTR);
        }
        if self.conversation_id.is_none() {
            self.conversation_id = span.attr_str(CONVERSATION_ID_ATTR);
        }
    }

    pub fn duration_ms(&self) -> i64 {
        (self.end_time - self.start_time).num_milliseconds().max(0)
    }
}

/// Produces the successor of `current` without touching it, so a caller can
/// persist the new value before publishing it.
pub fn fold(current: Option<&TraceSummary>, span: &SpanRecord) -> TraceSummary {
    match current {
        None => TraceSummary::seed(span),
        Some(existing) => {
            let mut next = existing.clone();
            next.absorb(span);
            next
        }
    }
}

/// Rebuilds every summary from scratch by folding spans in the given order.
pub fn replay<'a, I>(spans: I) -> HashMap<String, TraceSummary>
where
    I: IntoIterator<Item = &'a SpanRecord>,
{
    let mut out: HashMap<String, TraceSummary> = HashMap::new();
    for span in spans {
        match out.get_mut(&span.trace_id) {
            Some(summary) => summary.absorb(span),
            None => {
                out.insert(span.trace_id.clone(), TraceSummary::seed(span));
            }
        }
    }
    out
}

/// Newest trace first; equal starts fall back to trace id.
pub fn sort_newest_first(summaries: &mut [TraceSummary]) {
    summaries.sort_by(|a, b| {
        b.start_time
            .cmp(&a.start_time)
            .then_with(|| a.trace_id.cmp(&b.trace_id))
    });
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: String,
    pub title: Option<String>,
    pub first_trace_at: DateTime<Utc>,
    pub last_trace_at: DateTime<Utc>,
    pub trace_count: usize,
}

/// Groups trace summaries by their session correlation key. Traces without
/// a session are left out.
pub fn group_sessions(summaries: &[TraceSummary]) -> Vec<SessionSummary> {
    let mut sessions: HashMap<&str, SessionSummary> = HashMap::new();
    for trace in summaries {
        let Some(session_id) = trace.session_id.as_deref() else {
            continue;
        };
        let entry = sessions
            .entry(session_id)
            .or_insert_with(|| SessionSummary {
                session_id: session_id.to_string(),
                title: None,
                first_trace_at: trace.start_time,
                last_trace_at: trace.start_time,
                trace_count: 0,
            });
        entry.trace_count += 1;
        entry.first_trace_at = entry.first_trace_at.min(trace.start_time);
        entry.last_trace_at = entry.last_trace_at.max(trace.start_time);
        if entry.title.is_none() {
            entry.title = trace.session_title.clone();
        }
    }

    let mut out = sessions.into_values().collect::<Vec<_>>();
    out.sort_by(|a, b| {
        b.last_trace_at
            .cmp(&a.last_trace_at)
            .then_with(|| a.session_id.cmp(&b.session_id))
    });
    out
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    use super::*;
    use crate::model::span::{Attributes, SpanKind};

    fn span(id: &str, name: &str, start: i64, end: i64) -> SpanRecord {
        let base = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        SpanRecord {
            trace_id: "T1".into(),
            span_id: id.into(),
            parent_span_id: None,
            service: "api".into(),
            name: name.into(),
            start_time: base + Duration::seconds(start),
            end_time: base + Duration::seconds(end),
            status_code: "OK".into(),
            status_message: None,
            attributes: Attributes::new(),
            events: Vec::new(),
            kind: SpanKind::Internal,
        }
    }

    fn fold_all(spans: &[&SpanRecord]) -> TraceSummary {
        let mut current: Option<TraceSummary> = None;
        for s in spans {
            current = Some(fold(current.as_ref(), s));
        }
        current.unwrap()
    }

    #[test]
    fn folds_example_batch() {
        let outer = span("S1", "outer", 10, 20);
        let inner = span("S2", "inner", 12, 15);
        let summary = fold_all(&[&outer, &inner]);
        assert_eq!(summary.root_span_name, "outer");
        assert_eq!(summary.start_time, outer.start_time);
        assert_eq!(summary.end_time, outer.end_time);
        assert_eq!(summary.span_count, 2);
    }

    #[test]
    fn fold_is_order_independent() {
        let a = span("a", "a", 5, 30);
        let b = span("b", "b", 2, 8);
        let c = span("c", "c", 9, 40);
        let orders: [[&SpanRecord; 3]; 6] = [
            [&a, &b, &c],
            [&a, &c, &b],
            [&b, &a, &c],
            [&b, &c, &a],
            [&c, &a, &b],
            [&c, &b, &a],
        ];
        let expected = fold_all(&orders[0]);
        for order in &orders {
            assert_eq!(fold_all(order), expected);
        }
        assert_eq!(expected.root_span_name, "b");
        assert_eq!(expected.start_time, b.start_time);
        assert_eq!(expected.end_time, c.end_time);
        assert_eq!(expected.span_count, 3);
    }

    #[test]
    fn equal_starts_name_trace_the_same_in_any_order() {
        let first = span("a", "append-first", 5, 6);
        let second = span("b", "append-second", 5, 7);
        let late = span("c", "late", 8, 9);
        let orders: [[&SpanRecord; 3]; 6] = [
            [&first, &second, &late],
            [&first, &late, &second],
            [&second, &first, &late],
            [&second, &late, &first],
            [&late, &first, &second],
            [&late, &second, &first],
        ];
        let expected = fold_all(&orders[0]);
        for order in &orders {
            assert_eq!(fold_all(order), expected);
        }
        assert_eq!(expected.root_span_name, "append-first");
        assert_eq!(expected.end_time, late.end_time);
    }

    #[test]
    fn earliest_start_names_trace_even_when_last() {
        let child = span("child", "child", 3, 4);
        let parent = span("parent", "parent", 1, 9);
        let mut late_child = span("skewed", "skewed-child", 0, 2);
        late_child.parent_span_id = Some("parent".into());

        let summary = fold_all(&[&child, &parent, &late_child]);
        assert_eq!(summary.root_span_name, "skewed-child");
    }

    #[test]
    fn correlation_keys_stick() {
        let mut first = span("a", "a", 1, 2);
        first
            .attributes
            .insert(SESSION_ID_ATTR.into(), json!("sess-1"));
        let mut second = span("b", "b", 3, 4);
        second
            .attributes
            .insert(CONVERSATION_ID_ATTR.into(), json!("conv-9"));
        second
            .attributes
            .insert(SESSION_ID_ATTR.into(), json!("sess-2"));
        let bare = span("c", "c", 5, 6);

        let summary = fold_all(&[&first, &second, &bare]);
        assert_eq!(summary.session_id.as_deref(), Some("sess-1"));
        assert_eq!(summary.conversation_id.as_deref(), Some("conv-9"));
    }

    #[test]
    fn fold_leaves_input_untouched() {
        let a = span("a", "a", 5, 6);
        let b = span("b", "b", 1, 9);
        let before = TraceSummary::seed(&a);
        let after = fold(Some(&before), &b);
        assert_eq!(before.span_count, 1);
        assert_eq!(after.span_count, 2);
    }

    #[test]
    fn replay_matches_incremental_fold() {
        let a = span("a", "a", 5, 30);
        let b = span("b", "b", 2, 8);
        let mut other = span("x", "x", 1, 2);
        other.trace_id = "T2".into();
        let replayed = replay([&a, &other, &b]);
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed["T1"], fold_all(&[&a, &b]));
        assert_eq!(replayed["T2"].span_count, 1);
    }

    #[test]
    fn sorts_newest_first_with_id_ties() {
        let mut a = TraceSummary::seed(&span("a", "a", 1, 2));
        a.trace_id = "b-trace".into();
        let mut b = TraceSummary::seed(&span("b", "b", 1, 2));
        b.trace_id = "a-trace".into();
        let c = TraceSummary::seed(&span("c", "c", 7, 8));
        let mut all = vec![a, b, c];
        sort_newest_first(&mut all);
        let ids = all.iter().map(|s| s.trace_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["T1", "a-trace", "b-trace"]);
    }

    #[test]
    fn groups_sessions() {
        let mut t1 = TraceSummary::seed(&span("a", "a", 1, 2));
        t1.session_id = Some("s1".into());
        t1.session_title = Some("Trip planning".into());
        let mut t2 = TraceSummary::seed(&span("b", "b", 10, 12));
        t2.trace_id = "T2".into();
        t2.session_id = Some("s1".into());
        let mut t3 = TraceSummary::seed(&span("c", "c", 20, 21));
        t3.trace_id = "T3".into();
        t3.session_id = Some("s2".into());
        let loose = TraceSummary::seed(&span("d", "d", 30, 31));

        let sessions = group_sessions(&[t1.clone(), t2.clone(), t3, loose]);
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id, "s2");
        assert_eq!(sessions[1].trace_count, 2);
        assert_eq!(sessions[1].first_trace_at, t1.start_time);
        assert_eq!(sessions[1].last_trace_at, t2.start_time);
        assert_eq!(sessions[1].title.as_deref(), Some("Trip planning"));
    }
}
