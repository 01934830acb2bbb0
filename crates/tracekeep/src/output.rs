use std::collections::HashMap;
use std::io::IsTerminal;

use chrono::{DateTime, SecondsFormat, Utc};
use owo_colors::OwoColorize;
use tracekeep_core::model::span::SpanRecord;
use tracekeep_core::model::trace::TraceSummary;
use tracekeep_core::query::{
    IndexReport, PurgeReport, SessionsResponse, StatusResponse, TraceResponse,
};

pub fn print_traces_human(v: &[TraceSummary]) {
    for item in v {
        let mut line = format!(
            "{} trace={} duration={}ms spans={} root=\"{}\"",
            ts(item.start_time),
            item.trace_id,
            item.duration_ms(),
            item.span_count,
            item.root_span_name
        );
        if let Some(session) = &item.session_id {
            line.push_str(&format!(" session={session}"));
        }
        if let Some(conversation) = &item.conversation_id {
            line.push_str(&format!(" conversation={conversation}"));
        }
        println!("{line}");
    }
    println!("-- {} traces --", v.len());
}

pub fn print_trace_human(v: &TraceResponse) {
    let errors = v.spans.iter().filter(|s| s.status_code == "ERROR").count();
    match &v.summary {
        Some(summary) => println!(
            "TRACE {} root=\"{}\" duration={}ms spans={} errors={}",
            v.trace_id,
            summary.root_span_name,
            summary.duration_ms(),
            summary.span_count,
            errors
        ),
        None => println!("TRACE {} spans={} errors={}", v.trace_id, v.spans.len(), errors),
    }
    if let Some(session) = v.summary.as_ref().and_then(|s| s.session_id.as_deref()) {
        let title = v
            .summary
            .as_ref()
            .and_then(|s| s.session_title.as_deref())
            .unwrap_or("-");
        println!("session={session} title=\"{title}\"");
    }

    print_span_tree(&v.spans);
}

pub fn print_sessions_human(v: &SessionsResponse) {
    for s in &v.sessions {
        println!(
            "session={} traces={} first={} last={} title=\"{}\"",
            s.session_id,
            s.trace_count,
            ts(s.first_trace_at),
            ts(s.last_trace_at),
            s.title.as_deref().unwrap_or("-")
        );
    }
    println!("-- {} sessions --", v.sessions.len());
}

pub fn print_status_human(v: &StatusResponse) {
    println!("db_path={}", v.db_path);
    println!("db_size_bytes={}", v.db_size_bytes);
    println!(
        "spans={} traces={} sessions={}",
        v.spans_count, v.traces_count, v.sessions_count
    );
    if let Some(oldest) = v.oldest_start {
        println!("oldest={}", ts(oldest));
    }
    if let Some(newest) = v.newest_start {
        println!("newest={}", ts(newest));
    }
    if v.needs_rebuild {
        println!("index=needs_rebuild");
    }
}

pub fn print_index_human(v: &IndexReport) {
    println!(
        "index traces={} spans={} rebuilt={}",
        v.traces, v.spans, v.rebuilt
    );
}

pub fn print_purge_human(v: &PurgeReport) {
    println!(
        "purged session={} traces={} spans={}",
        v.session_id, v.traces_removed, v.spans_removed
    );
}

fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn status_label(code: &str) -> String {
    if !std::io::stdout().is_terminal() {
        return code.to_string();
    }
    match code {
        "ERROR" => code.red().to_string(),
        "OK" => code.green().to_string(),
        _ => code.bright_black().to_string(),
    }
}

/// Spans whose parent is not in the list are printed as roots, so a subtree
/// view and traces with missing parents still render.
fn print_span_tree(spans: &[SpanRecord]) {
    let known = spans.iter().map(|s| s.span_id.as_str()).collect::<Vec<_>>();
    let mut children: HashMap<Option<&str>, Vec<&SpanRecord>> = HashMap::new();
    for span in spans {
        let parent = span
            .parent_span_id
            .as_deref()
            .filter(|p| known.contains(p));
        children.entry(parent).or_default().push(span);
    }
    if let Some(roots) = children.get(&None) {
        for root in roots {
            print_node(root, &children, 0);
        }
    }
}

fn print_node(span: &SpanRecord, children: &HashMap<Option<&str>, Vec<&SpanRecord>>, depth: usize) {
    let indent = "  ".repeat(depth);
    let mut line = format!(
        "{}{} {} ({}ms) {}",
        indent,
        span.service,
        span.name,
        span.duration_ms(),
        status_label(&span.status_code)
    );
    if let Some(message) = &span.status_message {
        line.push_str(&format!(" \"{message}\""));
    }
    println!("{line}");

    if let Some(kids) = children.get(&Some(span.span_id.as_str())) {
        for child in kids {
            print_node(child, children, depth + 1);
        }
    }
}
