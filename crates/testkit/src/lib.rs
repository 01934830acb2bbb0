use chrono::{DateTime, Duration, TimeZone, Utc};
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::any_value::Value;
use opentelemetry_proto::tonic::common::v1::{AnyValue, KeyValue};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::span::Event;
use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span as OtlpSpan};
use serde_json::json;
use tracekeep_core::model::span::{RawSpan, RawSpanEvent, SpanKind, SpanRecord};
use tracekeep_core::time::SpanTime;

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap()
}

pub fn at(secs: i64) -> DateTime<Utc> {
    base_time() + Duration::seconds(secs)
}

pub fn raw_span(
    trace_id: &str,
    span_id: &str,
    parent: Option<&str>,
    name: &str,
    start_secs: i64,
    end_secs: i64,
) -> RawSpan {
    RawSpan {
        trace_id: trace_id.to_string(),
        span_id: span_id.to_string(),
        parent_span_id: parent.map(str::to_string),
        service: Some("gateway".to_string()),
        name: name.to_string(),
        start_time: SpanTime::Utc(at(start_secs)),
        end_time: SpanTime::Utc(at(end_secs)),
        status_code: "OK".to_string(),
        status_message: None,
        attributes: serde_json::Map::new(),
        events: Vec::new(),
        kind: SpanKind::Internal,
    }
}

pub fn raw_event(name: &str, secs: i64) -> RawSpanEvent {
    RawSpanEvent {
        name: name.to_string(),
        timestamp: SpanTime::Utc(at(secs)),
        attributes: serde_json::Map::new(),
    }
}

/// A normalized span; times are seconds after [`base_time`].
pub fn span_at(
    trace_id: &str,
    span_id: &str,
    parent: Option<&str>,
    name: &str,
    start_secs: i64,
    end_secs: i64,
) -> SpanRecord {
    raw_span(trace_id, span_id, parent, name, start_secs, end_secs)
        .normalize()
        .unwrap()
}

/// One chat turn: the request span, a provider call and a tool call, tagged
/// with session and conversation ids on the root only.
pub fn sample_trace(trace_id: &str, session_id: &str) -> Vec<RawSpan> {
    let mut root = raw_span(trace_id, "root", None, "POST /chat/completions", 0, 4);
    root.kind = SpanKind::Server;
    root.attributes.insert("session.id".into(), json!(session_id));
    root.attributes.insert("session.title".into(), json!("Trip planning"));
    root.attributes.insert("conversation.id".into(), json!(format!("{session_id}-c1")));

    let mut llm = raw_span(trace_id, "llm", Some("root"), "llm.chat", 1, 3);
    llm.kind = SpanKind::Client;
    llm.attributes.insert("llm.provider".into(), json!("openai"));
    llm.attributes.insert("llm.tokens.total".into(), json!(812));
    llm.events.push(raw_event("first_token", 2));

    let mut tool = raw_span(trace_id, "tool", Some("llm"), "tool.weather", 2, 3);
    tool.status_code = "ERROR".to_string();
    tool.status_message = Some("upstream timeout".to_string());

    vec![root, llm, tool]
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn string_kv(key: &str, value: &str) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue {
            value: Some(Value::StringValue(value.to_string())),
        }),
    }
}

/// An OTLP span; times are milliseconds after [`base_time`].
pub fn otlp_span(
    trace_id: [u8; 16],
    span_id: [u8; 8],
    parent: Option<[u8; 8]>,
    name: &str,
    start_ms: i64,
    end_ms: i64,
) -> OtlpSpan {
    OtlpSpan {
        trace_id: trace_id.to_vec(),
        span_id: span_id.to_vec(),
        parent_span_id: parent.map(|p| p.to_vec()).unwrap_or_default(),
        name: name.to_string(),
        kind: 1,
        start_time_unix_nano: unix_nanos(start_ms),
        end_time_unix_nano: unix_nanos(end_ms),
        ..Default::default()
    }
}

pub fn otlp_event(name: &str, at_ms: i64) -> Event {
    Event {
        name: name.to_string(),
        time_unix_nano: unix_nanos(at_ms),
        ..Default::default()
    }
}

pub fn export_request(service: &str, spans: Vec<OtlpSpan>) -> ExportTraceServiceRequest {
    ExportTraceServiceRequest {
        resource_spans: vec![ResourceSpans {
            resource: Some(Resource {
                attributes: vec![string_kv("service.name", service)],
                ..Default::default()
            }),
            scope_spans: vec![ScopeSpans {
                spans,
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

/// A chat turn in OTLP form, matching the shape of [`sample_trace`].
pub fn sample_export(trace_id: [u8; 16], session_id: &str) -> ExportTraceServiceRequest {
    let root_id = [1u8; 8];
    let llm_id = [2u8; 8];
    let mut root = otlp_span(trace_id, root_id, None, "POST /chat/completions", 0, 1800);
    root.attributes.push(string_kv("session.id", session_id));
    let mut llm = otlp_span(trace_id, llm_id, Some(root_id), "llm.chat", 200, 1600);
    llm.events.push(otlp_event("first_token", 400));
    export_request("gateway", vec![root, llm])
}

fn unix_nanos(offset_ms: i64) -> u64 {
    let ts = base_time() + Duration::milliseconds(offset_ms);
    ts.timestamp_nanos_opt().unwrap() as u64
}
