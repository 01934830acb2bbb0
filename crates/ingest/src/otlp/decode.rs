use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::any_value::Value as OtlpValue;
use opentelemetry_proto::tonic::common::v1::{AnyValue, KeyValue};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::Span as OtlpSpan;
use serde_json::Value;
use tracekeep_core::ids::hex_id;
use tracekeep_core::model::span::{Attributes, RawSpan, RawSpanEvent, SpanKind};
use tracekeep_core::time::SpanTime;

/// Flattens an export request into raw spans. Validation happens later in
/// the ingestor, so undecodable ids come out empty rather than failing here.
pub fn decode_request(req: ExportTraceServiceRequest) -> Vec<RawSpan> {
    let mut spans = Vec::new();
    for rs in req.resource_spans {
        let resource = rs.resource.as_ref();
        for ss in rs.scope_spans {
            for span in &ss.spans {
                spans.push(decode_span(resource, span));
            }
        }
    }
    spans
}

pub fn decode_span(resource: Option<&Resource>, span: &OtlpSpan) -> RawSpan {
    let events = span
        .events
        .iter()
        .map(|e| RawSpanEvent {
            name: e.name.clone(),
            timestamp: SpanTime::UnixNanos(e.time_unix_nano),
            attributes: kv_to_json(&e.attributes),
        })
        .collect();

    let (status_code, status_message) = match &span.status {
        Some(status) => (
            status_code_name(status.code).to_string(),
            Some(status.message.clone()).filter(|m| !m.is_empty()),
        ),
        None => ("UNSET".to_string(), None),
    };

    RawSpan {
        trace_id: hex_id(&span.trace_id).unwrap_or_default(),
        span_id: hex_id(&span.span_id).unwrap_or_default(),
        parent_span_id: hex_id(&span.parent_span_id),
        service: service_name(resource),
        name: span.name.clone(),
        start_time: SpanTime::UnixNanos(span.start_time_unix_nano),
        end_time: SpanTime::UnixNanos(span.end_time_unix_nano),
        status_code,
        status_message,
        attributes: kv_to_json(&span.attributes),
        events,
        kind: SpanKind::from_otlp(span.kind),
    }
}

fn status_code_name(code: i32) -> &'static str {
    match code {
        1 => "OK",
        2 => "ERROR",
        _ => "UNSET",
    }
}

fn service_name(resource: Option<&Resource>) -> Option<String> {
    resource?
        .attributes
        .iter()
        .find(|kv| kv.key == "service.name")
        .and_then(|kv| match any_value_to_json(kv.value.as_ref()) {
            Value::String(s) => Some(s),
            Value::Null => None,
            other => Some(other.to_string()),
        })
}

fn kv_to_json(attrs: &[KeyValue]) -> Attributes {
    attrs
        .iter()
        .map(|kv| (kv.key.clone(), any_value_to_json(kv.value.as_ref())))
        .collect()
}

fn any_value_to_json(value: Option<&AnyValue>) -> Value {
    let Some(value) = value.and_then(|v| v.value.as_ref()) else {
        return Value::Null;
    };
    match value {
        OtlpValue::StringValue(s) => Value::String(s.clone()),
        OtlpValue::BoolValue(b) => Value::Bool(*b),
        OtlpValue::IntValue(i) => Value::from(*i),
        OtlpValue::DoubleValue(d) => serde_json::Number::from_f64(*d)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        OtlpValue::BytesValue(b) => Value::String(String::from_utf8_lossy(b).to_string()),
        OtlpValue::ArrayValue(arr) => Value::Array(
            arr.values
                .iter()
                .map(|v| any_value_to_json(Some(v)))
                .collect(),
        ),
        OtlpValue::KvlistValue(list) => Value::Object(kv_to_json(&list.values)),
    }
}
