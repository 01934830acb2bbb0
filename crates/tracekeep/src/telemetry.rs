use std::collections::HashMap;
use std::io::IsTerminal;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::trace as sdktrace;
use serde_json::Value;
use tokio::sync::mpsc;
use tracekeep_core::model::span::{Attributes, RawSpan, RawSpanEvent, SpanKind};
use tracekeep_core::time::SpanTime;
use tracekeep_ingest::Pipeline;
use tracing::{Event, Id, Subscriber};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const SELF_SERVICE: &str = "tracekeep";
const SELF_BATCH: usize = 128;

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub self_observe: SelfObserveMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfObserveMode {
    Off,
    Store,
}

impl SelfObserveMode {
    pub fn from_env() -> Self {
        Self::parse(&std::env::var("TRACEKEEP_SELF_OBSERVE").unwrap_or_default())
    }

    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" | "store" => Self::Store,
            _ => Self::Off,
        }
    }
}

pub fn init_cli_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .compact()
        .try_init();
}

pub fn init_run_tracing(cfg: TelemetryConfig, pipeline: Option<Pipeline>) {
    let env_filter = EnvFilter::from_default_env();
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .compact();

    let otlp_layer = build_otlp_layer();
    let store_layer = match cfg.self_observe {
        SelfObserveMode::Store => pipeline.map(SelfObserveLayer::new),
        SelfObserveMode::Off => None,
    };

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otlp_layer)
        .with(store_layer)
        .try_init();
}

pub fn shutdown_tracing() {
    if let Some(provider) = otlp_provider_slot()
        .lock()
        .ok()
        .and_then(|mut slot| slot.take())
    {
        let _ = provider.shutdown();
    }
}

fn build_otlp_layer<S>() -> Option<OpenTelemetryLayer<S, sdktrace::Tracer>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .build()
        .ok()?;

    let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .build();
    let tracer = provider.tracer(SELF_SERVICE);

    if let Ok(mut slot) = otlp_provider_slot().lock() {
        *slot = Some(provider);
    }

    Some(tracing_opentelemetry::layer().with_tracer(tracer))
}

fn otlp_provider_slot() -> &'static Mutex<Option<sdktrace::SdkTracerProvider>> {
    static SLOT: OnceLock<Mutex<Option<sdktrace::SdkTracerProvider>>> = OnceLock::new();
    SLOT.get_or_init(|| Mutex::new(None))
}

#[derive(Debug, Clone)]
struct OpenSpan {
    trace_id: String,
    span_id: String,
    parent_span_id: Option<String>,
    name: String,
    start: DateTime<Utc>,
    attributes: Attributes,
    events: Vec<RawSpanEvent>,
}

/// Turns the server's own `tracing` spans into raw spans and feeds them to
/// the ingestion pipeline. Submission never blocks the instrumented code.
#[derive(Clone)]
struct SelfObserveLayer {
    tx: mpsc::UnboundedSender<RawSpan>,
    spans: Arc<Mutex<HashMap<u64, OpenSpan>>>,
}

impl SelfObserveLayer {
    fn new(pipeline: Pipeline) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<RawSpan>();
        tokio::spawn(async move {
            let mut buffer = Vec::new();
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    span = rx.recv() => {
                        let Some(span) = span else { break };
                        buffer.push(span);
                        if buffer.len() >= SELF_BATCH {
                            pipeline.try_submit_spans(std::mem::take(&mut buffer));
                        }
                    }
                    _ = ticker.tick() => {
                        if !buffer.is_empty() {
                            pipeline.try_submit_spans(std::mem::take(&mut buffer));
                        }
                    }
                }
            }
            if !buffer.is_empty() {
                pipeline.try_submit_spans(buffer);
            }
        });

        Self {
            tx,
            spans: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn open_span(&self, id: u64) -> Option<OpenSpan> {
        self.spans.lock().ok().and_then(|m| m.get(&id).cloned())
    }
}

// The registry recycles `Id`s once a span closes, so they cannot name spans.
fn fresh_span_id() -> String {
    format!("{:016x}", uuid::Uuid::new_v4().as_u64_pair().0)
}

impl<S> Layer<S> for SelfObserveLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &tracing::span::Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let id_u64 = id.into_u64();
        let parent_id = attrs
            .parent()
            .map(Id::into_u64)
            .or_else(|| ctx.lookup_current().map(|s| s.id().into_u64()));

        let (trace_id, parent_span_id) = match parent_id.and_then(|pid| self.open_span(pid)) {
            Some(parent) => (parent.trace_id, Some(parent.span_id)),
            None => (uuid::Uuid::new_v4().simple().to_string(), None),
        };

        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);

        let span = OpenSpan {
            trace_id,
            span_id: fresh_span_id(),
            parent_span_id,
            name: attrs.metadata().name().to_string(),
            start: Utc::now(),
            attributes: visitor.fields,
            events: Vec::new(),
        };

        if let Ok(mut map) = self.spans.lock() {
            map.insert(id_u64, span);
        }
    }

    fn on_record(&self, id: &Id, values: &tracing::span::Record<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        values.record(&mut visitor);
        if let Ok(mut map) = self.spans.lock()
            && let Some(span) = map.get_mut(&id.into_u64())
        {
            span.attributes.extend(visitor.fields);
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(current) = ctx.lookup_current() else {
            return;
        };

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        let name = visitor
            .message
            .take()
            .unwrap_or_else(|| event.metadata().name().to_string());
        visitor.fields.insert(
            "level".to_string(),
            Value::String(event.metadata().level().to_string()),
        );

        if let Ok(mut map) = self.spans.lock()
            && let Some(span) = map.get_mut(&current.id().into_u64())
        {
            span.events.push(RawSpanEvent {
                name,
                timestamp: SpanTime::Utc(Utc::now()),
                attributes: visitor.fields,
            });
        }
    }

    fn on_close(&self, id: Id, _ctx: Context<'_, S>) {
        let Some(open) = self
            .spans
            .lock()
            .ok()
            .and_then(|mut m| m.remove(&id.into_u64()))
        else {
            return;
        };

        let failed = open
            .events
            .iter()
            .any(|e| e.attributes.get("level") == Some(&Value::String("ERROR".to_string())));

        let _ = self.tx.send(RawSpan {
            trace_id: open.trace_id,
            span_id: open.span_id,
            parent_span_id: open.parent_span_id,
            service: Some(SELF_SERVICE.to_string()),
            name: open.name,
            start_time: SpanTime::Utc(open.start),
            end_time: SpanTime::Utc(Utc::now()),
            status_code: if failed { "ERROR" } else { "OK" }.to_string(),
            status_message: None,
            attributes: open.attributes,
            events: open.events,
            kind: SpanKind::Internal,
        });
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Attributes,
}

impl FieldVisitor {
    fn put(&mut self, field: &tracing::field::Field, value: Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        if field.name() == "message" {
            self.message = Some(rendered.trim_matches('"').to_string());
            return;
        }
        self.put(field, Value::String(rendered));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
            return;
        }
        self.put(field, Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.put(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.put(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.put(field, Value::Bool(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_observe_mode_parses() {
        assert_eq!(SelfObserveMode::parse("store"), SelfObserveMode::Store);
        assert_eq!(SelfObserveMode::parse("TRUE"), SelfObserveMode::Store);
        assert_eq!(SelfObserveMode::parse(""), SelfObserveMode::Off);
        assert_eq!(SelfObserveMode::parse("both"), SelfObserveMode::Off);
    }

    #[tokio::test]
    async fn layer_emits_nested_spans_with_fields() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let layer = SelfObserveLayer {
            tx,
            spans: Arc::new(Mutex::new(HashMap::new())),
        };
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            let outer = tracing::info_span!("query", kind = "traces");
            let _outer = outer.enter();
            let inner = tracing::info_span!("load", rows = 3u64);
            let _inner = inner.enter();
            tracing::error!(reason = "disk", "read failed");
        });

        let inner = rx.recv().await.unwrap();
        let outer = rx.recv().await.unwrap();
        assert_eq!(inner.name, "load");
        assert_eq!(outer.name, "query");
        assert_eq!(inner.trace_id, outer.trace_id);
        assert_eq!(inner.parent_span_id.as_deref(), Some(outer.span_id.as_str()));
        assert_eq!(outer.attributes.get("kind"), Some(&Value::String("traces".into())));
        assert_eq!(inner.attributes.get("rows"), Some(&Value::from(3u64)));
        assert_eq!(inner.status_code, "ERROR");
        assert_eq!(inner.events[0].name, "read failed");
        assert_eq!(outer.status_code, "OK");

        let span = inner.normalize().unwrap();
        assert_eq!(span.service, "tracekeep");
    }

    #[tokio::test]
    async fn sibling_spans_get_distinct_ids() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let layer = SelfObserveLayer {
            tx,
            spans: Arc::new(Mutex::new(HashMap::new())),
        };
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            let outer = tracing::info_span!("query");
            let _outer = outer.enter();
            for _ in 0..3 {
                let step = tracing::info_span!("step");
                let _step = step.enter();
            }
        });

        let mut steps = Vec::new();
        for _ in 0..3 {
            steps.push(rx.recv().await.unwrap());
        }
        let outer = rx.recv().await.unwrap();
        assert_eq!(outer.name, "query");
        let mut ids = steps.iter().map(|s| s.span_id.clone()).collect::<Vec<_>>();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert!(!ids.contains(&outer.span_id));
        for step in &steps {
            assert_eq!(step.parent_span_id.as_deref(), Some(outer.span_id.as_str()));
        }
    }
}
