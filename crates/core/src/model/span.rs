use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TracekeepError};
use crate::ids::{SpanId, TraceId};
use crate::time::{SpanTime, canonical_time};

pub type Attributes = serde_json::Map<String, Value>;

pub const SESSION_ID_ATTR: &str = "session.id";
pub const CONVERSATION_ID_ATTR: &str = "conversation.id";
pub const SESSION_TITLE_ATTR: &str = "session.title";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpanKind {
    Unspecified,
    #[default]
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

impl SpanKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unspecified => "UNSPECIFIED",
            Self::Internal => "INTERNAL",
            Self::Server => "SERVER",
            Self::Client => "CLIENT",
            Self::Producer => "PRODUCER",
            Self::Consumer => "CONSUMER",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "INTERNAL" => Self::Internal,
            "SERVER" => Self::Server,
            "CLIENT" => Self::Client,
            "PRODUCER" => Self::Producer,
            "CONSUMER" => Self::Consumer,
            _ => Self::Unspecified,
        }
    }

    /// Maps the OTLP `Span.SpanKind` wire value.
    pub fn from_otlp(kind: i32) -> Self {
        match kind {
            1 => Self::Internal,
            2 => Self::Server,
            3 => Self::Client,
            4 => Self::Producer,
            5 => Self::Consumer,
            _ => Self::Unspecified,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpanEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub attributes: Attributes,
}

/// One completed, normalized unit of traced work. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpanRecord {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub service: String,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status_code: String,
    pub status_message: Option<String>,
    pub attributes: Attributes,
    pub events: Vec<SpanEvent>,
    pub kind: SpanKind,
}

impl SpanRecord {
    pub fn duration_ms(&self) -> i64 {
        (self.end_time - self.start_time).num_milliseconds().max(0)
    }

    /// Reads an attribute as a correlation key. Null and empty strings count
    /// as absent; non-string scalars use their JSON text.
    pub fn attr_str(&self, key: &str) -> Option<String> {
        match self.attributes.get(key)? {
            Value::Null => None,
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawSpanEvent {
    pub name: String,
    pub timestamp: SpanTime,
    #[serde(default)]
    pub attributes: Attributes,
}

/// A span as delivered by the instrumentation layer, before validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawSpan {
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub span_id: String,
    #[serde(default)]
    pub parent_span_id: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    pub name: String,
    pub start_time: SpanTime,
    pub end_time: SpanTime,
    #[serde(default)]
    pub status_code: String,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub events: Vec<RawSpanEvent>,
    #[serde(default)]
    pub kind: SpanKind,
}

impl RawSpan {
    /// Validates identifiers and timing and resolves every timestamp to the
    /// canonical type. Events come out ordered by time.
    pub fn normalize(self) -> Result<SpanRecord> {
        let trace_id = TraceId::parse(&self.trace_id)?.into_string();
        let span_id = SpanId::parse(&self.span_id)?.into_string();
        let start_time = canonical_time(&self.start_time)?;
        let end_time = canonical_time(&self.end_time)?;
        if end_time < start_time {
            return Err(TracekeepError::Validation(format!(
                "span {span_id} of trace {trace_id} ends before it starts \
                 ({end_time} < {start_time})"
            )));
        }

        let mut events = self
            .events
            .into_iter()
            .map(|e| {
                Ok(SpanEvent {
                    timestamp: canonical_time(&e.timestamp)?,
                    name: e.name,
                    attributes: e.attributes,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        events.sort_by_key(|e| e.timestamp);

        let status_code = if self.status_code.is_empty() {
            "UNSET".to_string()
        } else {
            self.status_code.to_ascii_uppercase()
        };

        Ok(SpanRecord {
            trace_id,
            span_id,
            parent_span_id: self.parent_span_id.filter(|p| !p.is_empty()),
            service: self
                .service
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "unknown".to_string()),
            name: self.name,
            start_time,
            end_time,
            status_code,
            status_message: self.status_message.filter(|m| !m.is_empty()),
            attributes: self.attributes,
            events,
            kind: self.kind,
        })
    }
}
