use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TracekeepError};

/// A timestamp as handed over by the instrumentation layer, before
/// normalization. OTLP exporters send unix nanoseconds, JSON producers
/// usually send RFC 3339 text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SpanTime {
    UnixNanos(u64),
    Utc(DateTime<Utc>),
    Text(String),
}

impl From<DateTime<Utc>> for SpanTime {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Utc(value)
    }
}

/// Resolves any accepted representation to the canonical timestamp type:
/// UTC, truncated to microseconds (the precision the store keeps).
pub fn canonical_time(input: &SpanTime) -> Result<DateTime<Utc>> {
    let ts = match input {
        SpanTime::UnixNanos(0) => {
            return Err(TracekeepError::Validation("timestamp is unset".to_string()));
        }
        SpanTime::UnixNanos(nanos) => {
            let secs = (nanos / 1_000_000_000) as i64;
            let subnanos = (nanos % 1_000_000_000) as u32;
            Utc.timestamp_opt(secs, subnanos).single().ok_or_else(|| {
                TracekeepError::Parse(format!("unix nanos out of range: {nanos}"))
            })?
        }
        SpanTime::Utc(ts) => *ts,
        SpanTime::Text(raw) => parse_timestamp(raw)?,
    };
    truncate_micros(ts)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    // Offset-less ISO 8601 is read as UTC.
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| TracekeepError::Parse(format!("invalid timestamp {raw:?}: {e}")))
}

pub fn truncate_micros(ts: DateTime<Utc>) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(ts.timestamp_micros())
        .ok_or_else(|| TracekeepError::Parse(format!("timestamp out of range: {ts}")))
}

pub fn parse_duration_str(input: &str) -> Result<Duration> {
    humantime::parse_duration(input)
        .map_err(|e| TracekeepError::Parse(format!("invalid duration {input}: {e}")))
}
