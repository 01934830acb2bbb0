use serde::{Deserialize, Serialize};

use crate::error::{Result, TracekeepError};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceId(String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanId(String);

impl TraceId {
    pub fn parse(input: &str) -> Result<Self> {
        check_opaque(input, "trace_id").map(Self)
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl SpanId {
    pub fn parse(input: &str) -> Result<Self> {
        check_opaque(input, "span_id").map(Self)
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

/// Lowercase hex rendering of a binary OTLP identifier. All-zero and empty
/// ids mean "absent" on the wire.
pub fn hex_id(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() || bytes.iter().all(|b| *b == 0) {
        return None;
    }
    Some(bytes.iter().map(|b| format!("{b:02x}")).collect::<String>())
}

// Identifiers are opaque: anything non-empty without whitespace is accepted.
fn check_opaque(input: &str, field: &str) -> Result<String> {
    if input.is_empty() {
        return Err(TracekeepError::Validation(format!("missing {field}")));
    }
    if input.chars().any(char::is_whitespace) {
        return Err(TracekeepError::Validation(format!(
            "{field} contains whitespace: {input:?}"
        )));
    }
    Ok(input.to_string())
}
