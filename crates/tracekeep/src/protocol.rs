use serde::{Deserialize, Serialize};
use tracekeep_core::model::trace::TraceSummary;
use tracekeep_core::query::{
    IndexReport, PurgeReport, PurgeSessionRequest, SessionsResponse, StatusResponse,
    TraceRequest, TraceResponse, TracesRequest,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ApiRequest {
    Traces(TracesRequest),
    Trace(TraceRequest),
    Sessions,
    Status,
    Repair,
    PurgeSession(PurgeSessionRequest),
}

impl ApiRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Traces(_) => "traces",
            Self::Trace(_) => "trace",
            Self::Sessions => "sessions",
            Self::Status => "status",
            Self::Repair => "repair",
            Self::PurgeSession(_) => "purge_session",
        }
    }
}

/// One request line. The timeout only applies to reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope {
    pub request: ApiRequest,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ApiResponse {
    Traces(Vec<TraceSummary>),
    Trace(TraceResponse),
    Sessions(SessionsResponse),
    Status(StatusResponse),
    Index(IndexReport),
    Purged(PurgeReport),
    Error(String),
}
