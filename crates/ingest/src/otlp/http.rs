use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::routing::post;
use axum::{Router, body::Bytes};
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use prost::Message;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracekeep_core::model::span::RawSpan;
use tracing::Level;

use crate::otlp::decode::decode_request;
use crate::pipeline::Pipeline;

#[derive(Clone)]
pub struct HttpIngestState {
    pub pipeline: Pipeline,
}

pub fn router(pipeline: Pipeline) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers(Any);
    Router::new()
        .route("/v1/traces", post(export_traces))
        .route("/v1/spans", post(ingest_json_spans))
        .layer(cors)
        .layer(
            TraceLayer::new_for_http()
                .on_request(tower_http::trace::DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .with_state(HttpIngestState { pipeline })
}

async fn export_traces(State(state): State<HttpIngestState>, body: Bytes) -> StatusCode {
    let Ok(req) = ExportTraceServiceRequest::decode(body) else {
        tracing::warn!("otlp http traces decode failed");
        return StatusCode::BAD_REQUEST;
    };
    let spans = decode_request(req);
    tracing::debug!(count = spans.len(), "otlp http traces accepted");
    state.pipeline.submit_spans(spans).await;
    StatusCode::OK
}

async fn ingest_json_spans(State(state): State<HttpIngestState>, body: Bytes) -> StatusCode {
    let items = match serde_json::from_slice::<Vec<serde_json::Value>>(&body) {
        Ok(items) => items,
        Err(err) => {
            tracing::warn!(error = %err, "json span batch decode failed");
            return StatusCode::BAD_REQUEST;
        }
    };
    let (spans, rejected) = split_json_spans(items);
    if rejected > 0 {
        tracing::warn!(rejected, "dropped malformed json spans");
    }
    tracing::debug!(count = spans.len(), "json spans accepted");
    state.pipeline.submit_spans(spans).await;
    StatusCode::ACCEPTED
}

// Each element is decoded on its own so one malformed span cannot sink the batch.
fn split_json_spans(items: Vec<serde_json::Value>) -> (Vec<RawSpan>, usize) {
    let mut spans = Vec::with_capacity(items.len());
    let mut rejected = 0;
    for item in items {
        match serde_json::from_value::<RawSpan>(item) {
            Ok(span) => spans.push(span),
            Err(err) => {
                tracing::debug!(error = %err, "json span skipped");
                rejected += 1;
            }
        }
    }
    (spans, rejected)
}
