use tracekeep_core::model::span::RawSpan;
use tracekeep_core::query::IngestReport;
use tracekeep_store::TraceIndex;
use tracing::{debug, warn};

/// Applies batches to the span log and the trace index, one span at a time.
/// Nothing here returns an error: invalid spans are dropped, storage
/// failures skip the span, and both are counted in the report.
#[derive(Clone)]
pub struct Ingestor {
    index: TraceIndex,
}

impl Ingestor {
    pub fn new(index: TraceIndex) -> Self {
        Self { index }
    }

    pub fn index(&self) -> &TraceIndex {
        &self.index
    }

    pub fn ingest(&self, batch: Vec<RawSpan>) -> IngestReport {
        let mut report = IngestReport {
            received: batch.len(),
            ..IngestReport::default()
        };

        for raw in batch {
            let span = match raw.normalize() {
                Ok(span) => span,
                Err(err) => {
                    warn!(error = %err, "dropping invalid span");
                    report.rejected += 1;
                    continue;
                }
            };

            if let Err(err) = self.index.record(&span) {
                warn!(
                    error = %err,
                    trace_id = %span.trace_id,
                    span_id = %span.span_id,
                    "span ingest failed"
                );
                report.failed += 1;
                continue;
            }
            report.accepted += 1;
        }

        debug!(
            received = report.received,
            accepted = report.accepted,
            rejected = report.rejected,
            failed = report.failed,
            "batch ingested"
        );
        report
    }
}
