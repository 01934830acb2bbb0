use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracekeep_core::config::Config;
use tracekeep_core::model::span::RawSpan;
use tracing::warn;

use crate::ingestor::Ingestor;

/// Hands span batches to a fixed set of writer tasks. Each batch goes to one
/// worker whole, so its spans are appended in the order given.
#[derive(Clone)]
pub struct Pipeline {
    workers: Arc<[mpsc::Sender<Vec<RawSpan>>]>,
    next: Arc<AtomicUsize>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workers: usize,
    pub channel_capacity: usize,
    pub flush_interval: Duration,
    pub batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            channel_capacity: 256,
            flush_interval: Duration::from_millis(200),
            batch_size: 512,
        }
    }
}

impl From<&Config> for PipelineConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            workers: cfg.ingest_workers,
            channel_capacity: cfg.channel_capacity,
            flush_interval: Duration::from_millis(cfg.write_flush_ms),
            batch_size: cfg.write_batch_size,
        }
    }
}

impl Pipeline {
    pub fn new(ingestor: Ingestor, cfg: PipelineConfig) -> Self {
        let workers = (0..cfg.workers.max(1))
            .map(|_| {
                let (tx, rx) = mpsc::channel(cfg.channel_capacity.max(1));
                tokio::spawn(run_span_writer(
                    ingestor.clone(),
                    rx,
                    cfg.batch_size.max(1),
                    cfg.flush_interval,
                ));
                tx
            })
            .collect::<Vec<_>>();

        Self {
            workers: workers.into(),
            next: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Waits for queue space.
    pub async fn submit_spans(&self, spans: Vec<RawSpan>) {
        if spans.is_empty() {
            return;
        }
        if self.pick().send(spans).await.is_err() {
            warn!("span pipeline dropped batch: receiver closed");
        }
    }

    /// Never waits. A full queue drops the batch; returns whether it was
    /// queued.
    pub fn try_submit_spans(&self, spans: Vec<RawSpan>) -> bool {
        if spans.is_empty() {
            return true;
        }
        match self.pick().try_send(spans) {
            Ok(()) => true,
            Err(TrySendError::Full(batch)) => {
                warn!(spans = batch.len(), "span pipeline full, dropping batch");
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!("span pipeline dropped batch: receiver closed");
                false
            }
        }
    }

    fn pick(&self) -> &mpsc::Sender<Vec<RawSpan>> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        &self.workers[i]
    }
}

async fn run_span_writer(
    ingestor: Ingestor,
    mut rx: mpsc::Receiver<Vec<RawSpan>>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut ticker = tokio::time::interval(flush_interval);
    let mut buffer = Vec::new();
    loop {
        tokio::select! {
            batch = rx.recv() => {
                let Some(batch) = batch else {
                    flush_spans(&ingestor, &mut buffer);
                    break;
                };
                buffer.extend(batch);
                if buffer.len() >= batch_size {
                    flush_spans(&ingestor, &mut buffer);
                }
            }
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush_spans(&ingestor, &mut buffer);
                }
            }
        }
    }
}

fn flush_spans(ingestor: &Ingestor, buffer: &mut Vec<RawSpan>) {
    if buffer.is_empty() {
        return;
    }
    let report = ingestor.ingest(std::mem::take(buffer));
    if report.failed > 0 {
        warn!(
            failed = report.failed,
            accepted = report.accepted,
            "span batch partially written"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use testkit::raw_span;
    use tracekeep_store::{Store, TraceIndex};

    use super::*;

    fn ingestor() -> Ingestor {
        let store = Store::open_in_memory().unwrap();
        let index = TraceIndex::open(Arc::new(store.clone()), Arc::new(store)).unwrap();
        Ingestor::new(index)
    }

    async fn wait_for_count(ingestor: &Ingestor, trace_id: &str, count: u64) -> bool {
        for _ in 0..100 {
            if ingestor.index().get(trace_id).map(|s| s.span_count) == Some(count) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn pipeline_flushes_on_interval() {
        let ingestor = ingestor();
        let pipeline = Pipeline::new(
            ingestor.clone(),
            PipelineConfig {
                workers: 1,
                channel_capacity: 8,
                flush_interval: Duration::from_millis(10),
                batch_size: 100,
            },
        );

        pipeline
            .submit_spans(vec![raw_span("T1", "S1", None, "outer", 10, 20)])
            .await;
        assert!(wait_for_count(&ingestor, "T1", 1).await);
    }

    #[tokio::test]
    async fn pipeline_flushes_on_batch_size() {
        let ingestor = ingestor();
        let pipeline = Pipeline::new(
            ingestor.clone(),
            PipelineConfig {
                workers: 1,
                channel_capacity: 8,
                flush_interval: Duration::from_secs(60),
                batch_size: 2,
            },
        );

        // The first tick fires immediately; let it pass with an empty buffer.
        tokio::time::sleep(Duration::from_millis(20)).await;
        pipeline
            .submit_spans(vec![raw_span("T1", "S1", None, "a", 1, 2)])
            .await;
        pipeline
            .submit_spans(vec![raw_span("T1", "S2", None, "b", 3, 4)])
            .await;
        assert!(wait_for_count(&ingestor, "T1", 2).await);
    }

    #[tokio::test]
    async fn batches_spread_across_workers() {
        let ingestor = ingestor();
        let pipeline = Pipeline::new(
            ingestor.clone(),
            PipelineConfig {
                workers: 3,
                channel_capacity: 4,
                flush_interval: Duration::from_millis(5),
                batch_size: 16,
            },
        );

        for i in 0..30 {
            pipeline
                .submit_spans(vec![raw_span("T1", &format!("S{i}"), None, "op", i, i + 1)])
                .await;
        }
        assert!(wait_for_count(&ingestor, "T1", 30).await);
        let summary = ingestor.index().get("T1").unwrap();
        assert_eq!(summary.start_time, testkit::at(0));
        assert_eq!(summary.end_time, testkit::at(30));
    }

    #[tokio::test]
    async fn try_submit_drops_when_full() {
        let ingestor = ingestor();
        let (tx, _rx) = mpsc::channel(1);
        let pipeline = Pipeline {
            workers: vec![tx].into(),
            next: Arc::new(AtomicUsize::new(0)),
        };

        assert!(pipeline.try_submit_spans(vec![raw_span("T1", "S1", None, "a", 1, 2)]));
        assert!(!pipeline.try_submit_spans(vec![raw_span("T1", "S2", None, "b", 1, 2)]));
        assert!(ingestor.index().get("T1").is_none());
    }
}
