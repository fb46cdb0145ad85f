use std::time::Duration;

use omnitrace_core::model::metric::Metric;
use omnitrace_core::model::span::Span;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::processor::{ProcessReport, Processor};

/// Decouples request handlers from the stores: handlers enqueue batches,
/// one writer task per signal buffers and flushes them through the processor.
#[derive(Clone)]
pub struct Pipeline {
    spans_tx: mpsc::Sender<Vec<Span>>,
    metrics_tx: mpsc::Sender<Vec<Metric>>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub channel_capacity: usize,
    pub flush_interval: Duration,
    pub batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            flush_interval: Duration::from_millis(100),
            batch_size: 512,
        }
    }
}

impl Pipeline {
    pub fn new(processor: Processor, cfg: PipelineConfig) -> Self {
        let (spans_tx, spans_rx) = mpsc::channel(cfg.channel_capacity.max(1));
        let (metrics_tx, metrics_rx) = mpsc::channel(cfg.channel_capacity.max(1));

        let span_processor = processor.clone();
        tokio::spawn(run_writer(
            "spans",
            spans_rx,
            cfg.batch_size,
            cfg.flush_interval,
            move |batch| span_processor.process_spans(batch),
        ));
        tokio::spawn(run_writer(
            "metrics",
            metrics_rx,
            cfg.batch_size,
            cfg.flush_interval,
            move |batch| processor.process_metrics(batch),
        ));

        Self {
            spans_tx,
            metrics_tx,
        }
    }

    pub async fn submit_spans(&self, spans: Vec<Span>) {
        if self.spans_tx.send(spans).await.is_err() {
            warn!("span pipeline dropped batch: receiver closed");
        }
    }

    pub async fn submit_metrics(&self, metrics: Vec<Metric>) {
        if self.metrics_tx.send(metrics).await.is_err() {
            warn!("metric pipeline dropped batch: receiver closed");
        }
    }
}

async fn run_writer<T, F>(
    signal: &'static str,
    mut rx: mpsc::Receiver<Vec<T>>,
    batch_size: usize,
    flush_interval: Duration,
    mut flush: F,
) where
    T: Send + 'static,
    F: FnMut(Vec<T>) -> ProcessReport + Send + 'static,
{
    let mut ticker = tokio::time::interval(flush_interval.max(Duration::from_millis(1)));
    let mut buffer = Vec::new();
    loop {
        tokio::select! {
            batch = rx.recv() => match batch {
                Some(batch) => {
                    buffer.extend(batch);
                    if buffer.len() >= batch_size.max(1) {
                        flush_buffer(signal, &mut buffer, &mut flush);
                    }
                }
                None => {
                    flush_buffer(signal, &mut buffer, &mut flush);
                    break;
                }
            },
            _ = ticker.tick() => {
                flush_buffer(signal, &mut buffer, &mut flush);
            }
        }
    }
    debug!(signal, "pipeline writer stopped");
}

fn flush_buffer<T>(
    signal: &'static str,
    buffer: &mut Vec<T>,
    flush: &mut impl FnMut(Vec<T>) -> ProcessReport,
) {
    if buffer.is_empty() {
        return;
    }
    let report = flush(std::mem::take(buffer));
    if report.dropped > 0 || report.failed > 0 {
        warn!(
            signal,
            accepted = report.accepted,
            dropped = report.dropped,
            failed = report.failed,
            "batch partially rejected"
        );
    } else {
        debug!(signal, accepted = report.accepted, "batch flushed");
    }
}

#[cfg(test)]
mod tests {
    use omnitrace_store::{MetricStore, SpanStore};
    use testkit::{base_time, sample_metrics, sample_trace};

    use super::*;

    #[tokio::test]
    async fn pipeline_writes_spans_on_interval() {
        let spans = SpanStore::new();
        let pipeline = Pipeline::new(
            Processor::new(spans.clone(), MetricStore::new()),
            PipelineConfig {
                channel_capacity: 8,
                flush_interval: Duration::from_millis(10),
                batch_size: 100,
            },
        );

        pipeline.submit_spans(sample_trace("t1", base_time())).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let trace = spans.get_trace("t1").unwrap().unwrap();
        assert_eq!(trace.span_count, 2);
    }

    #[tokio::test]
    async fn pipeline_flushes_on_batch_size() {
        let metrics = MetricStore::new();
        let pipeline = Pipeline::new(
            Processor::new(SpanStore::new(), metrics.clone()),
            PipelineConfig {
                channel_capacity: 8,
                flush_interval: Duration::from_secs(60),
                batch_size: 2,
            },
        );

        pipeline
            .submit_metrics(sample_metrics("cpu", "api", base_time(), 2))
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(metrics.stats().unwrap().points, 2);
    }

    #[tokio::test]
    async fn closing_pipeline_flushes_remaining() {
        let metrics = MetricStore::new();
        let pipeline = Pipeline::new(
            Processor::new(SpanStore::new(), metrics.clone()),
            PipelineConfig {
                channel_capacity: 8,
                flush_interval: Duration::from_secs(60),
                batch_size: 1000,
            },
        );
        pipeline
            .submit_metrics(sample_metrics("cpu", "api", base_time(), 3))
            .await;
        drop(pipeline);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(metrics.stats().unwrap().points, 3);
    }
}
