use std::time::Duration;

use omnitrace_core::error::{OmniError, Result};
use omnitrace_core::model::metric::{Metric, MetricBatch};
use omnitrace_core::model::span::{Span, SpanBatch};
use reqwest::Client;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

const SEND_ATTEMPTS: u64 = 3;

#[derive(Debug, Clone)]
pub struct ExporterConfig {
    pub collector_url: String,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub timeout: Duration,
    pub queue_capacity: usize,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            collector_url: "http://localhost:10001".to_string(),
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(10),
            queue_capacity: 4096,
        }
    }
}

/// Buffers spans and metrics and posts them to the collector from a background task.
#[derive(Debug, Clone)]
pub struct Exporter {
    tx: mpsc::Sender<ExportMsg>,
}

#[derive(Debug)]
enum ExportMsg {
    Span(Box<Span>),
    Metric(Metric),
    Flush(oneshot::Sender<Result<()>>),
    Shutdown(oneshot::Sender<Result<()>>),
}

impl Exporter {
    /// Spawns the export task; must be called inside a tokio runtime.
    pub fn new(cfg: ExporterConfig) -> Self {
        let (tx, rx) = mpsc::channel(cfg.queue_capacity.max(1));
        tokio::spawn(run_exporter(rx, cfg));
        Self { tx }
    }

    pub fn export_span(&self, span: Span) {
        self.enqueue(ExportMsg::Span(Box::new(span)), "span");
    }

    pub fn export_metric(&self, metric: Metric) {
        self.enqueue(ExportMsg::Metric(metric), "metric");
    }

    /// Sends everything buffered so far and reports the last send error.
    pub async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(ExportMsg::Flush(done_tx))
            .await
            .map_err(|_| OmniError::Internal("exporter stopped".into()))?;
        done_rx
            .await
            .map_err(|_| OmniError::Internal("exporter stopped before flushing".into()))?
    }

    /// Flushes and stops the export task. Later exports are discarded.
    pub async fn shutdown(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(ExportMsg::Shutdown(done_tx))
            .await
            .map_err(|_| OmniError::Internal("exporter already stopped".into()))?;
        done_rx
            .await
            .map_err(|_| OmniError::Internal("exporter stopped before flushing".into()))?
    }

    fn enqueue(&self, msg: ExportMsg, what: &'static str) {
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(what, "export queue full; dropping record");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(what, "exporter stopped; dropping record");
            }
        }
    }
}

struct Buffers {
    client: Client,
    base_url: String,
    spans: Vec<Span>,
    metrics: Vec<Metric>,
}

impl Buffers {
    async fn flush_spans(&mut self) -> Result<()> {
        if self.spans.is_empty() {
            return Ok(());
        }
        let batch = SpanBatch {
            spans: std::mem::take(&mut self.spans),
        };
        let url = format!("{}/api/v1/spans", self.base_url);
        post_with_retries(&self.client, &url, &batch).await
    }

    async fn flush_metrics(&mut self) -> Result<()> {
        if self.metrics.is_empty() {
            return Ok(());
        }
        let batch = MetricBatch {
            metrics: std::mem::take(&mut self.metrics),
        };
        let url = format!("{}/api/v1/metrics", self.base_url);
        post_with_retries(&self.client, &url, &batch).await
    }

    async fn flush_all(&mut self) -> Result<()> {
        let spans = self.flush_spans().await;
        let metrics = self.flush_metrics().await;
        spans.and(metrics)
    }
}

async fn run_exporter(mut rx: mpsc::Receiver<ExportMsg>, cfg: ExporterConfig) {
    let client = Client::builder()
        .timeout(cfg.timeout)
        .build()
        .unwrap_or_else(|e| {
            warn!(error = ?e, "failed to build export http client; using defaults");
            Client::new()
        });
    let mut buffers = Buffers {
        client,
        base_url: cfg.collector_url.trim_end_matches('/').to_string(),
        spans: Vec::new(),
        metrics: Vec::new(),
    };
    let batch_size = cfg.batch_size.max(1);
    let mut ticker = tokio::time::interval(cfg.flush_interval.max(Duration::from_millis(1)));

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(ExportMsg::Span(span)) => {
                    buffers.spans.push(*span);
                    if buffers.spans.len() >= batch_size {
                        log_failure(buffers.flush_spans().await);
                    }
                }
                Some(ExportMsg::Metric(metric)) => {
                    buffers.metrics.push(metric);
                    if buffers.metrics.len() >= batch_size {
                        log_failure(buffers.flush_metrics().await);
                    }
                }
                Some(ExportMsg::Flush(done)) => {
                    let _ = done.send(buffers.flush_all().await);
                }
                Some(ExportMsg::Shutdown(done)) => {
                    let _ = done.send(buffers.flush_all().await);
                    break;
                }
                None => {
                    log_failure(buffers.flush_all().await);
                    break;
                }
            },
            _ = ticker.tick() => {
                log_failure(buffers.flush_all().await);
            }
        }
    }
    debug!("exporter stopped");
}

fn log_failure(result: Result<()>) {
    if let Err(err) = result {
        warn!(error = %err, "export failed");
    }
}

async fn post_with_retries<T: Serialize>(client: &Client, url: &str, batch: &T) -> Result<()> {
    let body = serde_json::to_vec(batch)
        .map_err(|e| OmniError::Internal(format!("failed to encode export batch: {e}")))?;

    let mut last_err = String::new();
    for attempt in 0..SEND_ATTEMPTS {
        let result = client
            .post(url)
            .header("content-type", "application/json")
            .body(body.clone())
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            Ok(resp) => last_err = format!("collector returned status {}", resp.status()),
            Err(err) => last_err = format!("request failed: {err}"),
        }
        if attempt + 1 < SEND_ATTEMPTS {
            tokio::time::sleep(Duration::from_millis(30 * (attempt + 1))).await;
        }
    }
    Err(OmniError::Io(format!(
        "export to {url} failed after {SEND_ATTEMPTS} attempts: {last_err}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn flush_against_unreachable_collector_reports_error() {
        let exporter = Exporter::new(ExporterConfig {
            collector_url: "http://127.0.0.1:9".into(),
            timeout: Duration::from_millis(200),
            flush_interval: Duration::from_secs(60),
            ..ExporterConfig::default()
        });
        exporter.export_metric(Metric::gauge("cpu", 1.0, "api"));
        let err = exporter.flush().await.unwrap_err();
        assert!(matches!(err, OmniError::Io(_)));
    }

    #[tokio::test]
    async fn empty_flush_succeeds() {
        let exporter = Exporter::new(ExporterConfig::default());
        exporter.flush().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_stops_the_task() {
        let exporter = Exporter::new(ExporterConfig::default());
        exporter.shutdown().await.unwrap();
        assert!(exporter.flush().await.is_err());
        exporter.export_span(Span::new("t", "s", "op", "api", chrono::Utc::now()));
    }
}
