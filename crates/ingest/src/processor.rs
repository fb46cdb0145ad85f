use omnitrace_core::model::metric::Metric;
use omnitrace_core::model::span::Span;
use omnitrace_store::{MetricStore, SpanStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Outcome of one batch. Records are handled individually; one bad record
/// never rejects the rest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessReport {
    pub accepted: usize,
    pub dropped: usize,
    pub failed: usize,
}

impl ProcessReport {
    pub fn merge(&mut self, other: ProcessReport) {
        self.accepted += other.accepted;
        self.dropped += other.dropped;
        self.failed += other.failed;
    }
}

/// Validates incoming records and hands them to the stores.
#[derive(Debug, Clone)]
pub struct Processor {
    spans: SpanStore,
    metrics: MetricStore,
}

impl Processor {
    pub fn new(spans: SpanStore, metrics: MetricStore) -> Self {
        Self { spans, metrics }
    }

    pub fn span_store(&self) -> &SpanStore {
        &self.spans
    }

    pub fn metric_store(&self) -> &MetricStore {
        &self.metrics
    }

    pub fn process_spans(&self, spans: Vec<Span>) -> ProcessReport {
        let mut report = ProcessReport::default();
        for mut span in spans {
            if span.trace_id.is_empty() || span.span_id.is_empty() {
                debug!(
                    trace_id = %span.trace_id,
                    span_id = %span.span_id,
                    "dropping span without ids"
                );
                report.dropped += 1;
                continue;
            }
            span.calculate_duration();

            let trace_id = span.trace_id.clone();
            let span_id = span.span_id.clone();
            match self.spans.store(span) {
                Ok(()) => report.accepted += 1,
                Err(err) => {
                    warn!(error = ?err, %trace_id, %span_id, "failed to store span");
                    report.failed += 1;
                }
            }
        }
        report
    }

    pub fn process_metrics(&self, metrics: Vec<Metric>) -> ProcessReport {
        let mut report = ProcessReport::default();
        for metric in metrics {
            if metric.name.is_empty() {
                debug!(service = %metric.service, "dropping metric without name");
                report.dropped += 1;
                continue;
            }

            let name = metric.name.clone();
            match self.metrics.store(metric) {
                Ok(()) => report.accepted += 1,
                Err(err) => {
                    warn!(error = ?err, metric = %name, "failed to store metric");
                    report.failed += 1;
                }
            }
        }
        report
    }
}
