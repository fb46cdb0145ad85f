use std::collections::BTreeMap;
use std::error::Error;
use std::sync::Arc;

use chrono::Utc;
use omnitrace_core::config::SdkConfig;
use omnitrace_core::ids::{new_span_id, new_trace_id};
use omnitrace_core::model::metric::Metric;
use omnitrace_core::model::span::{Span, SpanKind, SpanStatus};

use crate::context::SpanContext;
use crate::errors::ErrorRecord;
use crate::exporter::{Exporter, ExporterConfig};
use crate::sampler::{AlwaysSample, ProbabilitySampler, Sampler};

/// Creates spans for one service. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

#[derive(Debug)]
struct TracerInner {
    service_name: String,
    exporter: Option<Exporter>,
    sampler: Arc<dyn Sampler>,
    enabled: bool,
}

pub struct TracerBuilder {
    service_name: String,
    exporter: Option<Exporter>,
    sampler: Arc<dyn Sampler>,
    enabled: bool,
}

impl TracerBuilder {
    pub fn exporter(mut self, exporter: Exporter) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn sampler(mut self, sampler: impl Sampler + 'static) -> Self {
        self.sampler = Arc::new(sampler);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn build(self) -> Tracer {
        Tracer {
            inner: Arc::new(TracerInner {
                service_name: self.service_name,
                exporter: self.exporter,
                sampler: self.sampler,
                enabled: self.enabled,
            }),
        }
    }
}

impl Tracer {
    pub fn builder(service_name: impl Into<String>) -> TracerBuilder {
        TracerBuilder {
            service_name: service_name.into(),
            exporter: None,
            sampler: Arc::new(AlwaysSample),
            enabled: true,
        }
    }

    /// Tracer with an exporter and probability sampler; must run inside a tokio runtime.
    pub fn from_config(cfg: &SdkConfig) -> Self {
        let exporter = Exporter::new(ExporterConfig {
            collector_url: cfg.collector_url.clone(),
            batch_size: cfg.batch_size,
            flush_interval: cfg.flush_interval,
            ..ExporterConfig::default()
        });
        Self::builder(cfg.service_name.clone())
            .exporter(exporter)
            .sampler(ProbabilitySampler::new(cfg.sample_rate))
            .enabled(cfg.enabled)
            .build()
    }

    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    pub fn exporter(&self) -> Option<&Exporter> {
        self.inner.exporter.as_ref()
    }

    /// Starts a new trace.
    pub fn start_span(&self, operation: impl Into<String>) -> SpanBuilder {
        let trace_id = new_trace_id();
        let sampled = self.inner.sampler.should_sample(&trace_id);
        self.open(trace_id, None, operation.into(), sampled, BTreeMap::new())
    }

    /// Continues the trace in `parent`; an invalid parent starts a new trace.
    pub fn start_child(&self, operation: impl Into<String>, parent: &SpanContext) -> SpanBuilder {
        if !parent.is_valid() {
            return self.start_span(operation);
        }
        self.open(
            parent.trace_id.clone(),
            Some(parent.span_id.clone()),
            operation.into(),
            parent.sampled,
            parent.baggage.clone(),
        )
    }

    /// Queues a metric on the exporter, if one is configured and the tracer is enabled.
    pub fn record_metric(&self, metric: Metric) {
        if !self.inner.enabled {
            return;
        }
        if let Some(exporter) = &self.inner.exporter {
            exporter.export_metric(metric);
        }
    }

    fn open(
        &self,
        trace_id: String,
        parent: Option<String>,
        operation: String,
        sampled: bool,
        baggage: BTreeMap<String, String>,
    ) -> SpanBuilder {
        let mut span = Span::new(
            trace_id,
            new_span_id(),
            operation,
            self.inner.service_name.clone(),
            Utc::now(),
        );
        span.parent_span_id = parent;
        SpanBuilder {
            tracer: self.clone(),
            span,
            sampled,
            baggage,
        }
    }
}

/// An in-flight span. `finish` seals it and hands it to the exporter.
#[derive(Debug)]
pub struct SpanBuilder {
    tracer: Tracer,
    span: Span,
    sampled: bool,
    baggage: BTreeMap<String, String>,
}

impl SpanBuilder {
    pub fn set_kind(&mut self, kind: SpanKind) -> &mut Self {
        self.span.kind = kind;
        self
    }

    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.span.add_tag(key, value);
        self
    }

    pub fn set_operation_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.span.operation_name = name.into();
        self
    }

    pub fn set_baggage(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.baggage.insert(key.into(), value.into());
        self
    }

    pub fn log_fields<I, K, V>(&mut self, fields: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let fields = fields
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.span.add_log(Utc::now(), fields);
        self
    }

    pub fn set_status(&mut self, status: SpanStatus, message: Option<String>) -> &mut Self {
        self.span.set_status(status, message);
        self
    }

    pub fn set_error<E: Error + ?Sized>(&mut self, err: &E) -> &mut Self {
        ErrorRecord::capture(err).attach_to(self);
        self
    }

    pub fn record(&mut self, record: ErrorRecord) -> &mut Self {
        record.attach_to(self);
        self
    }

    pub(crate) fn set_error_details(&mut self, message: &str, kind: &str, stack: Vec<String>) {
        self.span.set_error(message, kind, stack);
    }

    pub fn context(&self) -> SpanContext {
        SpanContext {
            trace_id: self.span.trace_id.clone(),
            span_id: self.span.span_id.clone(),
            sampled: self.sampled,
            baggage: self.baggage.clone(),
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn is_sampled(&self) -> bool {
        self.sampled
    }

    /// Seals the span and exports it when the tracer is enabled and the trace sampled.
    pub fn finish(mut self) -> Span {
        self.span.finish(Utc::now());
        let inner = &self.tracer.inner;
        if inner.enabled
            && self.sampled
            && let Some(exporter) = &inner.exporter
        {
            exporter.export_span(self.span.clone());
        }
        self.span
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::NeverSample;

    #[test]
    fn root_span_gets_fresh_ids() {
        let tracer = Tracer::builder("checkout").build();
        let a = tracer.start_span("a");
        let b = tracer.start_span("b");
        assert_eq!(a.span().trace_id.len(), 32);
        assert_eq!(a.span().span_id.len(), 16);
        assert_ne!(a.span().trace_id, b.span().trace_id);
        assert!(a.span().is_root());
        assert_eq!(a.span().service_name, "checkout");
    }

    #[test]
    fn child_continues_parent_trace() {
        let tracer = Tracer::builder("checkout").build();
        let mut parent = tracer.start_span("parent");
        parent.set_baggage("tenant", "acme");
        let ctx = parent.context();

        let child = tracer.start_child("child", &ctx);
        assert_eq!(child.span().trace_id, ctx.trace_id);
        assert_eq!(child.span().parent_span_id.as_deref(), Some(ctx.span_id.as_str()));
        assert_eq!(child.context().baggage("tenant"), Some("acme"));
    }

    #[test]
    fn invalid_parent_starts_new_trace() {
        let tracer = Tracer::builder("checkout").build();
        let child = tracer.start_child("orphan", &SpanContext::default());
        assert!(child.span().is_root());
        assert!(!child.span().trace_id.is_empty());
    }

    #[test]
    fn sampling_decision_is_inherited() {
        let tracer = Tracer::builder("checkout").sampler(NeverSample).build();
        let root = tracer.start_span("root");
        assert!(!root.is_sampled());
        let child = tracer.start_child("child", &root.context());
        assert!(!child.is_sampled());
    }

    #[test]
    fn finish_seals_span() {
        let tracer = Tracer::builder("checkout").build();
        let mut builder = tracer.start_span("work");
        builder
            .set_kind(SpanKind::Client)
            .set_tag("peer", "db")
            .log_fields([("event", "retry")]);
        let span = builder.finish();
        assert_eq!(span.status, SpanStatus::Ok);
        assert!(span.end_time >= span.start_time);
        assert!(span.duration_ns >= 0);
        assert_eq!(span.kind, SpanKind::Client);
        assert_eq!(span.tags["peer"], "db");
        assert_eq!(span.logs[0].fields["event"], "retry");
    }

    #[test]
    fn set_error_marks_span() {
        let tracer = Tracer::builder("checkout").build();
        let mut builder = tracer.start_span("work");
        builder.set_error(&std::io::Error::other("disk full"));
        let span = builder.finish();
        assert_eq!(span.status, SpanStatus::Error);
        assert_eq!(span.status_message.as_deref(), Some("disk full"));
        assert_eq!(span.error_info.as_ref().unwrap().message, "disk full");
        assert_eq!(span.tags["error.severity"], "error");
    }
}
