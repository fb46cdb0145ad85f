use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use omnitrace_core::model::metric::{Metric, MetricType};
use omnitrace_core::model::span::{SpanKind, SpanStatus};
use reqwest::{Client, Request, Response};

use crate::context::SpanContext;
use crate::propagation;
use crate::tracer::Tracer;

/// reqwest client that wraps each request in a client span and injects `traceparent`.
#[derive(Debug, Clone)]
pub struct TracedClient {
    client: Client,
    tracer: Tracer,
}

impl TracedClient {
    pub fn new(tracer: Tracer, timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, tracer })
    }

    pub fn with_client(tracer: Tracer, client: Client) -> Self {
        Self { client, tracer }
    }

    pub fn inner(&self) -> &Client {
        &self.client
    }

    pub async fn execute(
        &self,
        parent: &SpanContext,
        mut request: Request,
    ) -> reqwest::Result<Response> {
        let host = request.url().host_str().unwrap_or_default().to_string();
        let mut span = self
            .tracer
            .start_child(format!("HTTP {} {host}", request.method()), parent);
        span.set_kind(SpanKind::Client)
            .set_tag("http.method", request.method().as_str())
            .set_tag("http.url", request.url().as_str())
            .set_tag("http.host", host.clone())
            .set_tag("peer.service", host);
        propagation::inject(request.headers_mut(), &span.context());

        let started = Instant::now();
        let result = self.client.execute(request).await;
        span.set_tag("http.duration_ms", started.elapsed().as_millis().to_string());

        match &result {
            Ok(resp) => {
                let status = resp.status();
                span.set_tag("http.status_code", status.as_u16().to_string());
                if status.is_client_error() || status.is_server_error() {
                    span.set_tag("error", "true");
                    span.set_status(SpanStatus::Error, Some(format!("HTTP {}", status.as_u16())));
                }
            }
            Err(err) => {
                span.set_tag("error", "true");
                span.set_error(err);
            }
        }
        span.finish();
        result
    }

    pub async fn get(&self, parent: &SpanContext, url: &str) -> reqwest::Result<Response> {
        let request = self.client.get(url).build()?;
        self.execute(parent, request).await
    }
}

/// Times an operation and reports it as a `request_duration_ms` gauge.
#[derive(Debug, Clone)]
pub struct RequestTimer {
    started: Instant,
    operation: String,
    labels: BTreeMap<String, String>,
}

impl RequestTimer {
    pub fn start(operation: impl Into<String>) -> Self {
        Self {
            started: Instant::now(),
            operation: operation.into(),
            labels: BTreeMap::new(),
        }
    }

    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn to_metric(&self, service: &str) -> Metric {
        let mut labels = self.labels.clone();
        labels.insert("operation".to_string(), self.operation.clone());
        Metric {
            name: "request_duration_ms".to_string(),
            kind: MetricType::Gauge,
            value: self.elapsed().as_secs_f64() * 1000.0,
            timestamp: chrono::Utc::now(),
            labels,
            service: service.to_string(),
        }
    }

    pub fn record(&self, tracer: &Tracer) {
        tracer.record_metric(self.to_metric(tracer.service_name()));
    }
}
