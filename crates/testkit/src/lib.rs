use chrono::{DateTime, Duration, TimeZone, Utc};
use omnitrace_core::model::metric::{Metric, MetricType};
use omnitrace_core::model::span::{Span, SpanKind, SpanStatus};

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap()
}

/// A finished span offset from `base` by millisecond bounds.
#[allow(clippy::too_many_arguments)]
pub fn span_at(
    base: DateTime<Utc>,
    trace_id: &str,
    span_id: &str,
    parent: Option<&str>,
    service: &str,
    operation: &str,
    start_ms: i64,
    end_ms: i64,
) -> Span {
    let mut span = Span::new(
        trace_id,
        span_id,
        operation,
        service,
        base + Duration::milliseconds(start_ms),
    );
    span.parent_span_id = parent.map(str::to_string);
    span.finish(base + Duration::milliseconds(end_ms));
    span
}

/// Two-service trace: `api` root with a failing `db` child, 1.8s long.
pub fn sample_trace(trace_id: &str, base: DateTime<Utc>) -> Vec<Span> {
    let mut root = span_at(base, trace_id, "root", None, "api", "GET /v1/orders", 0, 1800);
    root.kind = SpanKind::Server;
    root.add_tag("http.method", "GET");
    root.add_tag("http.status_code", "500");
    root.set_status(SpanStatus::Error, Some("upstream failed".into()));

    let mut child = span_at(
        base,
        trace_id,
        "child",
        Some("root"),
        "db",
        "SELECT orders",
        900,
        1600,
    );
    child.kind = SpanKind::Client;
    child.add_tag("db.system", "postgres");
    child.add_log(
        base + Duration::milliseconds(1200),
        [("event".to_string(), "timeout".to_string())]
            .into_iter()
            .collect(),
    );
    child.set_error("context deadline exceeded", "timeout", vec![]);

    vec![root, child]
}

/// `count` gauge points one second apart starting at `base`, values 1..=count.
pub fn sample_metrics(
    name: &str,
    service: &str,
    base: DateTime<Utc>,
    count: usize,
) -> Vec<Metric> {
    (0..count)
        .map(|i| Metric {
            name: name.to_string(),
            kind: MetricType::Gauge,
            value: (i + 1) as f64,
            timestamp: base + Duration::seconds(i as i64),
            labels: [("route".to_string(), "/v1/orders".to_string())]
                .into_iter()
                .collect(),
            service: service.to_string(),
        })
        .collect()
}
