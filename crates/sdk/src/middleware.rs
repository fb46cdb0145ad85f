use axum::extract::{Request, State};
use axum::http::header::{HOST, USER_AGENT};
use axum::middleware::Next;
use axum::response::Response;
use omnitrace_core::model::span::{SpanKind, SpanStatus};

use crate::propagation;
use crate::tracer::Tracer;

/// axum middleware: one server span per request.
///
/// Install with `axum::middleware::from_fn_with_state(tracer, trace_requests)`.
/// Handlers read the request's [`crate::SpanContext`] from extensions to create children.
pub async fn trace_requests(
    State(tracer): State<Tracer>,
    mut req: Request,
    next: Next,
) -> Response {
    let operation = format!("{} {}", req.method(), req.uri().path());
    let mut span = match propagation::extract(req.headers()) {
        Some(parent) => tracer.start_child(operation, &parent),
        None => tracer.start_span(operation),
    };

    span.set_kind(SpanKind::Server)
        .set_tag("http.method", req.method().as_str())
        .set_tag("http.url", req.uri().to_string());
    if let Some(host) = header_str(&req, HOST.as_str()) {
        span.set_tag("http.host", host);
    }
    if let Some(agent) = header_str(&req, USER_AGENT.as_str()) {
        span.set_tag("http.user_agent", agent);
    }

    req.extensions_mut().insert(span.context());
    let response = next.run(req).await;

    let status = response.status();
    span.set_tag("http.status_code", status.as_u16().to_string());
    if status.is_client_error() || status.is_server_error() {
        span.set_tag("error", "true");
        span.set_status(SpanStatus::Error, Some(format!("HTTP {}", status.as_u16())));
    }
    span.finish();
    response
}

fn header_str(req: &Request, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
