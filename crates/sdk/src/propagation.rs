//! W3C Trace Context (`traceparent`) propagation.

use axum::http::HeaderMap;
use axum::http::header::HeaderValue;
use omnitrace_core::ids::{parse_span_id, parse_trace_id};

use crate::context::SpanContext;

pub const TRACEPARENT_HEADER: &str = "traceparent";

const SAMPLED_FLAG: u8 = 0x01;

/// Reads `traceparent`; malformed or missing headers yield `None`.
pub fn extract(headers: &HeaderMap) -> Option<SpanContext> {
    let raw = headers.get(TRACEPARENT_HEADER)?.to_str().ok()?;
    parse_traceparent(raw)
}

pub fn parse_traceparent(raw: &str) -> Option<SpanContext> {
    let mut parts = raw.trim().split('-');
    let version = parts.next()?;
    let trace_id = parts.next()?;
    let span_id = parts.next()?;
    let flags = parts.next()?;

    if version.len() != 2 || version.eq_ignore_ascii_case("ff") {
        return None;
    }
    let version_num = u8::from_str_radix(version, 16).ok()?;
    // Version 00 has exactly four fields; later versions may append more.
    if version_num == 0 && parts.next().is_some() {
        return None;
    }
    if flags.len() != 2 {
        return None;
    }
    let flags = u8::from_str_radix(flags, 16).ok()?;

    Some(SpanContext::new(
        parse_trace_id(trace_id).ok()?,
        parse_span_id(span_id).ok()?,
        flags & SAMPLED_FLAG != 0,
    ))
}

pub fn format_traceparent(ctx: &SpanContext) -> String {
    let flags = if ctx.sampled { SAMPLED_FLAG } else { 0 };
    format!("00-{}-{}-{flags:02x}", ctx.trace_id, ctx.span_id)
}

pub fn inject(headers: &mut HeaderMap, ctx: &SpanContext) {
    if !ctx.is_valid() {
        return;
    }
    match HeaderValue::from_str(&format_traceparent(ctx)) {
        Ok(value) => {
            headers.insert(TRACEPARENT_HEADER, value);
        }
        Err(err) => tracing::debug!(error = %err, "skipping traceparent injection"),
    }
}
