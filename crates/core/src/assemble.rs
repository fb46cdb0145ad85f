//! Builds a [`Trace`] from the flat span list stored under one trace id.
//!
//! Root selection: among spans without a parent, the one that sorts first by
//! start time wins. The sort is stable, so equal start times keep the order in
//! which the spans were stored. A trace where every span has a parent has no
//! root.

use std::collections::BTreeSet;

use crate::model::span::Span;
use crate::model::trace::Trace;

pub fn assemble_trace(mut spans: Vec<Span>) -> Option<Trace> {
    let first = spans.first()?;
    let trace_id = first.trace_id.clone();

    spans.sort_by_key(|s| s.start_time);

    let services = spans
        .iter()
        .map(|s| s.service_name.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>();

    let root_span = spans.iter().find(|s| s.is_root()).cloned();
    let has_error = spans.iter().any(Span::is_error);

    let start_time = spans.iter().map(|s| s.start_time).min()?;
    let end_time = spans.iter().map(|s| s.end_time).max()?;
    let duration_ns = (end_time - start_time)
        .num_nanoseconds()
        .unwrap_or(i64::MAX)
        .max(0);

    Some(Trace {
        trace_id,
        root_span,
        span_count: spans.len(),
        spans,
        services,
        start_time,
        end_time,
        duration_ns,
        has_error,
    })
}
