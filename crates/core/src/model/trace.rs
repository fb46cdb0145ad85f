use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::span::Span;

/// Materialized view over every span sharing a trace id. Rebuilt on each read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trace {
    pub trace_id: String,
    pub root_span: Option<Span>,
    pub spans: Vec<Span>,
    pub services: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(rename = "duration")]
    pub duration_ns: i64,
    pub span_count: usize,
    pub has_error: bool,
}

impl Trace {
    pub fn duration_ms(&self) -> i64 {
        self.duration_ns / 1_000_000
    }

    pub fn to_summary(&self) -> TraceSummary {
        let (root_operation, root_service) = self
            .root_span
            .as_ref()
            .map(|root| (root.operation_name.clone(), root.service_name.clone()))
            .unwrap_or_default();

        TraceSummary {
            trace_id: self.trace_id.clone(),
            root_operation,
            root_service,
            start_time: self.start_time,
            duration_ns: self.duration_ns,
            span_count: self.span_count,
            service_count: self.services.len(),
            has_error: self.has_error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceSummary {
    pub trace_id: String,
    pub root_operation: String,
    pub root_service: String,
    pub start_time: DateTime<Utc>,
    #[serde(rename = "duration")]
    pub duration_ns: i64,
    pub span_count: usize,
    pub service_count: usize,
    pub has_error: bool,
}

impl TraceSummary {
    pub fn duration_ms(&self) -> i64 {
        self.duration_ns / 1_000_000
    }
}
