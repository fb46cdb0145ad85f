use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    #[default]
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    #[default]
    Unset,
    Ok,
    Error,
}

impl SpanStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpanLog {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorInfo {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stack_trace: Vec<String>,
}

/// One timed unit of work. `duration_ns` travels as `duration` in nanoseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub operation_name: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub kind: SpanKind,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(rename = "duration", default)]
    pub duration_ns: i64,
    #[serde(default)]
    pub status: SpanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<SpanLog>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<ErrorInfo>,
}

impl Span {
    /// An open span: end equals start until [`Span::finish`] is called.
    pub fn new(
        trace_id: impl Into<String>,
        span_id: impl Into<String>,
        operation_name: impl Into<String>,
        service_name: impl Into<String>,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            span_id: span_id.into(),
            parent_span_id: None,
            operation_name: operation_name.into(),
            service_name: service_name.into(),
            kind: SpanKind::Internal,
            start_time,
            end_time: start_time,
            duration_ns: 0,
            status: SpanStatus::Unset,
            status_message: None,
            tags: BTreeMap::new(),
            logs: Vec::new(),
            error_info: None,
        }
    }

    /// A missing parent and an empty parent id both mark a root.
    pub fn is_root(&self) -> bool {
        self.parent_span_id.as_deref().is_none_or(str::is_empty)
    }

    pub fn is_error(&self) -> bool {
        self.status == SpanStatus::Error
    }

    pub fn duration_ms(&self) -> i64 {
        self.duration_ns / 1_000_000
    }

    pub fn calculate_duration(&mut self) {
        self.duration_ns = (self.end_time - self.start_time)
            .num_nanoseconds()
            .unwrap_or(i64::MAX)
            .max(0);
    }

    /// Status only moves forward: `unset` is never re-entered and `error` is terminal.
    pub fn set_status(&mut self, status: SpanStatus, message: Option<String>) {
        let allowed = match (self.status, status) {
            (_, SpanStatus::Unset) => false,
            (SpanStatus::Error, _) => false,
            (SpanStatus::Ok, SpanStatus::Ok) => false,
            _ => true,
        };
        if allowed {
            self.status = status;
            if message.is_some() {
                self.status_message = message;
            }
        }
    }

    pub fn set_error(
        &mut self,
        message: impl Into<String>,
        kind: impl Into<String>,
        stack: Vec<String>,
    ) {
        let message = message.into();
        self.set_status(SpanStatus::Error, Some(message.clone()));
        self.error_info = Some(ErrorInfo {
            message,
            kind: kind.into(),
            stack_trace: stack,
        });
    }

    pub fn add_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
    }

    pub fn add_log(&mut self, timestamp: DateTime<Utc>, fields: BTreeMap<String, String>) {
        self.logs.push(SpanLog { timestamp, fields });
    }

    /// Seals the span: sets the end time, recomputes duration and resolves `unset` to `ok`.
    pub fn finish(&mut self, end_time: DateTime<Utc>) {
        self.end_time = end_time;
        self.calculate_duration();
        if self.status == SpanStatus::Unset {
            self.status = SpanStatus::Ok;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SpanBatch {
    #[serde(default)]
    pub spans: Vec<Span>,
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn finish_seals_duration_and_status() {
        let mut span = Span::new("t1", "s1", "GET /", "api", base());
        span.finish(base() + Duration::milliseconds(25));
        assert_eq!(span.duration_ns, 25_000_000);
        assert_eq!(span.duration_ms(), 25);
        assert_eq!(span.status, SpanStatus::Ok);
    }

    #[test]
    fn finish_keeps_error_status() {
        let mut span = Span::new("t1", "s1", "GET /", "api", base());
        span.set_error("boom", "io", vec![]);
        span.finish(base() + Duration::milliseconds(1));
        assert_eq!(span.status, SpanStatus::Error);
        assert_eq!(span.status_message.as_deref(), Some("boom"));
    }

    #[test]
    fn status_never_reverts() {
        let mut span = Span::new("t1", "s1", "op", "api", base());
        span.set_status(SpanStatus::Ok, None);
        span.set_status(SpanStatus::Unset, None);
        assert_eq!(span.status, SpanStatus::Ok);
        span.set_status(SpanStatus::Error, Some("late failure".into()));
        span.set_status(SpanStatus::Ok, None);
        assert_eq!(span.status, SpanStatus::Error);
    }

    #[test]
    fn negative_clock_skew_clamps_to_zero() {
        let mut span = Span::new("t1", "s1", "op", "api", base());
        span.finish(base() - Duration::milliseconds(5));
        assert_eq!(span.duration_ns, 0);
    }

    #[test]
    fn empty_parent_is_root() {
        let mut span = Span::new("t1", "s1", "op", "api", base());
        assert!(span.is_root());
        span.parent_span_id = Some(String::new());
        assert!(span.is_root());
        span.parent_span_id = Some("s0".into());
        assert!(!span.is_root());
    }

    #[test]
    fn decodes_wire_json() {
        let raw = r#"{
            "trace_id": "t1",
            "span_id": "s1",
            "parent_span_id": "",
            "operation_name": "GET /orders",
            "service_name": "api",
            "kind": "server",
            "start_time": "2026-02-01T00:00:00Z",
            "end_time": "2026-02-01T00:00:00.010Z",
            "duration": 10000000,
            "status": "error",
            "tags": {"http.method": "GET"},
            "logs": [{"timestamp": "2026-02-01T00:00:00.005Z", "fields": {"event": "retry"}}],
            "error_info": {"message": "timeout", "type": "net"}
        }"#;
        let span: Span = serde_json::from_str(raw).unwrap();
        assert!(span.is_root());
        assert_eq!(span.kind, SpanKind::Server);
        assert_eq!(span.status, SpanStatus::Error);
        assert_eq!(span.duration_ms(), 10);
        assert_eq!(span.tags["http.method"], "GET");
        assert_eq!(span.error_info.unwrap().kind, "net");
    }
}
