use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::BTreeMap;
use std::error::Error;

use serde::{Deserialize, Serialize};

use crate::tracer::SpanBuilder;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Debug,
    Info,
    Warning,
    #[default]
    Error,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

/// A captured failure, ready to be attached to a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: ErrorSeverity,
    #[serde(default)]
    pub stack: Vec<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl ErrorRecord {
    pub fn new(message: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: kind.into(),
            severity: ErrorSeverity::Error,
            stack: Vec::new(),
            tags: BTreeMap::new(),
        }
    }

    /// Message and type come from `err`; its source chain lands in `error.cause.N` tags.
    pub fn capture<E: Error + ?Sized>(err: &E) -> Self {
        let mut record = Self::new(err.to_string(), short_type_name::<E>());
        let mut source = err.source();
        let mut depth = 0;
        while let Some(cause) = source {
            record
                .tags
                .insert(format!("error.cause.{depth}"), cause.to_string());
            source = cause.source();
            depth += 1;
        }
        record
    }

    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Records the current call stack. Honors `RUST_BACKTRACE`; a disabled
    /// backtrace leaves the stack empty.
    pub fn with_backtrace(mut self) -> Self {
        let bt = Backtrace::capture();
        if bt.status() == BacktraceStatus::Captured {
            self.stack = bt
                .to_string()
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect();
        }
        self
    }

    pub fn attach_to(&self, span: &mut SpanBuilder) {
        span.set_error_details(&self.message, &self.kind, self.stack.clone());
        span.set_tag("error.type", &self.kind);
        span.set_tag("error.severity", self.severity.as_str());
        for (k, v) in &self.tags {
            span.set_tag(k, v);
        }
    }
}

fn short_type_name<E: ?Sized>() -> String {
    let full = std::any::type_name::<E>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}
