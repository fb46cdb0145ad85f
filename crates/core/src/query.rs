use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OmniError, Result};
use crate::model::trace::Trace;

/// Trace search descriptor. `limit == 0` means unlimited; zero durations are unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TraceQuery {
    pub service: Option<String>,
    pub operation: Option<String>,
    pub min_duration: Option<Duration>,
    pub max_duration: Option<Duration>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub has_error: Option<bool>,
    pub limit: usize,
    pub offset: usize,
}

impl TraceQuery {
    /// Every filter except service, which the store checks before assembling.
    pub fn matches(&self, trace: &Trace) -> bool {
        if let Some(start) = self.start_time
            && trace.start_time < start
        {
            return false;
        }
        if let Some(end) = self.end_time
            && trace.end_time > end
        {
            return false;
        }

        let duration = Duration::from_nanos(trace.duration_ns.max(0) as u64);
        if let Some(min) = self.min_duration.filter(|d| !d.is_zero())
            && duration < min
        {
            return false;
        }
        if let Some(max) = self.max_duration.filter(|d| !d.is_zero())
            && duration > max
        {
            return false;
        }

        if let Some(has_error) = self.has_error
            && has_error != trace.has_error
        {
            return false;
        }

        if let (Some(operation), Some(root)) = (&self.operation, &trace.root_span)
            && root.operation_name != *operation
        {
            return false;
        }

        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricQuery {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub service: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub step: Duration,
}

impl MetricQuery {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(OmniError::InvalidArgument("metric name is required".into()));
        }
        if self.step_ms() == 0 {
            return Err(OmniError::InvalidArgument(format!(
                "step must be at least 1ms, got {:?}",
                self.step
            )));
        }
        if self.step.subsec_nanos() % 1_000_000 != 0 {
            return Err(OmniError::InvalidArgument(format!(
                "step must be a whole number of milliseconds, got {:?}",
                self.step
            )));
        }
        if self.end_time < self.start_time {
            return Err(OmniError::InvalidArgument(
                "end time precedes start time".into(),
            ));
        }
        Ok(())
    }

    pub fn step_ms(&self) -> i64 {
        i64::try_from(self.step.as_millis()).unwrap_or(i64::MAX)
    }

    /// Series selection: name equality, service equality when set, labels superset.
    pub fn selects(&self, name: &str, service: &str, labels: &BTreeMap<String, String>) -> bool {
        if name != self.name {
            return false;
        }
        if let Some(want) = &self.service
            && want != service
        {
            return false;
        }
        self.labels
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|have| have == v))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusResponse {
    pub traces: usize,
    pub spans: usize,
    pub services: usize,
    pub metric_series: usize,
    pub metric_points: usize,
    pub oldest_span: Option<DateTime<Utc>>,
    pub newest_span: Option<DateTime<Utc>>,
}

/// Parses `key=value,key2=value2` label selectors.
pub fn parse_labels(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for entry in raw.split(',') {
        let trimmed = entry.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            return Err(OmniError::Parse(format!("invalid label selector: {trimmed}")));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(OmniError::Parse(format!("invalid label selector: {trimmed}")));
        }
        out.insert(key.to_string(), value.trim().to_string());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, TimeZone};

    use super::*;
    use crate::assemble::assemble_trace;
    use crate::model::span::Span;

    fn trace(op: &str, start_ms: i64, end_ms: i64, error: bool) -> Trace {
        let base = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let mut span = Span::new(
            "t1",
            "s1",
            op,
            "api",
            base + ChronoDuration::milliseconds(start_ms),
        );
        if error {
            span.set_error("boom", "error", vec![]);
        }
        span.finish(base + ChronoDuration::milliseconds(end_ms));
        assemble_trace(vec![span]).unwrap()
    }

    #[test]
    fn empty_query_matches_everything() {
        assert!(TraceQuery::default().matches(&trace("GET /", 0, 10, false)));
    }

    #[test]
    fn duration_bounds() {
        let t = trace("GET /", 0, 10, false);
        let min_ok = TraceQuery {
            min_duration: Some(Duration::from_millis(10)),
            ..TraceQuery::default()
        };
        assert!(min_ok.matches(&t));
        let min_bad = TraceQuery {
            min_duration: Some(Duration::from_millis(11)),
            ..TraceQuery::default()
        };
        assert!(!min_bad.matches(&t));
        let max_bad = TraceQuery {
            max_duration: Some(Duration::from_millis(9)),
            ..TraceQuery::default()
        };
        assert!(!max_bad.matches(&t));
        let zero_max = TraceQuery {
            max_duration: Some(Duration::ZERO),
            ..TraceQuery::default()
        };
        assert!(zero_max.matches(&t));
    }

    #[test]
    fn window_uses_containment() {
        let t = trace("GET /", 5, 15, false);
        let base = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let overlapping = TraceQuery {
            start_time: Some(base + ChronoDuration::milliseconds(10)),
            ..TraceQuery::default()
        };
        assert!(!overlapping.matches(&t));
        let containing = TraceQuery {
            start_time: Some(base),
            end_time: Some(base + ChronoDuration::milliseconds(15)),
            ..TraceQuery::default()
        };
        assert!(containing.matches(&t));
    }

    #[test]
    fn error_and_operation_filters() {
        let t = trace("GET /orders", 0, 1, true);
        let errors = TraceQuery {
            has_error: Some(true),
            operation: Some("GET /orders".into()),
            ..TraceQuery::default()
        };
        assert!(errors.matches(&t));
        let ok_only = TraceQuery {
            has_error: Some(false),
            ..TraceQuery::default()
        };
        assert!(!ok_only.matches(&t));
        let other_op = TraceQuery {
            operation: Some("POST /orders".into()),
            ..TraceQuery::default()
        };
        assert!(!other_op.matches(&t));
    }

    #[test]
    fn metric_query_validation() {
        let base = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let mut q = MetricQuery {
            name: "latency".into(),
            labels: BTreeMap::new(),
            service: None,
            start_time: base,
            end_time: base + ChronoDuration::minutes(5),
            step: Duration::from_secs(60),
        };
        assert!(q.validate().is_ok());
        q.step = Duration::ZERO;
        assert!(matches!(q.validate(), Err(OmniError::InvalidArgument(_))));
        q.step = Duration::from_micros(1500);
        assert!(matches!(q.validate(), Err(OmniError::InvalidArgument(_))));
        q.step = Duration::from_millis(1500);
        assert_eq!(q.step_ms(), 1500);
        assert!(q.validate().is_ok());
    }

    #[test]
    fn label_superset_selection() {
        let base = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let q = MetricQuery {
            name: "requests".into(),
            labels: parse_labels("route=/orders").unwrap(),
            service: Some("api".into()),
            start_time: base,
            end_time: base,
            step: Duration::from_secs(1),
        };
        let labels = parse_labels("route=/orders,method=GET").unwrap();
        assert!(q.selects("requests", "api", &labels));
        assert!(!q.selects("requests", "web", &labels));
        assert!(!q.selects("requests", "api", &BTreeMap::new()));
    }

    #[test]
    fn parse_labels_rejects_bad_entries() {
        assert!(parse_labels("route").is_err());
        assert!(parse_labels("=x").is_err());
        assert!(parse_labels("").unwrap().is_empty());
    }
}
