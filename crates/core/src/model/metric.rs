use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Counter,
    #[default]
    Gauge,
    Histogram,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metric {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: MetricType,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub service: String,
}

impl Metric {
    pub fn counter(name: impl Into<String>, value: f64, service: impl Into<String>) -> Self {
        Self::now(name, MetricType::Counter, value, service)
    }

    pub fn gauge(name: impl Into<String>, value: f64, service: impl Into<String>) -> Self {
        Self::now(name, MetricType::Gauge, value, service)
    }

    fn now(
        name: impl Into<String>,
        kind: MetricType,
        value: f64,
        service: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            value,
            timestamp: Utc::now(),
            labels: BTreeMap::new(),
            service: service.into(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Per-bucket rollup of one series.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregatedMetric {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub service: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricBatch {
    #[serde(default)]
    pub metrics: Vec<Metric>,
}
