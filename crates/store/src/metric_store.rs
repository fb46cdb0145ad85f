use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use omnitrace_core::deadline::QueryDeadline;
use omnitrace_core::error::{OmniError, Result};
use omnitrace_core::model::metric::{AggregatedMetric, Metric};
use omnitrace_core::query::MetricQuery;
use serde::{Deserialize, Serialize};

/// Identity of one time series. Labels are part of the key so that
/// series differing only by labels stay apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub name: String,
    pub service: String,
    pub labels: BTreeMap<String, String>,
}

impl SeriesKey {
    pub fn of(metric: &Metric) -> Self {
        Self {
            name: metric.name.clone(),
            service: metric.service.clone(),
            labels: metric.labels.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct MetricIndex {
    pub(crate) series: HashMap<SeriesKey, Vec<Metric>>,
}

#[derive(Debug, Clone, Default)]
pub struct MetricStore {
    inner: Arc<RwLock<MetricIndex>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricStoreStats {
    pub series: usize,
    pub points: usize,
    pub names: usize,
}

impl MetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, MetricIndex>> {
        self.inner
            .read()
            .map_err(|e| OmniError::Store(format!("metric index lock poisoned: {e}")))
    }

    pub(crate) fn write(&self) -> Result<RwLockWriteGuard<'_, MetricIndex>> {
        self.inner
            .write()
            .map_err(|e| OmniError::Store(format!("metric index lock poisoned: {e}")))
    }

    pub fn store(&self, metric: Metric) -> Result<()> {
        let mut index = self.write()?;
        index.insert(metric);
        Ok(())
    }

    pub fn store_batch(&self, metrics: Vec<Metric>) -> Result<()> {
        if metrics.is_empty() {
            return Ok(());
        }
        let mut index = self.write()?;
        for metric in metrics {
            index.insert(metric);
        }
        Ok(())
    }

    /// Buckets matching points by `step` and aggregates each non-empty bucket.
    pub fn query_metrics(
        &self,
        query: &MetricQuery,
        deadline: &QueryDeadline,
    ) -> Result<Vec<AggregatedMetric>> {
        query.validate()?;
        deadline.check("query_metrics")?;
        let step_ms = query.step_ms();

        let index = self.read()?;
        let mut selected: Vec<(&SeriesKey, &Vec<Metric>)> = index
            .series
            .iter()
            .filter(|(key, _)| query.selects(&key.name, &key.service, &key.labels))
            .collect();
        selected.sort_by(|a, b| a.0.cmp(b.0));

        let mut out = Vec::new();
        for (key, points) in selected {
            deadline.check("query_metrics")?;

            let first = points.partition_point(|m| m.timestamp < query.start_time);
            let mut current: Option<AggregatedMetric> = None;
            for point in points[first..]
                .iter()
                .take_while(|m| m.timestamp <= query.end_time)
            {
                let bucket_ms = bucket_start_ms(point.timestamp, step_ms);
                if let Some(agg) = current
                    .as_mut()
                    .filter(|agg| agg.start_time.timestamp_millis() == bucket_ms)
                {
                    agg.count += 1;
                    agg.sum += point.value;
                    agg.min = agg.min.min(point.value);
                    agg.max = agg.max.max(point.value);
                    continue;
                }
                if let Some(done) = current.take() {
                    out.push(finish_bucket(done));
                }
                current = Some(open_bucket(key, bucket_ms, step_ms, point.value)?);
            }
            if let Some(done) = current {
                out.push(finish_bucket(done));
            }
        }

        tracing::debug!(name = %query.name, buckets = out.len(), "metric query finished");
        Ok(out)
    }

    pub fn metric_names(&self) -> Result<Vec<String>> {
        let index = self.read()?;
        let mut names: Vec<String> = index.series.keys().map(|k| k.name.clone()).collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    pub fn stats(&self) -> Result<MetricStoreStats> {
        let index = self.read()?;
        let mut names: Vec<&str> = index.series.keys().map(|k| k.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        Ok(MetricStoreStats {
            series: index.series.len(),
            points: index.series.values().map(Vec::len).sum(),
            names: names.len(),
        })
    }
}

impl MetricIndex {
    /// Keeps each series ordered by timestamp; equal timestamps keep arrival order.
    fn insert(&mut self, metric: Metric) {
        let points = self.series.entry(SeriesKey::of(&metric)).or_default();
        match points.last() {
            Some(last) if last.timestamp > metric.timestamp => {
                let at = points.partition_point(|m| m.timestamp <= metric.timestamp);
                points.insert(at, metric);
            }
            _ => points.push(metric),
        }
    }
}

fn bucket_start_ms(ts: DateTime<Utc>, step_ms: i64) -> i64 {
    let ms = ts.timestamp_millis();
    ms - ms.rem_euclid(step_ms)
}

fn open_bucket(
    key: &SeriesKey,
    bucket_ms: i64,
    step_ms: i64,
    value: f64,
) -> Result<AggregatedMetric> {
    let start_time = DateTime::<Utc>::from_timestamp_millis(bucket_ms)
        .ok_or_else(|| {
            OmniError::InvalidArgument(format!(
                "step {step_ms}ms puts bucket start out of range: {bucket_ms}"
            ))
        })?;
    let end_time = DateTime::<Utc>::from_timestamp_millis(bucket_ms.saturating_add(step_ms))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    Ok(AggregatedMetric {
        name: key.name.clone(),
        labels: key.labels.clone(),
        service: key.service.clone(),
        start_time,
        end_time,
        count: 1,
        sum: value,
        min: value,
        max: value,
        avg: value,
    })
}

fn finish_bucket(mut agg: AggregatedMetric) -> AggregatedMetric {
    if agg.count > 0 {
        agg.avg = agg.sum / agg.count as f64;
    }
    agg
}
