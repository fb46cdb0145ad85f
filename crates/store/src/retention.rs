use std::time::Duration;

use chrono::{DateTime, Utc};
use omnitrace_core::error::Result;
use omnitrace_core::time::cutoff_for_ttl;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::{MetricStore, SpanStore};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

impl SpanStore {
    pub fn evict_expired(&self, ttl: Duration) -> Result<usize> {
        self.evict_before(cutoff_for_ttl(Utc::now(), ttl))
    }

    /// Removes every trace whose earliest span started before `cutoff`.
    pub fn evict_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut index = self.write()?;
        let expired: Vec<String> = index
            .traces
            .iter()
            .filter(|(_, spans)| {
                spans
                    .iter()
                    .map(|s| s.start_time)
                    .min()
                    .is_some_and(|earliest| earliest < cutoff)
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut removed = 0;
        for trace_id in &expired {
            if index.remove_trace(trace_id) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn spawn_sweeper(&self, interval: Duration, ttl: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(MIN_SWEEP_INTERVAL));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match store.evict_expired(ttl) {
                    Ok(0) => {}
                    Ok(removed) => tracing::info!(removed, "evicted expired traces"),
                    Err(err) => tracing::warn!(error = ?err, "span sweep failed"),
                }
            }
        })
    }
}

impl MetricStore {
    pub fn evict_expired(&self, ttl: Duration) -> Result<usize> {
        self.evict_before(cutoff_for_ttl(Utc::now(), ttl))
    }

    /// Drops points older than `cutoff` and deletes series left empty.
    pub fn evict_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut index = self.write()?;
        let mut removed = 0;
        index.series.retain(|_, points| {
            let stale = points.partition_point(|m| m.timestamp < cutoff);
            points.drain(..stale);
            removed += stale;
            !points.is_empty()
        });
        Ok(removed)
    }

    pub fn spawn_sweeper(&self, interval: Duration, ttl: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(MIN_SWEEP_INTERVAL));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match store.evict_expired(ttl) {
                    Ok(0) => {}
                    Ok(removed) => tracing::info!(removed, "evicted expired metric points"),
                    Err(err) => tracing::warn!(error = ?err, "metric sweep failed"),
                }
            }
        })
    }
}
