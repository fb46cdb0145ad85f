use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use omnitrace_core::assemble::assemble_trace;
use omnitrace_core::deadline::QueryDeadline;
use omnitrace_core::error::{OmniError, Result};
use omnitrace_core::model::span::Span;
use omnitrace_core::model::trace::{Trace, TraceSummary};
use omnitrace_core::query::TraceQuery;
use serde::{Deserialize, Serialize};

/// Trace groups scanned between deadline checks.
const DEADLINE_CHECK_EVERY: usize = 64;

#[derive(Debug, Default)]
pub(crate) struct SpanIndex {
    pub(crate) traces: HashMap<String, Vec<Span>>,
    pub(crate) by_service: HashMap<String, HashSet<String>>,
}

/// Clonable handle over the shared span index.
#[derive(Debug, Clone, Default)]
pub struct SpanStore {
    inner: Arc<RwLock<SpanIndex>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SpanStoreStats {
    pub traces: usize,
    pub spans: usize,
    pub services: usize,
    pub oldest_span: Option<DateTime<Utc>>,
    pub newest_span: Option<DateTime<Utc>>,
}

impl SpanStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, SpanIndex>> {
        self.inner
            .read()
            .map_err(|e| OmniError::Store(format!("span index lock poisoned: {e}")))
    }

    pub(crate) fn write(&self) -> Result<RwLockWriteGuard<'_, SpanIndex>> {
        self.inner
            .write()
            .map_err(|e| OmniError::Store(format!("span index lock poisoned: {e}")))
    }

    pub fn store(&self, span: Span) -> Result<()> {
        let mut index = self.write()?;
        index.insert(span);
        Ok(())
    }

    pub fn store_batch(&self, spans: Vec<Span>) -> Result<()> {
        if spans.is_empty() {
            return Ok(());
        }
        let mut index = self.write()?;
        for span in spans {
            index.insert(span);
        }
        Ok(())
    }

    /// Assembles the trace from a snapshot of its group; absent traces are `Ok(None)`.
    pub fn get_trace(&self, trace_id: &str) -> Result<Option<Trace>> {
        let group = {
            let index = self.read()?;
            match index.traces.get(trace_id) {
                Some(spans) => spans.clone(),
                None => return Ok(None),
            }
        };
        Ok(assemble_trace(group))
    }

    pub fn query_traces(
        &self,
        query: &TraceQuery,
        deadline: &QueryDeadline,
    ) -> Result<Vec<TraceSummary>> {
        deadline.check("query_traces")?;

        let index = self.read()?;
        let candidates: Vec<&String> = match &query.service {
            Some(service) => index
                .by_service
                .get(service)
                .map(|ids| ids.iter().collect())
                .unwrap_or_default(),
            None => index.traces.keys().collect(),
        };

        let mut out = Vec::new();
        let mut skipped = 0usize;
        for (scanned, trace_id) in candidates.into_iter().enumerate() {
            if scanned > 0 && scanned % DEADLINE_CHECK_EVERY == 0 {
                deadline.check("query_traces")?;
            }

            let Some(group) = index.traces.get(trace_id) else {
                continue;
            };
            if let Some(service) = &query.service
                && !group.iter().any(|s| s.service_name == *service)
            {
                continue;
            }
            let Some(trace) = assemble_trace(group.clone()) else {
                continue;
            };
            if !query.matches(&trace) {
                continue;
            }

            if skipped < query.offset {
                skipped += 1;
                continue;
            }
            out.push(trace.to_summary());
            if query.limit > 0 && out.len() >= query.limit {
                break;
            }
        }

        tracing::debug!(
            matched = out.len(),
            skipped,
            service = query.service.as_deref().unwrap_or(""),
            "trace query finished"
        );
        Ok(out)
    }

    /// Services that currently own at least one trace, sorted.
    pub fn services(&self) -> Result<Vec<String>> {
        let index = self.read()?;
        let mut services: Vec<String> = index
            .by_service
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        services.sort();
        Ok(services)
    }

    pub fn stats(&self) -> Result<SpanStoreStats> {
        let index = self.read()?;
        let mut stats = SpanStoreStats {
            traces: index.traces.len(),
            services: index.by_service.len(),
            ..SpanStoreStats::default()
        };
        for span in index.traces.values().flatten() {
            stats.spans += 1;
            if stats.oldest_span.is_none_or(|ts| span.start_time < ts) {
                stats.oldest_span = Some(span.start_time);
            }
            if stats.newest_span.is_none_or(|ts| span.start_time > ts) {
                stats.newest_span = Some(span.start_time);
            }
        }
        Ok(stats)
    }
}

impl SpanIndex {
    fn insert(&mut self, span: Span) {
        self.by_service
            .entry(span.service_name.clone())
            .or_default()
            .insert(span.trace_id.clone());
        self.traces
            .entry(span.trace_id.clone())
            .or_default()
            .push(span);
    }

    /// Drops a trace group and its service index entries together.
    pub(crate) fn remove_trace(&mut self, trace_id: &str) -> bool {
        let Some(group) = self.traces.remove(trace_id) else {
            return false;
        };
        for span in &group {
            if let Some(ids) = self.by_service.get_mut(&span.service_name) {
                ids.remove(trace_id);
                if ids.is_empty() {
                    self.by_service.remove(&span.service_name);
                }
            }
        }
        true
    }
}
