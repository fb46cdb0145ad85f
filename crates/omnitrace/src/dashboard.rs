//! Read-only JSON API over the span and metric stores.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use omnitrace_core::OmniError;
use omnitrace_core::deadline::QueryDeadline;
use omnitrace_core::model::metric::AggregatedMetric;
use omnitrace_core::model::trace::{Trace, TraceSummary};
use omnitrace_core::query::{MetricQuery, StatusResponse, TraceQuery, parse_labels};
use omnitrace_core::time::{parse_duration_str, parse_time_or_relative};
use omnitrace_store::{MetricStore, SpanStore};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

pub const DEFAULT_TRACE_LIMIT: usize = 50;
const DEFAULT_METRIC_WINDOW: Duration = Duration::from_secs(60 * 60);
const DEFAULT_METRIC_STEP: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct DashboardState {
    pub spans: SpanStore,
    pub metrics: MetricStore,
    pub query_timeout: Duration,
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);
    Router::new()
        .route("/api/traces", get(list_traces))
        .route("/api/traces/{id}", get(get_trace))
        .route("/api/metrics", get(query_metrics))
        .route("/api/metrics/names", get(metric_names))
        .route("/api/services", get(list_services))
        .route("/api/status", get(status))
        .layer(cors)
        .with_state(state)
}

pub struct ApiError(OmniError);

impl From<OmniError> for ApiError {
    fn from(err: OmniError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            err if err.is_client_error() => StatusCode::BAD_REQUEST,
            OmniError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "dashboard query failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Raw `/api/traces` parameters; everything arrives as text and is parsed here.
#[derive(Debug, Default, Deserialize)]
pub struct TraceParams {
    pub service: Option<String>,
    pub operation: Option<String>,
    pub error: Option<bool>,
    pub min_duration: Option<String>,
    pub max_duration: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl TraceParams {
    pub fn into_query(self) -> omnitrace_core::Result<TraceQuery> {
        Ok(TraceQuery {
            service: non_empty(self.service),
            operation: non_empty(self.operation),
            min_duration: parse_opt_duration(self.min_duration)?,
            max_duration: parse_opt_duration(self.max_duration)?,
            start_time: parse_opt_time(self.start)?,
            end_time: parse_opt_time(self.end)?,
            has_error: self.error,
            limit: self.limit.unwrap_or(DEFAULT_TRACE_LIMIT),
            offset: self.offset.unwrap_or(0),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct MetricParams {
    pub name: Option<String>,
    pub service: Option<String>,
    pub labels: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub step: Option<String>,
}

impl MetricParams {
    pub fn into_query(self, now: DateTime<Utc>) -> omnitrace_core::Result<MetricQuery> {
        let name = non_empty(self.name)
            .ok_or_else(|| OmniError::InvalidArgument("metric name is required".to_string()))?;
        let labels = match non_empty(self.labels) {
            Some(raw) => parse_labels(&raw)?,
            None => Default::default(),
        };
        let end_time = parse_opt_time(self.end)?.unwrap_or(now);
        let start_time = match parse_opt_time(self.start)? {
            Some(start) => start,
            None => chrono::Duration::from_std(DEFAULT_METRIC_WINDOW)
                .ok()
                .and_then(|window| end_time.checked_sub_signed(window))
                .ok_or_else(|| {
                    OmniError::InvalidArgument(format!("end time {end_time} leaves no metric window"))
                })?,
        };
        let step = parse_opt_duration(self.step)?.unwrap_or(DEFAULT_METRIC_STEP);

        let query = MetricQuery {
            name,
            labels,
            service: non_empty(self.service),
            start_time,
            end_time,
            step,
        };
        query.validate()?;
        Ok(query)
    }
}

async fn list_traces(
    State(state): State<DashboardState>,
    Query(params): Query<TraceParams>,
) -> ApiResult<Vec<TraceSummary>> {
    let query = params.into_query()?;
    let deadline = QueryDeadline::after(state.query_timeout);
    let spans = state.spans.clone();
    let traces = run_query(move || spans.query_traces(&query, &deadline)).await?;
    Ok(Json(traces))
}

async fn get_trace(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> Result<Json<Trace>, Response> {
    let spans = state.spans.clone();
    let lookup = id.clone();
    match run_query(move || spans.get_trace(&lookup)).await {
        Ok(Some(trace)) => Ok(Json(trace)),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("trace {id} not found") })),
        )
            .into_response()),
        Err(err) => Err(err.into_response()),
    }
}

async fn query_metrics(
    State(state): State<DashboardState>,
    Query(params): Query<MetricParams>,
) -> ApiResult<Vec<AggregatedMetric>> {
    let query = params.into_query(Utc::now())?;
    let deadline = QueryDeadline::after(state.query_timeout);
    let metrics = state.metrics.clone();
    let buckets = run_query(move || metrics.query_metrics(&query, &deadline)).await?;
    Ok(Json(buckets))
}

async fn metric_names(State(state): State<DashboardState>) -> ApiResult<Vec<String>> {
    let metrics = state.metrics.clone();
    Ok(Json(run_query(move || metrics.metric_names()).await?))
}

async fn list_services(State(state): State<DashboardState>) -> ApiResult<Vec<String>> {
    let spans = state.spans.clone();
    Ok(Json(run_query(move || spans.services()).await?))
}

async fn status(State(state): State<DashboardState>) -> ApiResult<StatusResponse> {
    let (spans, metrics) = (state.spans.clone(), state.metrics.clone());
    let response = run_query(move || {
        let span_stats = spans.stats()?;
        let metric_stats = metrics.stats()?;
        Ok(StatusResponse {
            traces: span_stats.traces,
            spans: span_stats.spans,
            services: span_stats.services,
            metric_series: metric_stats.series,
            metric_points: metric_stats.points,
            oldest_span: span_stats.oldest_span,
            newest_span: span_stats.newest_span,
        })
    })
    .await?;
    Ok(Json(response))
}

/// Store scans hold a read lock for their duration, so they run off the async workers.
async fn run_query<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> omnitrace_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| OmniError::Internal(format!("query task failed: {e}")))?
        .map_err(ApiError::from)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_opt_duration(value: Option<String>) -> omnitrace_core::Result<Option<Duration>> {
    non_empty(value).map(|v| parse_duration_str(&v)).transpose()
}

fn parse_opt_time(value: Option<String>) -> omnitrace_core::Result<Option<DateTime<Utc>>> {
    non_empty(value).map(|v| parse_time_or_relative(&v)).transpose()
}
