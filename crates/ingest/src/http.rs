use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use omnitrace_core::model::metric::MetricBatch;
use omnitrace_core::model::span::SpanBatch;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;

use crate::forward::Forwarder;
use crate::pipeline::Pipeline;

#[derive(Clone)]
pub struct IngestState {
    pub pipeline: Pipeline,
    pub forwarder: Option<Forwarder>,
}

pub fn router(state: IngestState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers(Any);
    Router::new()
        .route("/api/v1/spans", post(ingest_spans))
        .route("/api/v1/metrics", post(ingest_metrics))
        .layer(cors)
        .layer(
            TraceLayer::new_for_http()
                .on_request(tower_http::trace::DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .with_state(state)
}

async fn ingest_spans(State(state): State<IngestState>, body: Bytes) -> Response {
    let batch = match decode_records(&body, "spans") {
        Ok(spans) => SpanBatch { spans },
        Err(resp) => return resp,
    };
    tracing::debug!(count = batch.spans.len(), "span batch accepted");
    if let Some(forwarder) = &state.forwarder {
        forwarder.submit_spans(batch.clone());
    }
    state.pipeline.submit_spans(batch.spans).await;
    accepted()
}

async fn ingest_metrics(State(state): State<IngestState>, body: Bytes) -> Response {
    let batch = match decode_records(&body, "metrics") {
        Ok(metrics) => MetricBatch { metrics },
        Err(resp) => return resp,
    };
    tracing::debug!(count = batch.metrics.len(), "metric batch accepted");
    if let Some(forwarder) = &state.forwarder {
        forwarder.submit_metrics(batch.clone());
    }
    state.pipeline.submit_metrics(batch.metrics).await;
    accepted()
}

/// Decodes `{"<signal>": [...]}` record by record. Only a broken envelope is a 400;
/// records that fail to decode are dropped.
fn decode_records<T: DeserializeOwned>(body: &[u8], signal: &str) -> Result<Vec<T>, Response> {
    let mut envelope: Map<String, Value> = serde_json::from_slice(body)
        .map_err(|err| bad_request(signal, &err.to_string()))?;
    let raw = match envelope.remove(signal) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(bad_request(signal, &format!("`{signal}` must be an array"))),
    };

    let total = raw.len();
    let records: Vec<T> = raw
        .into_iter()
        .enumerate()
        .filter_map(|(index, item)| {
            serde_json::from_value(item)
                .inspect_err(|err| {
                    tracing::debug!(error = %err, signal, index, "dropping undecodable record");
                })
                .ok()
        })
        .collect();
    let dropped = total - records.len();
    if dropped > 0 {
        tracing::warn!(dropped, total, signal, "dropped undecodable records");
    }
    Ok(records)
}

fn bad_request(signal: &str, err: &str) -> Response {
    tracing::warn!(error = %err, signal, "malformed ingest payload");
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": format!("invalid {signal} payload: {err}") })),
    )
        .into_response()
}

fn accepted() -> Response {
    (
        StatusCode::ACCEPTED,
        Json(json!({ "status": "accepted" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use omnitrace_store::{MetricStore, SpanStore};
    use testkit::{base_time, sample_metrics, sample_trace};
    use tower::ServiceExt;

    use super::*;
    use crate::pipeline::PipelineConfig;
    use crate::processor::Processor;

    fn app() -> (Router, SpanStore, MetricStore) {
        let spans = SpanStore::new();
        let metrics = MetricStore::new();
        let pipeline = Pipeline::new(
            Processor::new(spans.clone(), metrics.clone()),
            PipelineConfig {
                channel_capacity: 8,
                flush_interval: Duration::from_millis(10),
                batch_size: 1,
            },
        );
        let router = router(IngestState {
            pipeline,
            forwarder: None,
        });
        (router, spans, metrics)
    }

    fn post_json(uri: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn spans_are_accepted_and_stored() {
        let (app, spans, _) = app();
        let body = serde_json::to_vec(&SpanBatch {
            spans: sample_trace("t1", base_time()),
        })
        .unwrap();

        let resp = app.oneshot(post_json("/api/v1/spans", body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["status"], "accepted");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(spans.get_trace("t1").unwrap().unwrap().span_count, 2);
    }

    #[tokio::test]
    async fn metrics_are_accepted_and_stored() {
        let (app, _, metrics) = app();
        let body = serde_json::to_vec(&MetricBatch {
            metrics: sample_metrics("cpu", "api", base_time(), 4),
        })
        .unwrap();

        let resp = app
            .oneshot(post_json("/api/v1/metrics", body))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(metrics.stats().unwrap().points, 4);
    }

    #[tokio::test]
    async fn malformed_json_is_bad_request() {
        let (app, spans, _) = app();
        let resp = app
            .oneshot(post_json("/api/v1/spans", b"{\"spans\": [".to_vec()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(spans.stats().unwrap().spans, 0);
    }

    #[tokio::test]
    async fn undecodable_spans_are_dropped_and_the_rest_stored() {
        let (app, spans, _) = app();
        let mut records: Vec<serde_json::Value> = sample_trace("t1", base_time())
            .iter()
            .map(|span| serde_json::to_value(span).unwrap())
            .collect();
        let mut missing_trace_id = records[0].clone();
        missing_trace_id.as_object_mut().unwrap().remove("trace_id");
        let mut unknown_kind = records[1].clone();
        unknown_kind["trace_id"] = json!("t2");
        unknown_kind["kind"] = json!("sideways");
        records.push(missing_trace_id);
        records.push(unknown_kind);

        let body = serde_json::to_vec(&json!({ "spans": records })).unwrap();
        let resp = app.oneshot(post_json("/api/v1/spans", body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(spans.get_trace("t1").unwrap().unwrap().span_count, 2);
        assert!(spans.get_trace("t2").unwrap().is_none());
        assert_eq!(spans.stats().unwrap().spans, 2);
    }

    #[tokio::test]
    async fn metric_without_value_is_dropped() {
        let (app, _, metrics) = app();
        let mut records: Vec<serde_json::Value> = sample_metrics("cpu", "api", base_time(), 3)
            .iter()
            .map(|m| serde_json::to_value(m).unwrap())
            .collect();
        records[1].as_object_mut().unwrap().remove("value");

        let body = serde_json::to_vec(&json!({ "metrics": records })).unwrap();
        let resp = app
            .oneshot(post_json("/api/v1/metrics", body))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(metrics.stats().unwrap().points, 2);
    }

    #[tokio::test]
    async fn non_array_records_field_is_bad_request() {
        let (app, _, _) = app();
        let resp = app
            .oneshot(post_json("/api/v1/spans", b"{\"spans\": 7}".to_vec()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn wrong_method_is_rejected() {
        let (app, _, _) = app();
        let resp = app
            .oneshot(
                Request::builder()
                    .method(Method::GET)
                    .uri("/api/v1/spans")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn empty_batch_is_accepted() {
        let (app, _, _) = app();
        let resp = app
            .oneshot(post_json("/api/v1/metrics", b"{}".to_vec()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }
}
