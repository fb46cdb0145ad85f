use std::io::Write;
use std::time::Duration;

use flate2::Compression;
use flate2::write::GzEncoder;
use omnitrace_core::model::metric::MetricBatch;
use omnitrace_core::model::span::SpanBatch;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use tokio::sync::mpsc;

const FORWARD_ATTEMPTS: u64 = 3;

#[derive(Debug, Clone)]
pub struct ForwardConfig {
    pub endpoint: String,
    pub compression: ForwardCompression,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardCompression {
    None,
    Gzip,
}

impl ForwardCompression {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "gzip" => Self::Gzip,
            _ => Self::None,
        }
    }
}

/// Re-exports accepted batches to an upstream collector in the background.
#[derive(Clone)]
pub struct Forwarder {
    tx: mpsc::Sender<ForwardMsg>,
}

#[derive(Debug)]
enum ForwardMsg {
    Spans(SpanBatch),
    Metrics(MetricBatch),
}

pub fn build_forwarder(cfg: Option<ForwardConfig>) -> Option<Forwarder> {
    let cfg = cfg?;
    let (tx, mut rx) = mpsc::channel::<ForwardMsg>(512);

    tokio::spawn(async move {
        let endpoint = cfg.endpoint.trim_end_matches('/').to_string();
        let client = Client::builder()
            .timeout(cfg.timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = ?e, "failed to build forward http client; using defaults");
                Client::new()
            });
        let headers = build_http_headers(&cfg.headers);
        let compression = cfg.compression;

        while let Some(msg) = rx.recv().await {
            let (path, body) = match &msg {
                ForwardMsg::Spans(batch) => ("api/v1/spans", encode(batch)),
                ForwardMsg::Metrics(batch) => ("api/v1/metrics", encode(batch)),
            };
            let Some(body) = body else {
                continue;
            };
            let url = format!("{endpoint}/{path}");
            forward_http_with_retries(&client, &url, &headers, body, compression).await;
        }
    });

    Some(Forwarder { tx })
}

impl Forwarder {
    /// Never waits on the upstream; a full queue drops the batch with a warning.
    pub fn submit_spans(&self, batch: SpanBatch) {
        self.enqueue(ForwardMsg::Spans(batch));
    }

    pub fn submit_metrics(&self, batch: MetricBatch) {
        self.enqueue(ForwardMsg::Metrics(batch));
    }

    fn enqueue(&self, msg: ForwardMsg) {
        if let Err(err) = self.tx.try_send(msg) {
            tracing::warn!(error = %err, "forward queue rejected batch");
        }
    }
}

fn encode<T: Serialize>(batch: &T) -> Option<Vec<u8>> {
    serde_json::to_vec(batch)
        .map_err(|e| tracing::warn!(error = ?e, "failed to encode forward payload"))
        .ok()
}

async fn forward_http_with_retries(
    client: &Client,
    url: &str,
    headers: &HeaderMap,
    body: Vec<u8>,
    compression: ForwardCompression,
) {
    let Ok((body, content_encoding)) = maybe_compress_http_body(body, compression) else {
        tracing::warn!(url = %url, "failed to compress forward HTTP payload");
        return;
    };

    for attempt in 0..FORWARD_ATTEMPTS {
        let mut req = client
            .post(url)
            .header("content-type", "application/json")
            .headers(headers.clone());
        if let Some(encoding) = content_encoding {
            req = req.header("content-encoding", encoding);
        }
        match req.body(body.clone()).send().await {
            Ok(resp) if resp.status().is_success() => return,
            Ok(resp) => {
                tracing::debug!(url = %url, status = %resp.status(), attempt, "forward rejected");
            }
            Err(err) => {
                tracing::debug!(url = %url, error = %err, attempt, "forward request failed");
            }
        }
        tokio::time::sleep(Duration::from_millis(30 * (attempt + 1))).await;
    }
    tracing::warn!(url = %url, "forward HTTP attempt failed after retries");
}

fn build_http_headers(headers: &[(String, String)]) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (k, v) in headers {
        let name = HeaderName::try_from(k.as_str());
        let value = HeaderValue::try_from(v.as_str());
        match (name, value) {
            (Ok(name), Ok(value)) => {
                out.insert(name, value);
            }
            _ => {
                tracing::warn!(header = %k, "ignored invalid forward HTTP header");
            }
        }
    }
    out
}

fn maybe_compress_http_body(
    body: Vec<u8>,
    compression: ForwardCompression,
) -> std::io::Result<(Vec<u8>, Option<&'static str>)> {
    match compression {
        ForwardCompression::None => Ok((body, None)),
        ForwardCompression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&body)?;
            let compressed = encoder.finish()?;
            Ok((compressed, Some("gzip")))
        }
    }
}
