use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

pub const DEFAULT_ADDR: &str = "http://127.0.0.1:10001";

/// Talks to a running collector's dashboard API.
pub struct DashboardClient {
    http: reqwest::Client,
    base: String,
}

impl DashboardClient {
    /// `--addr`, then `OMNITRACE_ADDR`, then the default local port. A bare `host:port` gets `http://`.
    pub fn connect(addr: Option<String>) -> anyhow::Result<Self> {
        let addr = addr
            .or_else(|| std::env::var("OMNITRACE_ADDR").ok())
            .unwrap_or_else(|| DEFAULT_ADDR.to_string());
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            base: normalize_base(&addr),
        })
    }

    /// GETs `path` with query pairs; `None` values are left out.
    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, Option<String>)],
    ) -> anyhow::Result<T> {
        self.get_optional(path, params)
            .await?
            .with_context(|| format!("{path} not found"))
    }

    /// Like [`DashboardClient::get`] but maps 404 to `None`.
    pub async fn get_optional<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, Option<String>)],
    ) -> anyhow::Result<Option<T>> {
        let query: Vec<(&str, &str)> = params
            .iter()
            .filter_map(|(k, v)| v.as_deref().map(|v| (*k, v)))
            .collect();
        let url = format!("{}{}", self.base, path);
        let resp = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .with_context(|| format!("connect collector at {}", self.base))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
                .unwrap_or(body);
            anyhow::bail!("collector returned {status}: {message}");
        }
        let value = resp
            .json::<T>()
            .await
            .with_context(|| format!("decode response from {path}"))?;
        Ok(Some(value))
    }
}

pub fn normalize_base(addr: &str) -> String {
    let addr = addr.trim().trim_end_matches('/');
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}
