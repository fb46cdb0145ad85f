use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OmniError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub http_addr: String,
    pub span_ttl: Duration,
    pub metric_ttl: Duration,
    pub span_sweep_interval: Duration,
    pub metric_sweep_interval: Duration,
    pub query_timeout: Duration,
    pub request_timeout: Duration,
    pub write_batch_size: usize,
    pub write_flush_ms: u64,
    pub forward_endpoint: Option<String>,
    pub forward_compression: String,
    pub forward_headers: Vec<(String, String)>,
    pub forward_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:10001".to_string(),
            span_ttl: Duration::from_secs(60 * 60 * 24),
            metric_ttl: Duration::from_secs(60 * 60 * 24 * 7),
            span_sweep_interval: Duration::from_secs(5 * 60),
            metric_sweep_interval: Duration::from_secs(10 * 60),
            query_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            write_batch_size: 512,
            write_flush_ms: 100,
            forward_endpoint: None,
            forward_compression: "none".to_string(),
            forward_headers: Vec::new(),
            forward_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut cfg = Self::default();
        let config_path = config_file_path();
        if let Some(file_overrides) = load_file_overrides(&config_path)? {
            apply_overrides(&mut cfg, file_overrides, "config file")?;
        }
        let env_overrides = env_overrides_from(|key| env::var(key).ok())?;
        apply_overrides(&mut cfg, env_overrides, "environment")?;
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        let env_overrides = env_overrides_from(|key| env::var(key).ok())?;
        apply_overrides(&mut cfg, env_overrides, "environment")?;
        Ok(cfg)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigOverrides {
    http_addr: Option<String>,
    span_ttl: Option<String>,
    metric_ttl: Option<String>,
    span_sweep_interval: Option<String>,
    metric_sweep_interval: Option<String>,
    query_timeout: Option<String>,
    request_timeout: Option<String>,
    write_batch_size: Option<usize>,
    write_flush_ms: Option<u64>,
    forward_endpoint: Option<String>,
    forward_compression: Option<String>,
    forward_headers: Option<String>,
    forward_timeout: Option<String>,
}

fn config_file_path() -> PathBuf {
    if let Ok(path) = env::var("OMNITRACE_CONFIG") {
        return PathBuf::from(path);
    }

    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let config_home = env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(home).join(".config"));
    config_home.join("omnitrace/config.toml")
}

fn load_file_overrides(path: &Path) -> Result<Option<ConfigOverrides>> {
    if !path.exists() {
        return Ok(None);
    }

    let raw = fs::read_to_string(path)
        .map_err(|e| OmniError::Config(format!("failed reading {}: {e}", path.display())))?;
    let parsed: ConfigOverrides = toml::from_str(&raw)
        .map_err(|e| OmniError::Config(format!("failed parsing {}: {e}", path.display())))?;
    Ok(Some(parsed))
}

fn env_overrides_from(lookup: impl Fn(&str) -> Option<String>) -> Result<ConfigOverrides> {
    let http_addr = match lookup("OMNITRACE_HTTP_ADDR") {
        Some(addr) => Some(addr),
        None => match (lookup("OMNITRACE_HOST"), lookup("OMNITRACE_PORT")) {
            (None, None) => None,
            (host, port) => {
                let port = match port {
                    Some(p) => p.trim().parse::<u16>().map_err(|e| {
                        OmniError::Config(format!("bad OMNITRACE_PORT in environment: {e}"))
                    })?,
                    None => 10001,
                };
                Some(format!(
                    "{}:{port}",
                    host.unwrap_or_else(|| "0.0.0.0".to_string())
                ))
            }
        },
    };

    Ok(ConfigOverrides {
        http_addr,
        span_ttl: lookup("OMNITRACE_SPAN_TTL"),
        metric_ttl: lookup("OMNITRACE_METRIC_TTL"),
        span_sweep_interval: lookup("OMNITRACE_SPAN_SWEEP_INTERVAL"),
        metric_sweep_interval: lookup("OMNITRACE_METRIC_SWEEP_INTERVAL"),
        query_timeout: lookup("OMNITRACE_QUERY_TIMEOUT"),
        request_timeout: lookup("OMNITRACE_REQUEST_TIMEOUT"),
        write_batch_size: None,
        write_flush_ms: None,
        forward_endpoint: lookup("OMNITRACE_FORWARD_ENDPOINT"),
        forward_compression: lookup("OMNITRACE_FORWARD_COMPRESSION"),
        forward_headers: lookup("OMNITRACE_FORWARD_HEADERS"),
        forward_timeout: lookup("OMNITRACE_FORWARD_TIMEOUT"),
    })
}

fn parse_config_duration(field: &str, value: &str, source: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim())
        .map_err(|e| OmniError::Config(format!("bad {field} in {source}: {e} (value={value})")))
}

fn apply_overrides(cfg: &mut Config, overrides: ConfigOverrides, source: &str) -> Result<()> {
    if let Some(v) = overrides.http_addr {
        cfg.http_addr = v;
    }
    if let Some(v) = overrides.span_ttl {
        cfg.span_ttl = parse_config_duration("span_ttl", &v, source)?;
    }
    if let Some(v) = overrides.metric_ttl {
        cfg.metric_ttl = parse_config_duration("metric_ttl", &v, source)?;
    }
    if let Some(v) = overrides.span_sweep_interval {
        cfg.span_sweep_interval = parse_config_duration("span_sweep_interval", &v, source)?;
    }
    if let Some(v) = overrides.metric_sweep_interval {
        cfg.metric_sweep_interval = parse_config_duration("metric_sweep_interval", &v, source)?;
    }
    if let Some(v) = overrides.query_timeout {
        cfg.query_timeout = parse_config_duration("query_timeout", &v, source)?;
    }
    if let Some(v) = overrides.request_timeout {
        cfg.request_timeout = parse_config_duration("request_timeout", &v, source)?;
    }
    if let Some(v) = overrides.write_batch_size {
        if v == 0 {
            return Err(OmniError::Config(format!(
                "write_batch_size in {source} must be positive"
            )));
        }
        cfg.write_batch_size = v;
    }
    if let Some(v) = overrides.write_flush_ms {
        cfg.write_flush_ms = v;
    }
    if let Some(v) = overrides.forward_endpoint {
        cfg.forward_endpoint = Some(v);
    }
    if let Some(v) = overrides.forward_compression {
        cfg.forward_compression = v;
    }
    if let Some(v) = overrides.forward_headers {
        cfg.forward_headers = parse_header_list(&v).map_err(|e| {
            OmniError::Config(format!("bad forward_headers in {source}: {e} (value={v})"))
        })?;
    }
    if let Some(v) = overrides.forward_timeout {
        cfg.forward_timeout = parse_config_duration("forward_timeout", &v, source)?;
    }
    Ok(())
}

/// Parses `key=value,key2=value2` header lists.
pub fn parse_header_list(raw: &str) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for entry in raw.split(',') {
        let trimmed = entry.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            return Err(OmniError::Config(
                "header entries must use key=value syntax".to_string(),
            ));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(OmniError::Config("header key cannot be empty".to_string()));
        }
        out.push((key.to_string(), value.trim().to_string()));
    }
    Ok(out)
}

/// Settings for instrumented applications.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SdkConfig {
    pub service_name: String,
    pub collector_url: String,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub sample_rate: f64,
    pub enabled: bool,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown-service".to_string(),
            collector_url: "http://localhost:10001".to_string(),
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
            sample_rate: 1.0,
            enabled: true,
        }
    }
}

impl SdkConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(v) = lookup("OMNITRACE_SERVICE_NAME") {
            cfg.service_name = v;
        }
        if let Some(v) = lookup("OMNITRACE_COLLECTOR_URL") {
            cfg.collector_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = lookup("OMNITRACE_BATCH_SIZE") {
            cfg.batch_size = v.trim().parse::<usize>().map_err(|e| {
                OmniError::Config(format!("bad OMNITRACE_BATCH_SIZE in environment: {e}"))
            })?;
        }
        if let Some(v) = lookup("OMNITRACE_FLUSH_INTERVAL") {
            cfg.flush_interval =
                parse_config_duration("OMNITRACE_FLUSH_INTERVAL", &v, "environment")?;
        }
        if let Some(v) = lookup("OMNITRACE_SAMPLE_RATE") {
            let rate = v.trim().parse::<f64>().map_err(|e| {
                OmniError::Config(format!("bad OMNITRACE_SAMPLE_RATE in environment: {e}"))
            })?;
            cfg.sample_rate = rate.clamp(0.0, 1.0);
        }
        if let Some(v) = lookup("OMNITRACE_ENABLED") {
            cfg.enabled = !matches!(v.trim(), "0" | "false" | "off");
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_has_expected_values() {
        let cfg = Config::default();
        assert_eq!(cfg.http_addr, "0.0.0.0:10001");
        assert_eq!(cfg.span_ttl, Duration::from_secs(86_400));
        assert_eq!(cfg.metric_ttl, Duration::from_secs(7 * 86_400));
        assert_eq!(cfg.span_sweep_interval, Duration::from_secs(300));
        assert_eq!(cfg.metric_sweep_interval, Duration::from_secs(600));
    }

    #[test]
    fn host_and_port_compose_http_addr() {
        let overrides = env_overrides_from(lookup(&[
            ("OMNITRACE_HOST", "127.0.0.1"),
            ("OMNITRACE_PORT", "9000"),
        ]))
        .unwrap();
        assert_eq!(overrides.http_addr.as_deref(), Some("127.0.0.1:9000"));

        let explicit = env_overrides_from(lookup(&[
            ("OMNITRACE_HTTP_ADDR", "127.0.0.1:1"),
            ("OMNITRACE_PORT", "9000"),
        ]))
        .unwrap();
        assert_eq!(explicit.http_addr.as_deref(), Some("127.0.0.1:1"));

        assert!(env_overrides_from(lookup(&[("OMNITRACE_PORT", "x")])).is_err());
    }

    #[test]
    fn env_durations_apply() {
        let mut cfg = Config::default();
        let overrides = env_overrides_from(lookup(&[
            ("OMNITRACE_SPAN_TTL", "1h"),
            ("OMNITRACE_QUERY_TIMEOUT", "250ms"),
        ]))
        .unwrap();
        apply_overrides(&mut cfg, overrides, "environment").unwrap();
        assert_eq!(cfg.span_ttl, Duration::from_secs(3600));
        assert_eq!(cfg.query_timeout, Duration::from_millis(250));
    }

    #[test]
    fn bad_duration_names_source() {
        let mut cfg = Config::default();
        let overrides = env_overrides_from(lookup(&[("OMNITRACE_METRIC_TTL", "soon")])).unwrap();
        let err = apply_overrides(&mut cfg, overrides, "environment").unwrap_err();
        assert!(err.to_string().contains("metric_ttl in environment"));
    }

    #[test]
    fn parse_header_list_accepts_list() {
        let headers = parse_header_list("x-tenant=dev,authorization=Bearer token").unwrap();
        assert_eq!(
            headers,
            vec![
                ("x-tenant".to_string(), "dev".to_string()),
                ("authorization".to_string(), "Bearer token".to_string())
            ]
        );
    }

    #[test]
    fn parse_header_list_rejects_bad_entries() {
        assert!(parse_header_list("x-tenant").is_err());
        assert!(parse_header_list("=dev").is_err());
    }

    #[test]
    fn file_overrides_parse_from_toml() {
        let parsed: ConfigOverrides = toml::from_str(
            r#"
            http_addr = "127.0.0.1:10002"
            write_batch_size = 64
            forward_endpoint = "http://upstream:10001"
            forward_compression = "gzip"
            forward_headers = "x-tenant=dev"
            forward_timeout = "3s"
            "#,
        )
        .unwrap();
        let mut cfg = Config::default();
        apply_overrides(&mut cfg, parsed, "config file").unwrap();
        assert_eq!(cfg.http_addr, "127.0.0.1:10002");
        assert_eq!(cfg.write_batch_size, 64);
        assert_eq!(
            cfg.forward_endpoint.as_deref(),
            Some("http://upstream:10001")
        );
        assert_eq!(cfg.forward_compression, "gzip");
        assert_eq!(
            cfg.forward_headers,
            vec![("x-tenant".to_string(), "dev".to_string())]
        );
        assert_eq!(cfg.forward_timeout, Duration::from_secs(3));
    }

    #[test]
    fn zero_batch_size_rejected() {
        let mut cfg = Config::default();
        let overrides = ConfigOverrides {
            write_batch_size: Some(0),
            ..ConfigOverrides::default()
        };
        assert!(apply_overrides(&mut cfg, overrides, "config file").is_err());
    }

    #[test]
    fn sdk_config_from_lookup() {
        let cfg = SdkConfig::from_lookup(lookup(&[
            ("OMNITRACE_SERVICE_NAME", "checkout"),
            ("OMNITRACE_COLLECTOR_URL", "http://collector:10001/"),
            ("OMNITRACE_BATCH_SIZE", "10"),
            ("OMNITRACE_FLUSH_INTERVAL", "2s"),
            ("OMNITRACE_SAMPLE_RATE", "1.5"),
        ]))
        .unwrap();
        assert_eq!(cfg.service_name, "checkout");
        assert_eq!(cfg.collector_url, "http://collector:10001");
        assert_eq!(cfg.batch_size, 10);
        assert_eq!(cfg.flush_interval, Duration::from_secs(2));
        assert_eq!(cfg.sample_rate, 1.0);
        assert!(cfg.enabled);
    }

    #[test]
    fn sdk_config_rejects_bad_rate() {
        assert!(SdkConfig::from_lookup(lookup(&[("OMNITRACE_SAMPLE_RATE", "half")])).is_err());
    }
}
