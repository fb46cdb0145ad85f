mod client;
mod dashboard;
mod output;
mod telemetry;

use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use omnitrace_core::config::{Config, SdkConfig};
use omnitrace_core::model::metric::AggregatedMetric;
use omnitrace_core::model::span::SpanKind;
use omnitrace_core::model::trace::{Trace, TraceSummary};
use omnitrace_core::query::StatusResponse;
use omnitrace_core::time::parse_duration_str;
use omnitrace_ingest::{
    ForwardCompression, ForwardConfig, IngestState, Pipeline, PipelineConfig, Processor,
    build_forwarder,
};
use omnitrace_sdk::{Exporter, ExporterConfig, RequestTimer, Tracer};
use omnitrace_store::{MetricStore, SpanStore};
use serde::Serialize;
use tower_http::timeout::TimeoutLayer;

use crate::client::{DashboardClient, normalize_base};
use crate::dashboard::DashboardState;
use crate::output::{
    print_metrics_human, print_names_human, print_status_human, print_trace_human,
    print_traces_human,
};
use crate::telemetry::{SelfObserveMode, init_cli_tracing, init_run_tracing};

#[derive(Parser, Debug)]
#[command(name = "omnitrace")]
#[command(about = "In-memory trace and metric collector")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true)]
    json: bool,

    #[arg(
        long,
        global = true,
        help = "Collector address (default OMNITRACE_ADDR or 127.0.0.1:10001)"
    )]
    addr: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Run the collector: ingest, dashboard API and retention sweeps")]
    Run {
        #[arg(long)]
        http_addr: Option<String>,
        #[arg(long, help = "Span retention, e.g. 24h")]
        span_ttl: Option<String>,
        #[arg(long, help = "Metric retention, e.g. 7d")]
        metric_ttl: Option<String>,
    },
    #[command(about = "List traces")]
    Traces {
        #[arg(long)]
        service: Option<String>,
        #[arg(long)]
        operation: Option<String>,
        #[arg(long, help = "Only traces containing an error")]
        errors: bool,
        #[arg(long, help = "e.g. 250ms")]
        min_duration: Option<String>,
        #[arg(long)]
        max_duration: Option<String>,
        #[arg(long, help = "RFC3339 time or relative duration, e.g. 15m")]
        since: Option<String>,
        #[arg(long)]
        until: Option<String>,
        #[arg(long, default_value_t = dashboard::DEFAULT_TRACE_LIMIT)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    #[command(about = "Show one trace as a span tree")]
    Trace { trace_id: String },
    #[command(about = "Aggregate metric points into time buckets, or list metric names")]
    Metrics {
        name: Option<String>,
        #[arg(long)]
        service: Option<String>,
        #[arg(long, help = "Label selector, e.g. route=/v1/orders,method=GET")]
        labels: Option<String>,
        #[arg(long)]
        since: Option<String>,
        #[arg(long)]
        until: Option<String>,
        #[arg(long, help = "Bucket width, e.g. 1m")]
        step: Option<String>,
    },
    #[command(about = "List services with stored traces")]
    Services,
    #[command(about = "Show store statistics")]
    Status,
    #[command(about = "Send sample traces and metrics through the SDK")]
    Demo {
        #[arg(long)]
        collector_url: Option<String>,
        #[arg(long, default_value_t = 5)]
        traces: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            http_addr,
            span_ttl,
            metric_ttl,
        } => run_server(http_addr, span_ttl, metric_ttl).await,
        Commands::Traces {
            service,
            operation,
            errors,
            min_duration,
            max_duration,
            since,
            until,
            limit,
            offset,
        } => {
            init_cli_tracing();
            let client = DashboardClient::connect(cli.addr)?;
            let traces: Vec<TraceSummary> = client
                .get(
                    "/api/traces",
                    &[
                        ("service", service),
                        ("operation", operation),
                        ("error", errors.then(|| "true".to_string())),
                        ("min_duration", min_duration),
                        ("max_duration", max_duration),
                        ("start", since),
                        ("end", until),
                        ("limit", Some(limit.to_string())),
                        ("offset", Some(offset.to_string())),
                    ],
                )
                .await?;
            print_output(&traces, cli.json, |v| print_traces_human(v))
        }
        Commands::Trace { trace_id } => {
            init_cli_tracing();
            let client = DashboardClient::connect(cli.addr)?;
            let trace: Option<Trace> = client
                .get_optional(&format!("/api/traces/{trace_id}"), &[])
                .await?;
            let Some(trace) = trace else {
                anyhow::bail!("trace {trace_id} not found");
            };
            print_output(&trace, cli.json, print_trace_human)
        }
        Commands::Metrics {
            name,
            service,
            labels,
            since,
            until,
            step,
        } => {
            init_cli_tracing();
            let client = DashboardClient::connect(cli.addr)?;
            let Some(name) = name else {
                let names: Vec<String> = client.get("/api/metrics/names", &[]).await?;
                return print_output(&names, cli.json, |v| print_names_human("metric names", v));
            };
            let buckets: Vec<AggregatedMetric> = client
                .get(
                    "/api/metrics",
                    &[
                        ("name", Some(name)),
                        ("service", service),
                        ("labels", labels),
                        ("start", since),
                        ("end", until),
                        ("step", step),
                    ],
                )
                .await?;
            print_output(&buckets, cli.json, |v| print_metrics_human(v))
        }
        Commands::Services => {
            init_cli_tracing();
            let client = DashboardClient::connect(cli.addr)?;
            let services: Vec<String> = client.get("/api/services", &[]).await?;
            print_output(&services, cli.json, |v| print_names_human("services", v))
        }
        Commands::Status => {
            init_cli_tracing();
            let client = DashboardClient::connect(cli.addr)?;
            let status: StatusResponse = client.get("/api/status", &[]).await?;
            print_output(&status, cli.json, print_status_human)
        }
        Commands::Demo {
            collector_url,
            traces,
        } => {
            init_cli_tracing();
            let collector_url = match collector_url.or(cli.addr) {
                Some(url) => normalize_base(&url),
                None => SdkConfig::from_env().context("load sdk config")?.collector_url,
            };
            run_demo(collector_url, traces, cli.json).await
        }
    }
}

fn print_output<T: Serialize + ?Sized>(
    value: &T,
    json: bool,
    human: impl FnOnce(&T),
) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human(value);
    }
    Ok(())
}

fn apply_run_flags(
    cfg: &mut Config,
    http_addr: Option<String>,
    span_ttl: Option<String>,
    metric_ttl: Option<String>,
) -> anyhow::Result<()> {
    if let Some(v) = http_addr {
        cfg.http_addr = v;
    }
    if let Some(v) = span_ttl {
        cfg.span_ttl = parse_duration_str(&v).context("--span-ttl")?;
    }
    if let Some(v) = metric_ttl {
        cfg.metric_ttl = parse_duration_str(&v).context("--metric-ttl")?;
    }
    Ok(())
}

async fn run_server(
    http_addr: Option<String>,
    span_ttl: Option<String>,
    metric_ttl: Option<String>,
) -> anyhow::Result<()> {
    let mut cfg = Config::load().context("load config")?;
    apply_run_flags(&mut cfg, http_addr, span_ttl, metric_ttl)?;

    let spans = SpanStore::new();
    let metrics = MetricStore::new();
    let telemetry = init_run_tracing(SelfObserveMode::from_env(), spans.clone());

    eprintln!("omnitrace run");
    eprintln!("  http: {}", cfg.http_addr);
    eprintln!(
        "  span ttl: {} (sweep every {})",
        humantime::format_duration(cfg.span_ttl),
        humantime::format_duration(cfg.span_sweep_interval)
    );
    eprintln!(
        "  metric ttl: {} (sweep every {})",
        humantime::format_duration(cfg.metric_ttl),
        humantime::format_duration(cfg.metric_sweep_interval)
    );
    if let Some(endpoint) = &cfg.forward_endpoint {
        eprintln!("  forward: {endpoint} ({})", cfg.forward_compression);
    }
    eprintln!("  tip: run `omnitrace demo` in another shell");

    let processor = Processor::new(spans.clone(), metrics.clone());
    let pipeline = Pipeline::new(
        processor,
        PipelineConfig {
            channel_capacity: 512,
            flush_interval: Duration::from_millis(cfg.write_flush_ms),
            batch_size: cfg.write_batch_size,
        },
    );
    let forwarder = build_forwarder(cfg.forward_endpoint.clone().map(|endpoint| ForwardConfig {
        endpoint,
        compression: ForwardCompression::parse(&cfg.forward_compression),
        headers: cfg.forward_headers.clone(),
        timeout: cfg.forward_timeout,
    }));

    let app = omnitrace_ingest::router(IngestState {
        pipeline,
        forwarder,
    })
    .merge(dashboard::router(DashboardState {
        spans: spans.clone(),
        metrics: metrics.clone(),
        query_timeout: cfg.query_timeout,
    }))
    .layer(TimeoutLayer::new(cfg.request_timeout));

    let listener = tokio::net::TcpListener::bind(&cfg.http_addr)
        .await
        .with_context(|| format!("bind {}", cfg.http_addr))?;
    tracing::info!(addr = %cfg.http_addr, "collector listening");
    let server_task = tokio::spawn(async move { axum::serve(listener, app).await });

    let span_sweeper = spans.spawn_sweeper(cfg.span_sweep_interval, cfg.span_ttl);
    let metric_sweeper = metrics.spawn_sweeper(cfg.metric_sweep_interval, cfg.metric_ttl);

    tokio::select! {
        res = server_task => {
            res?.context("http server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
        }
    }

    span_sweeper.abort();
    metric_sweeper.abort();
    telemetry.shutdown();
    Ok(())
}

/// Emits `count` two-service traces (every third one failing) plus a latency gauge per request.
async fn run_demo(collector_url: String, count: usize, json: bool) -> anyhow::Result<()> {
    let exporter = Exporter::new(ExporterConfig {
        collector_url: collector_url.clone(),
        ..ExporterConfig::default()
    });
    let api = Tracer::builder("demo-api")
        .exporter(exporter.clone())
        .build();
    let db = Tracer::builder("demo-db").exporter(exporter.clone()).build();

    let mut trace_ids = Vec::with_capacity(count);
    for i in 0..count {
        let mut timer = RequestTimer::start("GET /checkout");
        timer.set_tag("route", "/checkout");

        let mut root = api.start_span("GET /checkout");
        root.set_kind(SpanKind::Server)
            .set_tag("http.method", "GET")
            .set_tag("demo.iteration", i.to_string());
        let ctx = root.context();

        let mut query = db.start_child("SELECT cart", &ctx);
        query.set_kind(SpanKind::Client).set_tag("db.system", "postgres");
        tokio::time::sleep(Duration::from_millis(5 + (i as u64 % 4) * 5)).await;
        if i % 3 == 2 {
            let err = std::io::Error::new(std::io::ErrorKind::TimedOut, "cart query timed out");
            query.set_error(&err);
            root.set_tag("http.status_code", "504");
            root.set_error(&err);
        } else {
            root.set_tag("http.status_code", "200");
        }
        query.finish();
        tokio::time::sleep(Duration::from_millis(2)).await;

        trace_ids.push(root.finish().trace_id);
        timer.record(&api);
    }

    exporter
        .shutdown()
        .await
        .with_context(|| format!("export to {collector_url}"))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "collector": collector_url,
                "trace_ids": trace_ids,
            }))?
        );
    } else {
        for id in &trace_ids {
            println!("trace={id}");
        }
        println!("-- sent {} traces to {collector_url} --", trace_ids.len());
    }
    Ok(())
}
