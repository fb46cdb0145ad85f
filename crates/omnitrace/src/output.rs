use std::collections::{HashMap, HashSet};
use std::io::IsTerminal;

use chrono::{DateTime, SecondsFormat, Utc};
use omnitrace_core::model::metric::AggregatedMetric;
use omnitrace_core::model::span::Span;
use omnitrace_core::model::trace::{Trace, TraceSummary};
use omnitrace_core::query::StatusResponse;
use owo_colors::OwoColorize;

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn colored() -> bool {
    std::io::stdout().is_terminal()
}

fn status_label(error: bool) -> String {
    match (error, colored()) {
        (true, true) => "ERROR".red().to_string(),
        (true, false) => "ERROR".to_string(),
        (false, true) => "OK".green().to_string(),
        (false, false) => "OK".to_string(),
    }
}

pub fn print_traces_human(v: &[TraceSummary]) {
    for item in v {
        println!(
            "trace={} start={} duration={}ms spans={} services={} status={} root=\"{} {}\"",
            item.trace_id,
            ts(item.start_time),
            item.duration_ms(),
            item.span_count,
            item.service_count,
            status_label(item.has_error),
            item.root_service,
            item.root_operation
        );
    }
    println!("-- {} traces --", v.len());
}

pub fn print_trace_human(v: &Trace) {
    let errors = v.spans.iter().filter(|s| s.is_error()).count();
    println!(
        "TRACE {} duration={}ms spans={} errors={} services={}",
        v.trace_id,
        v.duration_ms(),
        v.span_count,
        errors,
        v.services.join(",")
    );
    print_span_tree(&v.spans);
}

pub fn print_metrics_human(v: &[AggregatedMetric]) {
    for bucket in v {
        let labels = bucket
            .labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "{} service={} labels={{{}}} count={} sum={} min={} max={} avg={:.3}",
            ts(bucket.start_time),
            bucket.service,
            labels,
            bucket.count,
            bucket.sum,
            bucket.min,
            bucket.max,
            bucket.avg
        );
    }
    println!("-- {} buckets --", v.len());
}

pub fn print_names_human(kind: &str, names: &[String]) {
    for name in names {
        println!("{name}");
    }
    println!("-- {} {kind} --", names.len());
}

pub fn print_status_human(v: &StatusResponse) {
    println!(
        "traces={} spans={} services={}",
        v.traces, v.spans, v.services
    );
    println!(
        "metric_series={} metric_points={}",
        v.metric_series, v.metric_points
    );
    if let Some(oldest) = v.oldest_span {
        println!("oldest={}", ts(oldest));
    }
    if let Some(newest) = v.newest_span {
        println!("newest={}", ts(newest));
    }
}

/// Spans indented under their parents; spans whose parent is missing print at the top level.
fn print_span_tree(spans: &[Span]) {
    let known: HashSet<&str> = spans.iter().map(|s| s.span_id.as_str()).collect();
    let mut children: HashMap<Option<&str>, Vec<&Span>> = HashMap::new();
    for span in spans {
        let parent = span
            .parent_span_id
            .as_deref()
            .filter(|p| !p.is_empty() && known.contains(p));
        children.entry(parent).or_default().push(span);
    }
    if let Some(roots) = children.get(&None) {
        for root in roots {
            print_node(root, &children, 0);
        }
    }
}

fn print_node(span: &Span, children: &HashMap<Option<&str>, Vec<&Span>>, depth: usize) {
    let indent = "  ".repeat(depth);
    let (service, status) = if colored() {
        let status = if span.is_error() {
            span.status.as_str().red().to_string()
        } else {
            span.status.as_str().to_string()
        };
        (span.service_name.cyan().to_string(), status)
    } else {
        (span.service_name.clone(), span.status.as_str().to_string())
    };
    println!(
        "{}{} {} ({}ms) {}",
        indent,
        service,
        span.operation_name,
        span.duration_ms(),
        status
    );
    if let Some(info) = &span.error_info {
        println!("{indent}  error[{}]: {}", info.kind, info.message);
    }

    if let Some(kids) = children.get(&Some(span.span_id.as_str())) {
        for child in kids {
            print_node(child, children, depth + 1);
        }
    }
}
