use std::collections::{BTreeMap, HashMap};
use std::io::IsTerminal;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use omnitrace_core::ids::{new_span_id, new_trace_id};
use omnitrace_core::model::span::{Span, SpanStatus};
use omnitrace_store::SpanStore;
use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::trace::{self as sdktrace, SdkTracerProvider};
use tokio::sync::mpsc;
use tracing::{Event, Id, Subscriber};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const SELF_SERVICE: &str = "omnitrace";
const SELF_FLUSH_BATCH: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfObserveMode {
    Off,
    Store,
    Both,
}

impl SelfObserveMode {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        match lookup("OMNITRACE_SELF_OBSERVE")
            .unwrap_or_else(|| "off".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "1" | "true" | "yes" | "on" | "store" => Self::Store,
            "both" => Self::Both,
            _ => Self::Off,
        }
    }

    pub fn uses_store(self) -> bool {
        matches!(self, Self::Store | Self::Both)
    }
}

/// Owns the OTLP provider, if one was installed, until shutdown.
#[must_use]
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    pub fn shutdown(mut self) {
        if let Some(provider) = self.provider.take()
            && let Err(err) = provider.shutdown()
        {
            eprintln!("omnitrace: otlp provider shutdown failed: {err}");
        }
    }
}

pub fn init_cli_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .compact()
        .try_init();
}

/// Installs fmt logging plus optional OTLP export and self-observation into `spans`.
pub fn init_run_tracing(self_observe: SelfObserveMode, spans: SpanStore) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .compact();

    let (otlp_layer, provider) = match build_otlp_layer() {
        Some((layer, provider)) => (Some(layer), Some(provider)),
        None => (None, None),
    };
    let store_layer = self_observe
        .uses_store()
        .then(|| SelfObserveLayer::new(spans));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otlp_layer)
        .with(store_layer)
        .try_init();

    TelemetryGuard { provider }
}

fn build_otlp_layer<S>() -> Option<(OpenTelemetryLayer<S, sdktrace::Tracer>, SdkTracerProvider)>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;

    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .build()
    {
        Ok(exporter) => exporter,
        Err(err) => {
            eprintln!("omnitrace: otlp exporter disabled: {err}");
            return None;
        }
    };

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .build();
    let tracer = provider.tracer(SELF_SERVICE);
    Some((tracing_opentelemetry::layer().with_tracer(tracer), provider))
}

/// Records the collector's own tracing spans as model spans in the span store.
#[derive(Clone)]
struct SelfObserveLayer {
    tx: mpsc::UnboundedSender<Span>,
    open: Arc<Mutex<HashMap<u64, Span>>>,
}

impl SelfObserveLayer {
    fn new(store: SpanStore) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Span>();
        tokio::spawn(async move {
            let mut buf = Vec::with_capacity(SELF_FLUSH_BATCH);
            while rx.recv_many(&mut buf, SELF_FLUSH_BATCH).await > 0 {
                if let Err(err) = store.store_batch(std::mem::take(&mut buf)) {
                    eprintln!("omnitrace: self-observe store failed: {err}");
                }
            }
        });

        Self {
            tx,
            open: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn with_open<R>(&self, id: u64, f: impl FnOnce(&mut Span) -> R) -> Option<R> {
        let mut open = self.open.lock().ok()?;
        open.get_mut(&id).map(f)
    }
}

impl<S> Layer<S> for SelfObserveLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &tracing::span::Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let parent_id = attrs
            .parent()
            .map(Id::into_u64)
            .or_else(|| ctx.lookup_current().map(|s| s.id().into_u64()));
        let parent = parent_id.and_then(|pid| {
            self.with_open(pid, |p| (p.trace_id.clone(), p.span_id.clone()))
        });

        let (trace_id, parent_span_id) = match parent {
            Some((trace_id, span_id)) => (trace_id, Some(span_id)),
            None => (new_trace_id(), None),
        };

        let mut span = Span::new(
            trace_id,
            new_span_id(),
            attrs.metadata().name(),
            SELF_SERVICE,
            Utc::now(),
        );
        span.parent_span_id = parent_span_id;

        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        span.tags.extend(visitor.fields);

        if let Ok(mut open) = self.open.lock() {
            open.insert(id.into_u64(), span);
        }
    }

    fn on_record(&self, id: &Id, values: &tracing::span::Record<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        values.record(&mut visitor);
        self.with_open(id.into_u64(), |span| span.tags.extend(visitor.fields));
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        if event.metadata().target().starts_with("omnitrace::telemetry") {
            return;
        }
        let Some(current) = ctx.lookup_current() else {
            return;
        };

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        let level = *event.metadata().level();
        let mut fields = visitor.fields;
        fields.insert("level".to_string(), level.to_string());
        if let Some(message) = visitor.message.clone() {
            fields.insert("message".to_string(), message);
        }

        self.with_open(current.id().into_u64(), |span| {
            span.add_log(Utc::now(), fields);
            if level == tracing::Level::ERROR {
                let message = visitor
                    .message
                    .unwrap_or_else(|| event.metadata().name().to_string());
                span.set_status(SpanStatus::Error, Some(message));
            }
        });
    }

    fn on_close(&self, id: Id, _ctx: Context<'_, S>) {
        let Some(mut span) = self
            .open
            .lock()
            .ok()
            .and_then(|mut open| open.remove(&id.into_u64()))
        else {
            return;
        };
        span.finish(Utc::now());
        let _ = self.tx.send(span);
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: BTreeMap<String, String>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        if field.name() == "message" {
            self.message = Some(rendered.trim_matches('"').to_string());
            return;
        }
        self.fields.insert(field.name().to_string(), rendered);
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
            return;
        }
        self.fields
            .insert(field.name().to_string(), value.to_string());
    }
}
