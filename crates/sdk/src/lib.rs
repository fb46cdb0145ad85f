//! Client-side instrumentation for omnitrace.
//!
//! A [`Tracer`] is built once in the application's composition root and
//! passed around by reference or clone; there is no global tracer. Trace
//! context travels as an explicit [`SpanContext`] value.

pub mod client;
pub mod context;
pub mod errors;
pub mod exporter;
pub mod middleware;
pub mod propagation;
pub mod sampler;
pub mod task;
pub mod tracer;

pub use client::{RequestTimer, TracedClient};
pub use context::SpanContext;
pub use errors::{ErrorRecord, ErrorSeverity};
pub use exporter::{Exporter, ExporterConfig};
pub use middleware::trace_requests;
pub use sampler::{AlwaysSample, NeverSample, ProbabilitySampler, Sampler};
pub use task::spawn_traced;
pub use tracer::{SpanBuilder, Tracer, TracerBuilder};
