pub mod forward;
pub mod http;
pub mod pipeline;
pub mod processor;

pub use forward::{ForwardCompression, ForwardConfig, Forwarder, build_forwarder};
pub use http::{IngestState, router};
pub use pipeline::{Pipeline, PipelineConfig};
pub use processor::{ProcessReport, Processor};
