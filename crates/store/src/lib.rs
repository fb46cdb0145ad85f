pub mod metric_store;
pub mod retention;
pub mod span_store;

pub use metric_store::{MetricStore, MetricStoreStats, SeriesKey};
pub use span_store::{SpanStore, SpanStoreStats};
