//! Trace export: bounded batching queue plus pluggable sinks.

pub mod batch;
pub mod otlp;
pub mod retry;
pub mod sink;

pub use batch::{BatchExporter, ExporterConfig, ExporterStatsSnapshot};
pub use otlp::OtlpHttpExporter;
pub use retry::RetryPolicy;
pub use sink::{Batch, InMemoryExporter, LogExporter, TraceExporter};
