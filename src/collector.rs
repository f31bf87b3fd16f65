//! Trace Collector
//!
//! Creates the `TraceContext` for each execution and finalizes it exactly
//! once: force-close, filter, host metadata, correlation. Finalized traces
//! are handed to the exporter passed in at construction.

use crate::error::{Result, SandtraceError};
use crate::exporter::BatchExporter;
use crate::span::{Clock, SpanFilter, SpanId, TraceContext, TraceId};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error};

pub const META_HTTP_URL: &str = "http.url";
pub const META_HTTP_STATUS: &str = "http.status_code";
pub const META_CLIENT_IP: &str = "http.client_ip";
pub const META_MODULE: &str = "module.name";
pub const META_ERROR: &str = "execution.error";

/// Host-side facts merged into a trace at finalization.
#[derive(Debug, Clone, Default)]
pub struct HostContext {
    pub end_time: u64,
    pub metadata: BTreeMap<String, String>,
    pub parent_trace_id: Option<TraceId>,
    pub parent_span_id: Option<SpanId>,
}

impl HostContext {
    pub fn new(end_time: u64) -> Self {
        Self {
            end_time,
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_parent(mut self, parent: Option<TraceId>) -> Self {
        self.parent_trace_id = parent;
        self
    }

    /// The caller's span; only applied together with a parent trace id.
    pub fn with_parent_span(mut self, parent: Option<SpanId>) -> Self {
        self.parent_span_id = parent;
        self
    }
}

/// Outcome of one finalization, for logging and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizeSummary {
    pub truncated: usize,
    pub filtered: usize,
    pub retained: usize,
}

pub struct TraceCollector {
    filter: SpanFilter,
    max_spans: usize,
    clock: Arc<dyn Clock>,
    exporter: Arc<BatchExporter>,
}

impl TraceCollector {
    pub fn new(filter: SpanFilter, max_spans: usize, clock: Arc<dyn Clock>, exporter: Arc<BatchExporter>) -> Self {
        Self {
            filter,
            max_spans,
            clock,
            exporter,
        }
    }

    pub fn exporter(&self) -> &Arc<BatchExporter> {
        &self.exporter
    }

    /// Starts the trace for one execution of `module_name`.
    pub fn begin(&self, module_name: &str) -> TraceContext {
        TraceContext::new(format!("module:{}", module_name), self.filter, self.clock.now_micros())
            .with_max_spans(self.max_spans)
    }

    pub fn finalize(&self, trace: &mut TraceContext, host: HostContext) -> Result<FinalizeSummary> {
        if trace.state() != crate::span::TraceState::Collecting {
            return Err(SandtraceError::AlreadyFinalized(trace.trace_id().to_string()));
        }
        if host.parent_trace_id.is_some() && trace.is_correlated() {
            return Err(SandtraceError::AlreadyFinalized(trace.trace_id().to_string()));
        }

        let truncated = trace.force_close_open_spans(host.end_time);
        let filtered = trace.apply_filter();
        trace.merge_metadata(host.metadata);
        if let Some(parent) = host.parent_trace_id {
            trace.correlate(parent, host.parent_span_id)?;
        }
        trace.mark_finalized();

        Ok(FinalizeSummary {
            truncated,
            filtered,
            retained: trace.span_count(),
        })
    }

    /// Finalizes and submits. A finalize failure is an invariant violation:
    /// it is logged and the trace is discarded rather than exported twice.
    pub fn complete(&self, mut trace: TraceContext, host: HostContext) -> Option<FinalizeSummary> {
        match self.finalize(&mut trace, host) {
            Ok(summary) => {
                debug!(
                    trace_id = %trace.trace_id(),
                    truncated = summary.truncated,
                    filtered = summary.filtered,
                    retained = summary.retained,
                    "trace finalized"
                );
                self.exporter.submit(trace);
                Some(summary)
            }
            Err(e) => {
                error!(trace_id = %trace.trace_id(), error = %e, "trace finalization invariant violated");
                None
            }
        }
    }
}
