//! OTLP/HTTP exporter.
//!
//! Converts finalized traces into OpenTelemetry `SpanData`, keeping the ids
//! and timestamps the collector recorded, and ships them through the
//! `opentelemetry-otlp` HTTP exporter to `{endpoint}/v1/traces`. Trace
//! metadata becomes attributes on the root span.

use crate::error::{Result, SandtraceError};
use crate::exporter::sink::{Batch, TraceExporter};
use crate::span::{Span, TraceContext};
use async_trait::async_trait;
use opentelemetry::trace::{SpanContext, SpanId, SpanKind, Status, TraceFlags, TraceId, TraceState};
use opentelemetry::{InstrumentationScope, KeyValue};
use opentelemetry_otlp::{Protocol, WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::trace::{SpanData, SpanEvents, SpanExporter as _, SpanLinks};
use opentelemetry_sdk::Resource;
use std::borrow::Cow;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const SCOPE_NAME: &str = "sandtrace";

pub struct OtlpHttpExporter {
    inner: opentelemetry_otlp::SpanExporter,
    scope: InstrumentationScope,
    traces_url: String,
}

impl OtlpHttpExporter {
    pub fn new(endpoint: impl Into<String>, service_name: impl Into<String>, timeout: Duration) -> Result<Self> {
        let traces_url = format!("{}/v1/traces", endpoint.into().trim_end_matches('/'));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SandtraceError::Config(format!("Failed to build OTLP client: {}", e)))?;
        let mut inner = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_http_client(client)
            .with_protocol(Protocol::HttpJson)
            .with_endpoint(traces_url.clone())
            .with_timeout(timeout)
            .build()
            .map_err(|e| SandtraceError::Config(format!("Failed to build OTLP exporter: {}", e)))?;
        inner.set_resource(
            &Resource::builder_empty()
                .with_service_name(service_name.into())
                .build(),
        );

        Ok(Self {
            inner,
            scope: scope(),
            traces_url,
        })
    }

    pub fn traces_url(&self) -> &str {
        &self.traces_url
    }
}

fn scope() -> InstrumentationScope {
    InstrumentationScope::builder(SCOPE_NAME)
        .with_version(env!("CARGO_PKG_VERSION"))
        .build()
}

fn system_time(micros: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_micros(micros)
}

fn otel_span_id(id: crate::span::SpanId) -> SpanId {
    SpanId::from_bytes(id.to_bytes())
}

/// Every span of every trace in the batch, in trace then creation order.
pub fn span_data(scope: &InstrumentationScope, batch: &Batch) -> Vec<SpanData> {
    batch
        .traces()
        .iter()
        .flat_map(|trace| trace.spans().map(move |span| to_span_data(scope, trace, span)))
        .collect()
}

fn to_span_data(scope: &InstrumentationScope, trace: &TraceContext, span: &Span) -> SpanData {
    let is_root = span.id == trace.root_span_id();
    let parent = if is_root { trace.remote_parent() } else { span.parent_id };

    let mut attributes: Vec<KeyValue> = span
        .tags
        .iter()
        .map(|t| KeyValue::new(t.key.clone(), t.value.clone()))
        .collect();
    if is_root {
        attributes.extend(
            trace
                .metadata()
                .iter()
                .map(|(k, v)| KeyValue::new(k.clone(), v.clone())),
        );
    }

    let status = if span.tag_value("error") == Some("true") {
        Status::error(span.tag_value("error.message").unwrap_or_default().to_string())
    } else {
        Status::Unset
    };

    SpanData {
        span_context: SpanContext::new(
            TraceId::from_bytes(*trace.trace_id().as_bytes()),
            otel_span_id(span.id),
            TraceFlags::SAMPLED,
            false,
            TraceState::default(),
        ),
        parent_span_id: parent.map_or(SpanId::INVALID, otel_span_id),
        parent_span_is_remote: is_root && parent.is_some(),
        span_kind: SpanKind::Internal,
        name: Cow::Owned(span.name.clone()),
        start_time: system_time(span.start_time),
        end_time: system_time(span.end_time.unwrap_or(span.start_time)),
        attributes,
        dropped_attributes_count: 0,
        events: SpanEvents::default(),
        links: SpanLinks::default(),
        status,
        instrumentation_scope: scope.clone(),
    }
}

#[async_trait]
impl TraceExporter for OtlpHttpExporter {
    fn name(&self) -> &'static str {
        "otlp"
    }

    async fn export(&self, batch: &Batch) -> Result<()> {
        let spans = span_data(&self.scope, batch);
        self.inner
            .export(spans)
            .await
            .map_err(|e| SandtraceError::ExportFailure(format!("OTLP export to {} failed: {}", self.traces_url, e)))
    }
}
