//! Module Runner
//!
//! Ties storage, the sandbox engine and the trace collector together for one
//! `/run` request. The whole execute-finalize-submit sequence runs on a
//! blocking worker, so a caller that stops waiting still produces a trace.

use crate::collector::{HostContext, TraceCollector, META_CLIENT_IP, META_ERROR, META_HTTP_STATUS, META_HTTP_URL, META_MODULE};
use crate::error::{ExecutionErrorKind, Result, SandtraceError};
use crate::observability::{RunLogEntry, RunLogger, RunnerMetrics};
use crate::sandbox::{ExecutionRequest, SandboxEngine};
use crate::span::{SpanId, TraceId};
use crate::storage::ModuleStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub module_name: String,
    pub stdin: Vec<u8>,
    pub request_url: String,
    pub client_addr: Option<String>,
    pub parent_trace_id: Option<TraceId>,
    pub parent_span_id: Option<SpanId>,
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub stdout: Vec<u8>,
    pub trace_id: TraceId,
    pub elapsed: Duration,
}

struct Outcome {
    stdout: Vec<u8>,
    error: Option<SandtraceError>,
    trace_id: TraceId,
    elapsed: Duration,
    truncated: Option<usize>,
    retained: Option<usize>,
}

pub struct ModuleRunner {
    store: Arc<dyn ModuleStore>,
    engine: Arc<SandboxEngine>,
    collector: Arc<TraceCollector>,
    metrics: Arc<RunnerMetrics>,
    run_log: Arc<RunLogger>,
}

impl ModuleRunner {
    pub fn new(
        store: Arc<dyn ModuleStore>,
        engine: Arc<SandboxEngine>,
        collector: Arc<TraceCollector>,
        metrics: Arc<RunnerMetrics>,
        run_log: Arc<RunLogger>,
    ) -> Self {
        Self {
            store,
            engine,
            collector,
            metrics,
            run_log,
        }
    }

    pub fn collector(&self) -> &Arc<TraceCollector> {
        &self.collector
    }

    pub fn metrics(&self) -> &Arc<RunnerMetrics> {
        &self.metrics
    }

    pub fn run_log(&self) -> &Arc<RunLogger> {
        &self.run_log
    }

    pub async fn upload(&self, name: &str, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Err(SandtraceError::InvalidUpload("uploaded module is empty".to_string()));
        }
        self.store.store(name, bytes).await?;
        info!(module = name, bytes = bytes.len(), "module uploaded");
        Ok(())
    }

    pub async fn run(&self, request: RunRequest) -> Result<RunOutput> {
        let module_bytes = match self.store.load(&request.module_name).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.metrics.record_lookup_failure(e.kind());
                return Err(e);
            }
        };

        let engine = self.engine.clone();
        let collector = self.collector.clone();
        let metrics = self.metrics.clone();
        let stdin_bytes = request.stdin.len();
        let module_name = request.module_name.clone();
        let client_addr = request.client_addr.clone();

        let worker = tokio::task::spawn_blocking(move || {
            execute_and_submit(&engine, &collector, &metrics, request, module_bytes)
        });
        let outcome = match worker.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(module = %module_name, error = %e, "execution worker failed");
                let err = SandtraceError::execution(ExecutionErrorKind::Trap, format!("execution worker failed: {}", e));
                self.metrics.record_run(&module_name, Duration::ZERO);
                self.metrics.record_error(err.kind());
                return Err(err);
            }
        };

        let entry = RunLogEntry {
            timestamp: Utc::now(),
            run_id: uuid::Uuid::new_v4().to_string(),
            module_name: module_name.clone(),
            trace_id: outcome.trace_id.to_string(),
            client_ip: client_addr,
            execution_time_ms: outcome.elapsed.as_millis() as u64,
            stdin_bytes,
            stdout_bytes: outcome.stdout.len(),
            success: outcome.error.is_none(),
            error_kind: outcome.error.as_ref().map(|e| e.kind().to_string()),
            error_message: outcome.error.as_ref().map(|e| e.to_string()),
            spans_retained: outcome.retained,
            spans_truncated: outcome.truncated,
        };
        if let Err(e) = self.run_log.log_run(entry) {
            warn!(error = %e, "failed to record run");
        }

        match outcome.error {
            None => {
                info!(
                    module = %module_name,
                    trace_id = %outcome.trace_id,
                    elapsed_ms = outcome.elapsed.as_millis() as u64,
                    "module run finished"
                );
                Ok(RunOutput {
                    stdout: outcome.stdout,
                    trace_id: outcome.trace_id,
                    elapsed: outcome.elapsed,
                })
            }
            Some(err) => {
                warn!(
                    module = %module_name,
                    trace_id = %outcome.trace_id,
                    kind = err.kind(),
                    error = %err,
                    "module run failed"
                );
                Err(err)
            }
        }
    }
}

fn execute_and_submit(
    engine: &SandboxEngine,
    collector: &TraceCollector,
    metrics: &RunnerMetrics,
    request: RunRequest,
    module_bytes: Vec<u8>,
) -> Outcome {
    let trace = collector.begin(&request.module_name);
    let report = engine.execute(ExecutionRequest {
        module_name: request.module_name.clone(),
        module_bytes,
        stdin: request.stdin,
        args: vec![request.module_name.clone()],
        trace,
    });

    metrics.record_run(&request.module_name, report.elapsed);
    if let Some(err) = &report.error {
        metrics.record_error(err.kind());
    }

    let status = report.error.as_ref().map_or(200, |e| e.status_code());
    let mut host = HostContext::new(report.ended_at)
        .with_metadata(META_HTTP_URL, request.request_url)
        .with_metadata(META_HTTP_STATUS, status.to_string())
        .with_metadata(META_MODULE, request.module_name.as_str())
        .with_parent(request.parent_trace_id)
        .with_parent_span(request.parent_span_id);
    if let Some(addr) = request.client_addr {
        host = host.with_metadata(META_CLIENT_IP, addr);
    }
    if let Some(err) = &report.error {
        host = host.with_metadata(META_ERROR, err.kind());
    }

    let trace_id = request.parent_trace_id.unwrap_or_else(|| report.trace.trace_id());
    let summary = collector.complete(report.trace, host);
    if let Some(summary) = summary {
        metrics.record_trace(summary.truncated, summary.filtered, report.rejected_calls);
    }

    Outcome {
        stdout: report.stdout,
        error: report.error,
        trace_id,
        elapsed: report.elapsed,
        truncated: summary.map(|s| s.truncated),
        retained: summary.map(|s| s.retained),
    }
}
