//! Export destinations for sealed batches.

use crate::error::{Result, SandtraceError};
use crate::span::TraceContext;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

/// A sealed group of finalized traces. Once built its membership never
/// changes, so retries always resend exactly the same traces.
#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub sequence: u64,
    traces: Vec<TraceContext>,
}

impl Batch {
    pub(crate) fn new(sequence: u64, traces: Vec<TraceContext>) -> Self {
        Self { sequence, traces }
    }

    pub fn traces(&self) -> &[TraceContext] {
        &self.traces
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    pub(crate) fn into_traces(self) -> Vec<TraceContext> {
        self.traces
    }
}

/// Destination for sealed batches.
#[async_trait]
pub trait TraceExporter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn export(&self, batch: &Batch) -> Result<()>;
}

/// Writes each trace as one JSON record to the host log.
pub struct LogExporter;

#[async_trait]
impl TraceExporter for LogExporter {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn export(&self, batch: &Batch) -> Result<()> {
        for trace in batch.traces() {
            let body = serde_json::to_string(trace)?;
            info!(
                target: "sandtrace::traces",
                trace_id = %trace.trace_id(),
                spans = trace.span_count(),
                batch = batch.sequence,
                "{}",
                body
            );
        }
        Ok(())
    }
}

/// Keeps every exported batch in memory. Can be told to fail the next N
/// export attempts.
#[derive(Default)]
pub struct InMemoryExporter {
    batches: Mutex<Vec<Batch>>,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
}

impl InMemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(times: usize) -> Self {
        let exporter = Self::default();
        exporter.failures_left.store(times, Ordering::SeqCst);
        exporter
    }

    pub fn batches(&self) -> Vec<Batch> {
        self.batches.lock().clone()
    }

    pub fn traces(&self) -> Vec<TraceContext> {
        self.batches
            .lock()
            .iter()
            .flat_map(|b| b.traces().iter().cloned())
            .collect()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TraceExporter for InMemoryExporter {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn export(&self, batch: &Batch) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SandtraceError::ExportFailure("in-memory exporter told to fail".to_string()));
        }
        self.batches.lock().push(batch.clone());
        Ok(())
    }
}
