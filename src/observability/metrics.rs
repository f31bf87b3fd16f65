//! Runner Metrics
//!
//! Counters for module runs, served as JSON.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionTimeStats {
    pub count: u64,
    pub avg_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub runs_total: u64,
    pub runs_failed: u64,
    /// Requests that never reached the sandbox (unknown module, storage errors).
    pub lookups_failed: u64,
    pub runs_per_module: BTreeMap<String, u64>,
    pub errors_per_kind: BTreeMap<String, u64>,
    pub execution_time: ExecutionTimeStats,
    pub spans_truncated: u64,
    pub spans_filtered: u64,
    pub rejected_guest_calls: u64,
}

#[derive(Default)]
pub struct RunnerMetrics {
    inner: Mutex<MetricsSnapshot>,
}

impl RunnerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_run(&self, module_name: &str, elapsed: Duration) {
        let mut m = self.inner.lock();
        m.runs_total += 1;
        *m.runs_per_module.entry(module_name.to_string()).or_insert(0) += 1;

        let ms = elapsed.as_secs_f64() * 1000.0;
        let stats = &mut m.execution_time;
        stats.count += 1;
        stats.avg_ms += (ms - stats.avg_ms) / stats.count as f64;
        if ms > stats.max_ms {
            stats.max_ms = ms;
        }
    }

    pub fn record_error(&self, kind: &str) {
        let mut m = self.inner.lock();
        m.runs_failed += 1;
        *m.errors_per_kind.entry(kind.to_string()).or_insert(0) += 1;
    }

    /// Counts a request that failed before any module ran. It is not a run,
    /// so `runs_failed` never exceeds `runs_total`.
    pub fn record_lookup_failure(&self, kind: &str) {
        let mut m = self.inner.lock();
        m.lookups_failed += 1;
        *m.errors_per_kind.entry(kind.to_string()).or_insert(0) += 1;
    }

    pub fn record_trace(&self, truncated: usize, filtered: usize, rejected_calls: u64) {
        let mut m = self.inner.lock();
        m.spans_truncated += truncated as u64;
        m.spans_filtered += filtered as u64;
        m.rejected_guest_calls += rejected_calls;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().clone()
    }
}
