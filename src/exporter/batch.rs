//! Batching Trace Exporter
//!
//! Finalized traces queue here and leave in sealed batches, either when a
//! full batch is waiting or when the flush interval fires. The queue is
//! bounded: on overflow the oldest queued trace is dropped. Export runs on
//! a background task and never blocks `submit`.

use crate::exporter::retry::RetryPolicy;
use crate::exporter::sink::{Batch, TraceExporter};
use crate::span::{TraceContext, TraceState};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ExporterConfig {
    pub max_batch_size: usize,
    pub max_queue_size: usize,
    pub flush_interval: Duration,
    pub retry: RetryPolicy,
    /// How many dropped traces to keep for inspection.
    pub dead_letter_capacity: usize,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_queue_size: 2048,
            flush_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            dead_letter_capacity: 64,
        }
    }
}

#[derive(Debug, Default)]
struct ExporterStats {
    submitted: AtomicU64,
    exported_traces: AtomicU64,
    exported_batches: AtomicU64,
    dropped_overflow: AtomicU64,
    dropped_export: AtomicU64,
    retries: AtomicU64,
}

/// Point-in-time copy of the exporter counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExporterStatsSnapshot {
    pub submitted: u64,
    pub exported_traces: u64,
    pub exported_batches: u64,
    pub dropped_overflow: u64,
    pub dropped_export: u64,
    pub retries: u64,
    pub queued: u64,
}

struct Shared {
    config: ExporterConfig,
    sink: Arc<dyn TraceExporter>,
    queue: Mutex<VecDeque<TraceContext>>,
    dead_letters: Mutex<VecDeque<TraceContext>>,
    wake: Notify,
    shutdown: watch::Sender<bool>,
    stats: ExporterStats,
    next_sequence: AtomicU64,
}

pub struct BatchExporter {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BatchExporter {
    pub fn new(config: ExporterConfig, sink: Arc<dyn TraceExporter>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                config,
                sink,
                queue: Mutex::new(VecDeque::new()),
                dead_letters: Mutex::new(VecDeque::new()),
                wake: Notify::new(),
                shutdown,
                stats: ExporterStats::default(),
                next_sequence: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ExporterConfig {
        &self.shared.config
    }

    /// Spawns the background flush loop. Must be called inside a tokio
    /// runtime; calling it twice has no effect.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let shared = self.shared.clone();
        let shutdown = self.shared.shutdown.subscribe();
        info!(
            sink = self.shared.sink.name(),
            max_batch_size = self.shared.config.max_batch_size,
            flush_interval_ms = self.shared.config.flush_interval.as_millis() as u64,
            "trace exporter started"
        );
        *worker = Some(tokio::spawn(run(shared, shutdown)));
    }

    /// Queues a finalized trace. Never blocks on export.
    pub fn submit(&self, trace: TraceContext) {
        if trace.state() != TraceState::Finalized {
            error!(trace_id = %trace.trace_id(), state = ?trace.state(), "refusing to export a trace that is not finalized");
            return;
        }

        let (evicted, batch_ready) = {
            let mut queue = self.shared.queue.lock();
            let evicted = if queue.len() >= self.shared.config.max_queue_size {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(trace);
            (evicted, queue.len() >= self.shared.config.max_batch_size)
        };
        self.shared.stats.submitted.fetch_add(1, Ordering::Relaxed);

        if let Some(old) = evicted {
            self.shared.stats.dropped_overflow.fetch_add(1, Ordering::Relaxed);
            warn!(trace_id = %old.trace_id(), "export queue full, dropping oldest trace");
            self.shared.dead_letter(old);
        }
        if batch_ready {
            self.shared.wake.notify_one();
        }
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn stats(&self) -> ExporterStatsSnapshot {
        let s = &self.shared.stats;
        ExporterStatsSnapshot {
            submitted: s.submitted.load(Ordering::Relaxed),
            exported_traces: s.exported_traces.load(Ordering::Relaxed),
            exported_batches: s.exported_batches.load(Ordering::Relaxed),
            dropped_overflow: s.dropped_overflow.load(Ordering::Relaxed),
            dropped_export: s.dropped_export.load(Ordering::Relaxed),
            retries: s.retries.load(Ordering::Relaxed),
            queued: self.queued() as u64,
        }
    }

    /// Removes and returns the retained dropped traces, oldest first.
    pub fn take_dead_letters(&self) -> Vec<TraceContext> {
        self.shared.dead_letters.lock().drain(..).collect()
    }

    /// Exports everything currently queued, in full batches first.
    pub async fn flush(&self) {
        self.shared.flush().await;
    }

    /// Stops the flush loop after a final flush of the queue.
    pub async fn shutdown(&self) {
        let _ = self.shared.shutdown.send(true);
        let handle = self.worker.lock().take();
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    error!(error = %e, "trace exporter task failed");
                }
            }
            None => self.shared.flush().await,
        }
    }
}

impl Shared {
    fn batch_ready(&self) -> bool {
        self.queue.lock().len() >= self.config.max_batch_size
    }

    fn seal_batch(&self) -> Option<Batch> {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            return None;
        }
        let take = queue.len().min(self.config.max_batch_size);
        let traces: Vec<TraceContext> = queue.drain(..take).collect();
        Some(Batch::new(self.next_sequence.fetch_add(1, Ordering::Relaxed), traces))
    }

    async fn flush(&self) {
        while let Some(batch) = self.seal_batch() {
            self.send(batch).await;
        }
    }

    async fn send(&self, batch: Batch) {
        let result = self
            .config
            .retry
            .retry(
                || self.sink.export(&batch),
                |attempt, e| {
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    debug!(batch = batch.sequence, attempt, error = %e, "retrying export");
                },
            )
            .await;

        let count = batch.len() as u64;
        match result {
            Ok(()) => {
                self.stats.exported_batches.fetch_add(1, Ordering::Relaxed);
                self.stats.exported_traces.fetch_add(count, Ordering::Relaxed);
                debug!(batch = batch.sequence, traces = count, sink = self.sink.name(), "batch exported");
                for mut trace in batch.into_traces() {
                    trace.mark_sent();
                }
            }
            Err(e) => {
                self.stats.dropped_export.fetch_add(count, Ordering::Relaxed);
                warn!(batch = batch.sequence, traces = count, error = %e, "dropping batch after failed export");
                for trace in batch.into_traces() {
                    self.dead_letter(trace);
                }
            }
        }
    }

    fn dead_letter(&self, mut trace: TraceContext) {
        trace.mark_dropped();
        if self.config.dead_letter_capacity == 0 {
            return;
        }
        let mut dead = self.dead_letters.lock();
        if dead.len() >= self.config.dead_letter_capacity {
            dead.pop_front();
        }
        dead.push_back(trace);
    }
}

async fn run(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(shared.config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => shared.flush().await,
            _ = shared.wake.notified() => {
                while shared.batch_ready() {
                    if let Some(batch) = shared.seal_batch() {
                        shared.send(batch).await;
                    }
                }
            }
            _ = shutdown.changed() => {
                shared.flush().await;
                info!("trace exporter stopped");
                return;
            }
        }
    }
}
