//! Sandbox Execution Engine
//!
//! Compiles and runs one guest module per call inside a fresh wasmtime
//! `Store`. The store owns the execution's `TraceContext` through the
//! instrumentation bridge, so no other execution can observe or mutate it.
//!
//! Wall-clock timeouts use epoch interruption: a ticker thread bumps the
//! engine epoch every `EPOCH_TICK`, and every store checks its own deadline
//! from the epoch callback.

use crate::error::{ExecutionErrorKind, Result, SandtraceError};
use crate::guest::protocol::{self, IMPORT_MODULE};
use crate::guest::{InstrumentationBridge, PayloadTagger, INSTANTIATE_SPAN};
use crate::sandbox::host::HostState;
use crate::sandbox::wasi::{self, WASI_MODULE};
use crate::sandbox::instrument;
use crate::span::{Clock, Tag, TraceContext};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use wasmtime::{Config, Engine, ExternType, Linker, Module, Store, StoreLimitsBuilder, Trap, UpdateDeadline};
use wasmtime_wasi::I32Exit;

pub const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Resource bounds applied to every execution.
#[derive(Clone)]
pub struct SandboxConfig {
    pub timeout: Duration,
    pub max_memory_bytes: usize,
    pub max_output_bytes: usize,
    pub auto_instrument: bool,
    pub tagger: Option<Arc<dyn PayloadTagger>>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_memory_bytes: 64 * 1024 * 1024,
            max_output_bytes: 1024 * 1024,
            auto_instrument: true,
            tagger: None,
        }
    }
}

pub struct ExecutionRequest {
    pub module_name: String,
    pub module_bytes: Vec<u8>,
    pub stdin: Vec<u8>,
    pub args: Vec<String>,
    pub trace: TraceContext,
}

/// Everything an execution produced, including a failure if there was one.
pub struct ExecutionReport {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub trace: TraceContext,
    pub error: Option<SandtraceError>,
    pub ended_at: u64,
    pub elapsed: Duration,
    pub rejected_calls: u64,
}

pub struct SandboxEngine {
    engine: Engine,
    linker: Linker<HostState>,
    config: SandboxConfig,
    clock: Arc<dyn Clock>,
    ticker_stop: Arc<AtomicBool>,
}

impl SandboxEngine {
    pub fn new(config: SandboxConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut wasm_config = Config::new();
        wasm_config.epoch_interruption(true);
        wasm_config.max_wasm_stack(512 * 1024);
        let engine = Engine::new(&wasm_config)
            .map_err(|e| SandtraceError::Config(format!("Failed to create wasm engine: {}", e)))?;

        let mut linker = Linker::new(&engine);
        wasi::add_to_linker(&mut linker)
            .and_then(|_| instrument::add_to_linker(&mut linker))
            .map_err(|e| SandtraceError::Config(format!("Failed to register host functions: {}", e)))?;

        let ticker_stop = Arc::new(AtomicBool::new(false));
        let ticker_engine = engine.clone();
        let stop = ticker_stop.clone();
        std::thread::Builder::new()
            .name("sandtrace-epoch".to_string())
            .spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    std::thread::sleep(EPOCH_TICK);
                    ticker_engine.increment_epoch();
                }
            })?;

        Ok(Self {
            engine,
            linker,
            config,
            clock,
            ticker_stop,
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Runs a module to completion, trap, exit or timeout. Never panics on
    /// guest behavior; every outcome carries the trace collected so far.
    pub fn execute(&self, request: ExecutionRequest) -> ExecutionReport {
        let started = Instant::now();
        let bridge = InstrumentationBridge::new(request.trace, self.clock.clone())
            .with_auto_instrumentation(self.config.auto_instrument)
            .with_tagger(self.config.tagger.clone())
            .with_payload_limit(request.stdin.len());

        let state = HostState {
            stdin: Cursor::new(request.stdin),
            stdout: Vec::new(),
            stderr: Vec::new(),
            max_output: self.config.max_output_bytes,
            wasi: wasi::guest_ctx(&request.args),
            bridge,
            limits: StoreLimitsBuilder::new()
                .memory_size(self.config.max_memory_bytes)
                .instances(1)
                .build(),
            timed_out: false,
        };
        let mut store = Store::new(&self.engine, state);
        store.limiter(|state| &mut state.limits);

        let error = self.run_in_store(&mut store, &request.module_name, &request.module_bytes, started);

        let mut state = store.into_data();
        if let Some(err) = &error {
            state.bridge.mark_error(err.kind(), &err.to_string());
        }
        let ended_at = state.bridge.now();
        let rejected_calls = state.bridge.rejected_calls();
        let trace = state.bridge.finish(ended_at);

        ExecutionReport {
            stdout: state.stdout,
            stderr: state.stderr,
            trace,
            error,
            ended_at,
            elapsed: started.elapsed(),
            rejected_calls,
        }
    }

    fn run_in_store(
        &self,
        store: &mut Store<HostState>,
        module_name: &str,
        bytes: &[u8],
        started: Instant,
    ) -> Option<SandtraceError> {
        let span = store.data_mut().bridge.auto_begin(INSTANTIATE_SPAN);

        let module = match Module::new(&self.engine, bytes) {
            Ok(module) => module,
            Err(e) => {
                store.data_mut().bridge.auto_end(span, vec![Tag::new("error", "true")]);
                return Some(SandtraceError::InstantiationFailure(format!(
                    "module {} is not a valid wasm binary: {}",
                    module_name, e
                )));
            }
        };
        if let Err(e) = check_capabilities(&module) {
            store.data_mut().bridge.auto_end(span, vec![Tag::new("error", "true")]);
            return Some(e);
        }

        let deadline = started + self.config.timeout;
        store.set_epoch_deadline(1);
        store.epoch_deadline_callback(move |mut ctx| {
            if Instant::now() >= deadline {
                ctx.data_mut().timed_out = true;
                Err(anyhow::anyhow!("execution deadline exceeded"))
            } else {
                Ok(UpdateDeadline::Continue(1))
            }
        });

        let instance = match self.linker.instantiate(&mut *store, &module) {
            Ok(instance) => instance,
            Err(e) => {
                store.data_mut().bridge.auto_end(span, vec![Tag::new("error", "true")]);
                return Some(self.classify(store, e, true));
            }
        };
        let start = match instance.get_typed_func::<(), ()>(&mut *store, "_start") {
            Ok(start) => start,
            Err(e) => {
                store.data_mut().bridge.auto_end(span, vec![Tag::new("error", "true")]);
                return Some(SandtraceError::InstantiationFailure(format!(
                    "_start has the wrong signature: {}",
                    e
                )));
            }
        };
        store.data_mut().bridge.auto_end(span, Vec::new());

        debug!(module = module_name, "starting guest");
        match start.call(&mut *store, ()) {
            Ok(()) => None,
            Err(e) => match exit_status(&e) {
                Some(0) if !store.data().timed_out => None,
                _ => Some(self.classify(store, e, false)),
            },
        }
    }

    fn classify(&self, store: &Store<HostState>, err: anyhow::Error, instantiating: bool) -> SandtraceError {
        let state = store.data();
        if state.timed_out {
            return SandtraceError::execution(
                ExecutionErrorKind::Timeout,
                format!("guest exceeded the {}ms limit", self.config.timeout.as_millis()),
            );
        }
        if let Some(code) = exit_status(&err) {
            return SandtraceError::execution(ExecutionErrorKind::Exit(code), format!("guest exited with status {}", code));
        }
        match err.downcast_ref::<Trap>() {
            Some(trap) => SandtraceError::execution(ExecutionErrorKind::Trap, trap.to_string()),
            None if instantiating => {
                SandtraceError::InstantiationFailure(format!("failed to instantiate module: {:#}", err))
            }
            None => {
                warn!(error = %err, "guest failed without a trap code");
                SandtraceError::execution(ExecutionErrorKind::Trap, format!("{:#}", err))
            }
        }
    }
}

impl Drop for SandboxEngine {
    fn drop(&mut self) {
        self.ticker_stop.store(true, Ordering::Relaxed);
    }
}

fn exit_status(err: &anyhow::Error) -> Option<i32> {
    err.downcast_ref::<I32Exit>().map(|exit| exit.0)
}

/// Fails closed on any import outside the stdio/args WASI subset and the
/// instrumentation imports, and on modules without a `_start` entry point.
pub fn check_capabilities(module: &Module) -> Result<()> {
    for import in module.imports() {
        let allowed_name = match import.module() {
            WASI_MODULE => wasi::IMPORTS.contains(&import.name()),
            IMPORT_MODULE => protocol::IMPORTS.contains(&import.name()),
            _ => false,
        };
        if !allowed_name || !matches!(import.ty(), ExternType::Func(_)) {
            return Err(SandtraceError::InstantiationFailure(format!(
                "import {}::{} is outside the allowed capability surface",
                import.module(),
                import.name()
            )));
        }
    }
    match module.get_export("_start") {
        Some(ExternType::Func(_)) => Ok(()),
        _ => Err(SandtraceError::InstantiationFailure(
            "module does not export a _start function".to_string(),
        )),
    }
}
