//! sandtrace HTTP host
//!
//! Configuration comes from `SANDTRACE_*` environment variables (a `.env`
//! file is loaded first); command-line flags override them.

use anyhow::{Context, Result};
use clap::Parser;
use sandtrace::collector::TraceCollector;
use sandtrace::config::Config;
use sandtrace::exporter::{BatchExporter, LogExporter, OtlpHttpExporter, TraceExporter};
use sandtrace::http::Server;
use sandtrace::observability::{init_tracing, RunLogger, RunnerMetrics};
use sandtrace::runner::ModuleRunner;
use sandtrace::sandbox::SandboxEngine;
use sandtrace::span::SystemClock;
use sandtrace::storage::FsModuleStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "sandtrace-server")]
#[command(about = "Runs uploaded WebAssembly modules and exports a trace per run")]
struct Args {
    /// Address to listen on (or set SANDTRACE_BIND_ADDR)
    #[arg(short, long)]
    bind: Option<String>,

    /// Directory for uploaded modules (or set SANDTRACE_MODULE_DIR)
    #[arg(short, long)]
    module_dir: Option<PathBuf>,

    /// Per-run wall-clock limit in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// OTLP/HTTP collector base URL; traces go to the log when unset
    #[arg(long)]
    otlp_endpoint: Option<String>,

    /// Append run records as JSON lines to this file
    #[arg(long)]
    run_log: Option<PathBuf>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(&args.log_level);

    let mut config = Config::from_env()?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(dir) = args.module_dir {
        config.module_dir = dir;
    }
    if let Some(ms) = args.timeout_ms {
        config.timeout = Duration::from_millis(ms);
    }
    if let Some(endpoint) = args.otlp_endpoint {
        config.otlp_endpoint = Some(endpoint);
    }
    if let Some(path) = args.run_log {
        config.run_log = Some(path);
    }
    config.validate()?;

    let sink: Arc<dyn TraceExporter> = match &config.otlp_endpoint {
        Some(endpoint) => {
            info!("Exporting traces to OTLP endpoint {}", endpoint);
            Arc::new(OtlpHttpExporter::new(endpoint.as_str(), config.service_name.as_str(), Duration::from_secs(10))?)
        }
        None => {
            info!("No OTLP endpoint configured; traces go to the log");
            Arc::new(LogExporter)
        }
    };
    let exporter = Arc::new(BatchExporter::new(config.exporter_config(), sink));
    exporter.start();

    let clock = Arc::new(SystemClock::new());
    let engine = Arc::new(SandboxEngine::new(config.sandbox_config(), clock.clone())?);
    let collector = Arc::new(TraceCollector::new(
        config.span_filter(),
        config.max_spans,
        clock,
        exporter.clone(),
    ));
    let store = Arc::new(FsModuleStore::open(&config.module_dir).await?);
    let runner = Arc::new(ModuleRunner::new(
        store,
        engine,
        collector,
        Arc::new(RunnerMetrics::new()),
        Arc::new(RunLogger::new(config.run_log.clone(), 1000)),
    ));

    let server = Server::bind(&config.bind_addr, runner)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    server
        .serve_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    exporter.shutdown().await;
    info!("sandtrace stopped");
    Ok(())
}
