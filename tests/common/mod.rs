#![allow(dead_code)]

use sandtrace::collector::TraceCollector;
use sandtrace::exporter::{BatchExporter, ExporterConfig, InMemoryExporter};
use sandtrace::observability::{RunLogger, RunnerMetrics};
use sandtrace::runner::ModuleRunner;
use sandtrace::sandbox::{SandboxConfig, SandboxEngine};
use sandtrace::span::{SpanFilter, SystemClock, DEFAULT_MAX_SPANS};
use sandtrace::storage::MemoryModuleStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Reads stdin to EOF, tags a `handle` span with `brand:acme`, writes
/// `{"ok":true}` to stdout.
pub const DEMO_WAT: &str = r#"
(module
  (import "wasi_snapshot_preview1" "fd_read" (func $fd_read (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (import "sandtrace" "span_enter" (func $enter (param i32 i32) (result i32)))
  (import "sandtrace" "span_exit" (func $exit (result i32)))
  (import "sandtrace" "span_tags_current" (func $tags (param i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "handle")
  (data (i32.const 16) "brand:acme")
  (data (i32.const 32) "{\"ok\":true}")
  (func (export "_start")
    (i32.store (i32.const 64) (i32.const 1024))
    (i32.store (i32.const 68) (i32.const 256))
    (block $done
      (loop $read
        (drop (call $fd_read (i32.const 0) (i32.const 64) (i32.const 1) (i32.const 72)))
        (br_if $done (i32.eqz (i32.load (i32.const 72))))
        (br $read)))
    (drop (call $enter (i32.const 0) (i32.const 6)))
    (drop (call $tags (i32.const 16) (i32.const 10)))
    (i32.store (i32.const 80) (i32.const 32))
    (i32.store (i32.const 84) (i32.const 11))
    (drop (call $fd_write (i32.const 1) (i32.const 80) (i32.const 1) (i32.const 88)))
    (drop (call $exit))))
"#;

/// Opens a `spin` span and never terminates.
pub const SPIN_WAT: &str = r#"
(module
  (import "sandtrace" "span_open" (func $open (param i32 i32 i64) (result i64)))
  (memory (export "memory") 1)
  (data (i32.const 0) "spin")
  (func (export "_start")
    (drop (call $open (i32.const 0) (i32.const 4) (i64.const 0)))
    (loop $forever (br $forever))))
"#;

pub fn wasm(wat_source: &str) -> Vec<u8> {
    wat::parse_str(wat_source).expect("valid wat")
}

pub struct Harness {
    pub runner: Arc<ModuleRunner>,
    pub exporter: Arc<BatchExporter>,
    pub sink: Arc<InMemoryExporter>,
}

pub fn harness(sandbox: SandboxConfig, filter: SpanFilter) -> Harness {
    let sink = Arc::new(InMemoryExporter::new());
    let exporter = Arc::new(BatchExporter::new(
        ExporterConfig {
            flush_interval: Duration::from_secs(3600),
            ..ExporterConfig::default()
        },
        sink.clone(),
    ));
    let clock = Arc::new(SystemClock::new());
    let engine = Arc::new(SandboxEngine::new(sandbox, clock.clone()).expect("engine"));
    let collector = Arc::new(TraceCollector::new(filter, DEFAULT_MAX_SPANS, clock, exporter.clone()));
    let runner = Arc::new(ModuleRunner::new(
        Arc::new(MemoryModuleStore::new()),
        engine,
        collector,
        Arc::new(RunnerMetrics::new()),
        Arc::new(RunLogger::default()),
    ));
    Harness { runner, exporter, sink }
}

pub struct RawResponse {
    pub status: u16,
    pub head: String,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("json body")
    }
}

/// Sends one request and reads until the server closes the connection.
pub async fn send(addr: std::net::SocketAddr, head: &str, body: &[u8]) -> RawResponse {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let mut request = format!("{}\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n", head, body.len()).into_bytes();
    request.extend_from_slice(body);
    stream.write_all(&request).await.expect("write");

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.expect("read");
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response head");
    let head = String::from_utf8_lossy(&raw[..split]).into_owned();
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status code");
    RawResponse {
        status,
        head,
        body: raw[split + 4..].to_vec(),
    }
}

pub fn multipart_body(boundary: &str, field: &str, data: &[u8]) -> Vec<u8> {
    let mut body = format!(
        "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"module.wasm\"\r\nContent-Type: application/wasm\r\n\r\n",
        boundary, field
    )
    .into_bytes();
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    body
}
