mod common;

use common::{harness, multipart_body, send, wasm, Harness, DEMO_WAT, SPIN_WAT};
use sandtrace::http::{Server, TRACE_ID_HEADER};
use sandtrace::sandbox::SandboxConfig;
use sandtrace::span::{SpanFilter, SpanId, TraceId};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

async fn start(h: &Harness) -> SocketAddr {
    let server = Server::bind("127.0.0.1:0", h.runner.clone()).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());
    addr
}

async fn upload(addr: SocketAddr, name: &str, module: &[u8]) -> common::RawResponse {
    let body = multipart_body("sandtrace-boundary", "wasm", module);
    send(
        addr,
        &format!(
            "POST /upload?name={} HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=sandtrace-boundary",
            name
        ),
        &body,
    )
    .await
}

#[tokio::test]
async fn test_upload_run_exports_one_correlated_trace() {
    let h = harness(SandboxConfig::default(), SpanFilter::new(5000));
    let addr = start(&h).await;

    let resp = upload(addr, "demo", &wasm(DEMO_WAT)).await;
    assert_eq!(resp.status, 200);

    let resp = send(addr, "POST /run?name=demo HTTP/1.1", b"{}").await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.json()["stdout"], "{\"ok\":true}");

    h.exporter.flush().await;
    let traces = h.sink.traces();
    assert_eq!(traces.len(), 1);
    let trace = &traces[0];
    assert_eq!(trace.metadata()["http.url"], "/run?name=demo");
    assert_eq!(trace.metadata()["http.status_code"], "200");
    assert_eq!(trace.metadata()["http.client_ip"], "127.0.0.1");
    assert!(trace.spans().all(|s| s.end_time.map_or(false, |e| e >= s.start_time)));

    let header_id = resp
        .head
        .lines()
        .find_map(|l| l.strip_prefix(&format!("{}: ", TRACE_ID_HEADER)))
        .unwrap();
    assert_eq!(trace.trace_id().to_string(), header_id);
}

#[tokio::test]
async fn test_traceparent_sets_trace_id() {
    let h = harness(SandboxConfig::default(), SpanFilter::new(0));
    let addr = start(&h).await;
    upload(addr, "demo", &wasm(DEMO_WAT)).await;

    let head = "POST /run?name=demo HTTP/1.1\r\ntraceparent: 00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";
    assert_eq!(send(addr, head, b"{}").await.status, 200);
    // a client retry with the same traceparent
    assert_eq!(send(addr, head, b"{}").await.status, 200);

    h.exporter.flush().await;
    let traces = h.sink.traces();
    assert_eq!(traces.len(), 2);
    let expected: TraceId = "4bf92f3577b34da6a3ce929d0e0e4736".parse().unwrap();
    for trace in &traces {
        assert_eq!(trace.trace_id(), expected);
        assert_eq!(trace.remote_parent(), Some(SpanId(0x00f0_67aa_0ba9_02b7)));
    }
    let first: HashSet<_> = traces[0].spans().map(|s| s.id).collect();
    assert!(traces[1].spans().all(|s| !first.contains(&s.id)));
}

#[tokio::test]
async fn test_timeout_returns_500_and_exports_truncated_spans() {
    let sandbox = SandboxConfig {
        timeout: Duration::from_millis(200),
        ..SandboxConfig::default()
    };
    let h = harness(sandbox, SpanFilter::new(5000));
    let addr = start(&h).await;
    upload(addr, "spin", &wasm(SPIN_WAT)).await;

    let resp = send(addr, "POST /run?name=spin HTTP/1.1", b"").await;
    assert_eq!(resp.status, 500);
    assert_eq!(resp.json()["kind"], "timeout");

    h.exporter.flush().await;
    let traces = h.sink.traces();
    assert_eq!(traces.len(), 1);
    let spin = traces[0].find_span("spin").unwrap();
    assert!(spin.is_truncated());
    assert!(spin.end_time.unwrap() >= spin.start_time);
    assert_eq!(traces[0].metadata()["http.status_code"], "500");
    assert_eq!(traces[0].root_span().tag_value("error.kind"), Some("timeout"));
}

#[tokio::test]
async fn test_unknown_module_is_404() {
    let h = harness(SandboxConfig::default(), SpanFilter::new(0));
    let addr = start(&h).await;
    let resp = send(addr, "POST /run?name=missing HTTP/1.1", b"").await;
    assert_eq!(resp.status, 404);
    assert_eq!(resp.json()["kind"], "module_not_found");
    assert_eq!(h.exporter.queued(), 0);
}

#[tokio::test]
async fn test_bad_uploads_are_400() {
    let h = harness(SandboxConfig::default(), SpanFilter::new(0));
    let addr = start(&h).await;

    // no name
    let body = multipart_body("b", "wasm", b"\0asm");
    let resp = send(
        addr,
        "POST /upload HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=b",
        &body,
    )
    .await;
    assert_eq!(resp.status, 400);

    // wrong field
    let body = multipart_body("b", "file", b"\0asm");
    let resp = send(
        addr,
        "POST /upload?name=x HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=b",
        &body,
    )
    .await;
    assert_eq!(resp.status, 400);
    assert_eq!(resp.json()["kind"], "invalid_upload");

    // not multipart
    let resp = send(addr, "POST /upload?name=x HTTP/1.1\r\nContent-Type: application/json", b"{}").await;
    assert_eq!(resp.status, 400);
}

#[tokio::test]
async fn test_invalid_module_is_500_with_trace() {
    let h = harness(SandboxConfig::default(), SpanFilter::new(0));
    let addr = start(&h).await;
    upload(addr, "junk", b"definitely not wasm").await;

    let resp = send(addr, "POST /run?name=junk HTTP/1.1", b"").await;
    assert_eq!(resp.status, 500);
    assert_eq!(resp.json()["kind"], "instantiation_failure");

    h.exporter.flush().await;
    assert_eq!(h.sink.traces().len(), 1);
}

#[tokio::test]
async fn test_routing_errors() {
    let h = harness(SandboxConfig::default(), SpanFilter::new(0));
    let addr = start(&h).await;

    assert_eq!(send(addr, "GET /nope HTTP/1.1", b"").await.status, 404);
    let resp = send(addr, "GET /run?name=demo HTTP/1.1", b"").await;
    assert_eq!(resp.status, 405);
    assert!(resp.head.contains("Allow: POST"));

    let resp = send(addr, "GET / HTTP/1.1", b"").await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"Hello, World!\n");
}

#[tokio::test]
async fn test_metrics_and_run_log() {
    let h = harness(SandboxConfig::default(), SpanFilter::new(0));
    let addr = start(&h).await;
    upload(addr, "demo", &wasm(DEMO_WAT)).await;
    send(addr, "POST /run?name=demo HTTP/1.1", b"{}").await;
    send(addr, "POST /run?name=missing HTTP/1.1", b"{}").await;

    let metrics = send(addr, "GET /metrics HTTP/1.1", b"").await.json();
    assert_eq!(metrics["runs"]["runs_total"], 1);
    assert_eq!(metrics["runs"]["errors_per_kind"]["module_not_found"], 1);
    assert_eq!(metrics["exporter"]["submitted"], 1);

    let runs = send(addr, "GET /runs?limit=5 HTTP/1.1", b"").await.json();
    let runs = runs.as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["module_name"], "demo");
    assert_eq!(runs[0]["success"], true);
}
