//! HTTP Server
//!
//! Hand-written HTTP/1.1 on a tokio `TcpListener`, one request per
//! connection.

use crate::error::{Result, SandtraceError};
use crate::http::multipart;
use crate::http::request::{read_request, HttpRequest, RequestError};
use crate::http::response::HttpResponse;
use crate::runner::{ModuleRunner, RunRequest};
use crate::span::{SpanId, TraceId};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, info_span, warn, Instrument};

pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const TRACE_ID_HEADER: &str = "X-Sandtrace-Trace-Id";
const DEFAULT_RUNS_LIMIT: usize = 20;
const MAX_RUNS_LIMIT: usize = 1000;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct RunResponse {
    stdout: String,
}

#[derive(Serialize)]
struct UploadResponse<'a> {
    name: &'a str,
    bytes: usize,
}

struct ServerState {
    runner: Arc<ModuleRunner>,
    max_body_bytes: usize,
}

pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
}

/// The caller's position in a distributed trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceParent {
    pub trace_id: TraceId,
    pub span_id: SpanId,
}

/// Parses a W3C `traceparent` header (`00-<trace>-<span>-<flags>`).
pub fn parse_traceparent(value: &str) -> Option<TraceParent> {
    let mut fields = value.trim().split('-');
    let version = fields.next()?;
    let trace = fields.next()?;
    let span = fields.next()?;
    let flags = fields.next()?;
    if version.len() != 2 || version == "ff" || flags.len() != 2 {
        return None;
    }
    Some(TraceParent {
        trace_id: trace.parse().ok()?,
        span_id: SpanId::from_hex(span)?,
    })
}

impl Server {
    pub async fn bind(addr: &str, runner: Arc<ModuleRunner>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state: Arc::new(ServerState {
                runner,
                max_body_bytes: MAX_BODY_BYTES,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self) -> Result<()> {
        self.serve_until(std::future::pending()).await
    }

    /// Accepts connections until `shutdown` resolves.
    pub async fn serve_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!("Server listening on {}", self.local_addr()?);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "failed to accept connection");
                            continue;
                        }
                    };
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, state).await {
                            error!("Error handling connection from {}: {}", peer, e);
                        }
                    });
                }
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, peer: SocketAddr, state: Arc<ServerState>) -> Result<()> {
    let request = match tokio::time::timeout(READ_TIMEOUT, read_request(&mut stream, state.max_body_bytes)).await {
        Ok(Ok(request)) => request,
        Ok(Err(RequestError::Closed)) => {
            debug!(%peer, "client closed connection early");
            return Ok(());
        }
        Ok(Err(RequestError::Io(e))) => return Err(SandtraceError::Io(e)),
        Ok(Err(e)) => {
            let resp = HttpResponse::text(e.status_code(), e.to_string());
            stream.write_all(&resp.to_bytes()).await?;
            return Ok(());
        }
        Err(_) => {
            stream.write_all(&HttpResponse::status(408, "timeout").to_bytes()).await?;
            return Ok(());
        }
    };

    let parent = request.header("traceparent").and_then(parse_traceparent);
    let trace_id = parent.map_or_else(TraceId::generate, |p| p.trace_id);
    let span = info_span!(
        "request",
        method = %request.method,
        path = %request.path,
        trace_id = %trace_id
    );

    let parent_span = parent.map(|p| p.span_id);
    let response = route(&state, request, peer, trace_id, parent_span)
        .instrument(span)
        .await;
    stream.write_all(&response.to_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

async fn route(
    state: &ServerState,
    request: HttpRequest,
    peer: SocketAddr,
    trace_id: TraceId,
    parent_span: Option<SpanId>,
) -> HttpResponse {
    let path = request.path.clone();
    let allowed = match path.as_str() {
        "/" | "/health" | "/metrics" | "/runs" => "GET",
        "/upload" | "/run" => "POST",
        _ => return HttpResponse::status(404, "not_found"),
    };
    if request.method != allowed {
        return HttpResponse::status(405, "method_not_allowed").with_header("Allow", allowed);
    }

    let response = match path.as_str() {
        "/" => HttpResponse::text(200, "Hello, World!\n"),
        "/health" => HttpResponse::json(
            200,
            &HealthResponse {
                status: "ok",
                version: env!("CARGO_PKG_VERSION"),
            },
        ),
        "/metrics" => metrics(state),
        "/runs" => recent_runs(state, &request),
        "/upload" => upload(state, &request).await,
        _ => run(state, request, peer, trace_id, parent_span).await,
    };
    debug!(status = response.status, "request handled");
    response
}

async fn upload(state: &ServerState, request: &HttpRequest) -> HttpResponse {
    let result = async {
        let name = request
            .query_param("name")
            .ok_or_else(|| SandtraceError::InvalidUpload("missing name query parameter".to_string()))?;
        let wasm = multipart::extract_field(request.header("content-type"), &request.body, "wasm")?;
        state.runner.upload(name, &wasm).await?;
        Ok::<_, SandtraceError>(HttpResponse::json(200, &UploadResponse { name, bytes: wasm.len() }))
    }
    .await;

    result.unwrap_or_else(|e| {
        warn!(kind = e.kind(), error = %e, "upload rejected");
        HttpResponse::error(&e)
    })
}

async fn run(
    state: &ServerState,
    request: HttpRequest,
    peer: SocketAddr,
    trace_id: TraceId,
    parent_span: Option<SpanId>,
) -> HttpResponse {
    let name = match request.query_param("name") {
        Some(name) => name.to_string(),
        None => {
            return HttpResponse::error(&SandtraceError::InvalidUpload("missing name query parameter".to_string()))
        }
    };

    let run_request = RunRequest {
        module_name: name,
        stdin: request.body,
        request_url: request.target,
        client_addr: Some(peer.ip().to_string()),
        parent_trace_id: Some(trace_id),
        parent_span_id: parent_span,
    };
    match state.runner.run(run_request).await {
        Ok(output) => HttpResponse::json(
            200,
            &RunResponse {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            },
        )
        .with_header(TRACE_ID_HEADER, output.trace_id.to_string()),
        Err(e) => HttpResponse::error(&e).with_header(TRACE_ID_HEADER, trace_id.to_string()),
    }
}

fn metrics(state: &ServerState) -> HttpResponse {
    let body = serde_json::json!({
        "runs": state.runner.metrics().snapshot(),
        "exporter": state.runner.collector().exporter().stats(),
    });
    HttpResponse::json(200, &body)
}

fn recent_runs(state: &ServerState, request: &HttpRequest) -> HttpResponse {
    let limit = match request.query_param("limit").map(str::parse::<usize>) {
        None => DEFAULT_RUNS_LIMIT,
        Some(Ok(n)) => n.min(MAX_RUNS_LIMIT),
        Some(Err(_)) => {
            return HttpResponse::error(&SandtraceError::InvalidUpload("limit must be a number".to_string()))
        }
    };
    HttpResponse::json(200, &state.runner.run_log().recent(limit))
}
