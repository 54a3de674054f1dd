use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use serde::Serialize;
use serde_json::json;
use crate::error::PoolError;
use crate::error_handling::{ErrorHandler, RateLimiter};
use crate::health::HealthChecker;
use crate::job_manager::JobManager;
use crate::metrics::MetricsCollector;
use crate::prometheus_metrics::PrometheusMetrics;
use crate::types::ShareSubmission;

const MAX_REQUEST_BYTES: usize = 64 * 1024;

pub struct ServerState {
    pub health_checker: HealthChecker,
    pub manager: Arc<JobManager>,
    pub metrics: Arc<MetricsCollector>,
    pub prometheus: Arc<PrometheusMetrics>,
    pub rate_limiter: RateLimiter,
    pub error_handler: Option<Arc<ErrorHandler>>,
}

pub struct StatusServer {
    state: Arc<ServerState>,
    port: u16,
}

impl StatusServer {
    pub fn new(state: Arc<ServerState>, port: u16) -> Self {
        Self { state, port }
    }

    pub async fn start(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(format!("127.0.0.1:{}", self.port)).await?;
        tracing::info!(port = self.port, "status server listening");

        loop {
            let (mut socket, peer) = listener.accept().await?;
            let state = Arc::clone(&self.state);

            tokio::spawn(async move {
                let request = match read_request(&mut socket).await {
                    Ok(Some(request)) => request,
                    Ok(None) => return,
                    Err(e) => {
                        tracing::debug!(%peer, error = %e, "failed to read request");
                        return;
                    }
                };
                let response = handle_request(&request, &state).await;
                if let Err(e) = socket.write_all(response.as_bytes()).await {
                    tracing::debug!(%peer, error = %e, "failed to write response");
                }
            });
        }
    }
}

/// Read until the headers and a `Content-Length` body are in.
async fn read_request<R: AsyncReadExt + Unpin>(socket: &mut R) -> std::io::Result<Option<String>> {
    let mut data = Vec::new();
    let mut buffer = [0u8; 4096];
    loop {
        let n = socket.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buffer[..n]);
        if request_complete(&data) || data.len() >= MAX_REQUEST_BYTES {
            break;
        }
    }
    if data.is_empty() {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(&data).into_owned()))
}

fn request_complete(data: &[u8]) -> bool {
    let text = String::from_utf8_lossy(data);
    let Some(split) = text.find("\r\n\r\n") else {
        return false;
    };
    let content_length = text[..split]
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    text.len() >= split + 4 + content_length
}

pub async fn handle_request(request: &str, state: &ServerState) -> String {
    let Some(request_line) = request.lines().next() else {
        return error_response(400, "Bad Request");
    };
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return error_response(400, "Bad Request");
    }
    let method = parts[0];
    let path = parts[1];
    let body = request.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("");

    match (method, path) {
        ("GET", "/health") => {
            let status = if state.health_checker.is_healthy() { 200 } else { 503 };
            to_json(status, &state.health_checker.get_health())
        }
        ("GET", "/status") => {
            let breaker = state.error_handler.as_ref().map(|h| h.get_circuit_breaker_status());
            to_json(200, &state.health_checker.get_detailed_status(breaker))
        }
        ("GET", "/metrics") => {
            state.prometheus.update_from_metrics(&state.metrics.get_metrics());
            match state.prometheus.export_metrics() {
                Ok(text) => text_response(200, "text/plain; version=0.0.4", &text),
                Err(_) => error_response(500, "Internal Server Error"),
            }
        }
        ("GET", "/job") => match state.manager.get_job_params() {
            Ok(Some(params)) => to_json(200, &params),
            Ok(None) => error_response(404, "no job available"),
            Err(e) => pool_error_response(&e),
        },
        ("GET", "/commitments") => match state.manager.commitments() {
            Ok(commitments) => to_json(200, &commitments),
            Err(e) => pool_error_response(&e),
        },
        ("GET", "/proof") => match state.manager.proof_bundle() {
            Ok(bundle) => to_json(
                200,
                &json!({
                    "total_rounds": bundle.total_rounds(),
                    "complete": bundle.is_complete(),
                    "persisted": bundle.is_persisted(),
                    "blocks": bundle.to_hex_rows(),
                }),
            ),
            Err(e) => pool_error_response(&e),
        },
        ("POST", "/submit") => {
            if !state.rate_limiter.try_acquire() {
                return error_response(429, "Too Many Requests");
            }
            let share: ShareSubmission = match serde_json::from_str(body) {
                Ok(share) => share,
                Err(e) => return error_response(400, &format!("invalid share submission: {}", e)),
            };
            match state.manager.process_share(&share) {
                Ok(outcome) => to_json(
                    200,
                    &json!({
                        "accepted": true,
                        "round": outcome.record.round,
                        "difficulty": outcome.record.difficulty,
                        "share_diff": outcome.record.share_diff,
                        "block_hash": outcome.record.block_hash,
                        "next_job": outcome.next_job,
                    }),
                ),
                Err(e) => pool_error_response(&e),
            }
        }
        ("GET", "/") => text_response(
            200,
            "text/plain",
            "sigma-pool\n\nGET  /health\nGET  /status\nGET  /metrics\nGET  /job\nGET  /commitments\nGET  /proof\nPOST /submit\n",
        ),
        _ => error_response(404, "Not Found"),
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        409 => "Conflict",
        429 => "Too Many Requests",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    }
}

fn text_response(status: u16, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason(status),
        content_type,
        body.len(),
        body
    )
}

fn to_json<T: Serialize>(status: u16, value: &T) -> String {
    match serde_json::to_string(value) {
        Ok(json) => text_response(status, "application/json", &json),
        Err(_) => error_response(500, "Internal Server Error"),
    }
}

fn error_response(status: u16, message: &str) -> String {
    to_json(status, &json!({ "error": message }))
}

/// Share failures keep their stratum code; protocol state errors are conflicts.
fn pool_error_response(error: &PoolError) -> String {
    match error {
        PoolError::Share(e) => to_json(400, &json!({ "code": e.code(), "error": e.to_string() })),
        PoolError::Sigma(_) | PoolError::Protocol(_) => error_response(409, &error.to_string()),
        _ => error_response(500, &error.to_string()),
    }
}
