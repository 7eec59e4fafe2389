//! Health and metrics endpoint
//!
//! A minimal HTTP responder: `/metrics` renders the Prometheus registry,
//! every other path answers `200 OK` for liveness and readiness checks.

use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    )
}

/// Response for the raw request bytes
fn respond(request: &str, metrics: Option<&PrometheusHandle>) -> String {
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    match (path, metrics) {
        ("/metrics", Some(handle)) => http_response(
            "200 OK",
            "text/plain; version=0.0.4",
            &handle.render(),
        ),
        ("/metrics", None) => http_response("404 Not Found", "text/plain", "metrics disabled"),
        _ => http_response("200 OK", "text/plain", "OK"),
    }
}

/// Serve until `cancel` fires
pub async fn serve(
    addr: SocketAddr,
    metrics: Option<PrometheusHandle>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(address = %addr, "Starting health server");

    loop {
        let (mut socket, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = cancel.cancelled() => return Ok(()),
        };

        let metrics = metrics.clone();
        tokio::spawn(async move {
            let mut buf = [0; 1024];
            if let Ok(n) = socket.read(&mut buf).await {
                let request = String::from_utf8_lossy(&buf[..n]);
                let response = respond(&request, metrics.as_ref());
                if let Err(e) = socket.write_all(response.as_bytes()).await {
                    debug!(peer = %peer, error = %e, "Failed to write health response");
                }
            }
        });
    }
}
