//! Endpoint server for exposing metrics and health checks

use crate::metrics::metrics;
use anyhow::Result;
use prometheus::{Encoder, TextEncoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Registry contents in the text exposition format
pub fn render_metrics() -> Result<(String, String)> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&metrics().registry().gather(), &mut buffer)?;
    Ok((encoder.format_type().to_string(), String::from_utf8(buffer)?))
}

fn response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

/// Route one request line
fn route(request: &str) -> String {
    let path = request.split_whitespace().nth(1).unwrap_or("/");
    match path {
        "/metrics" => match render_metrics() {
            Ok((content_type, body)) => response("200 OK", &content_type, &body),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode metrics");
                response("500 Internal Server Error", "text/plain", "encode error")
            }
        },
        "/health" => response("200 OK", "text/plain", "ok"),
        _ => response("404 Not Found", "text/plain", "not found"),
    }
}

/// Serve `/metrics` and `/health` until `shutdown` fires
pub async fn endpoint_server(listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "Metrics endpoint listening");

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((mut socket, _addr)) => {
                tokio::spawn(async move {
                    let mut buf = [0; 1024];
                    match socket.read(&mut buf).await {
                        Ok(n) => {
                            let reply = route(&String::from_utf8_lossy(&buf[..n]));
                            if let Err(e) = socket.write_all(reply.as_bytes()).await {
                                tracing::debug!(error = %e, "Failed to write response");
                            }
                        }
                        Err(e) => {
                            tracing::error!("Failed to read from socket: {}", e);
                        }
                    }
                });
            }
            Err(e) => {
                tracing::error!("Failed to accept connection: {}", e);
            }
        }
    }
    Ok(())
}

pub async fn bind(port: u16) -> Result<TcpListener> {
    Ok(TcpListener::bind(("0.0.0.0", port)).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes() {
        assert!(route("GET /health HTTP/1.1\r\n").ends_with("ok"));
        assert!(route("GET /nope HTTP/1.1\r\n").starts_with("HTTP/1.1 404"));

        metrics().drafts_built.inc();
        let reply = route("GET /metrics HTTP/1.1\r\n");
        assert!(reply.starts_with("HTTP/1.1 200"));
        assert!(reply.contains("drafts_built"));
    }

    #[tokio::test]
    async fn test_server_answers_and_stops() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(endpoint_server(listener, shutdown.clone()));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET /health HTTP/1.1\r\n\r\n").await.unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        assert!(reply.starts_with("HTTP/1.1 200 OK"));

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
