//! HTTP server — one port multiplexing the reverse proxy and the
//! management endpoints
//!
//! Accept loop over a `TcpListener`, one hyper http1 connection task per
//! client. Shutdown stops accepting immediately and drains in-flight
//! connections for up to 30 seconds; a second signal exits at once.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::balancer::Balancer;
use crate::config::ServerConfig;
use crate::error::{LbError, Result};
use crate::proxy::{full, Proxy, ProxyBody};
use crate::ratelimit::ClientManager;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared per-request state
pub struct AppState {
    pub balancer: Arc<Balancer>,
    pub proxy: Arc<Proxy>,
    /// Present only when rate limiting is enabled; without it the
    /// management paths fall through to the proxy.
    pub clients: Option<Arc<ClientManager>>,
}

/// The listening server
pub struct Server {
    config: ServerConfig,
    state: Arc<AppState>,
}

impl Server {
    pub fn new(config: ServerConfig, state: AppState) -> Self {
        Self {
            config,
            state: Arc::new(state),
        }
    }

    /// Bind and serve until SIGINT/SIGTERM
    pub async fn run(&self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("Received termination signal");
            let _ = shutdown_tx.send(true);

            // A second signal skips the drain
            shutdown_signal().await;
            tracing::warn!("Second termination signal, exiting immediately");
            std::process::exit(1);
        });

        self.run_until(shutdown_rx).await
    }

    /// Bind and serve until `shutdown` flips to true
    pub async fn run_until(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| LbError::Config(format!("failed to bind {addr}: {e}")))?;

        tracing::info!(port = self.config.port, "Starting HTTP server");

        let in_flight = Arc::new(AtomicUsize::new(0));

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    let state = self.state.clone();
                    let in_flight = in_flight.clone();

                    tokio::spawn(async move {
                        in_flight.fetch_add(1, Ordering::SeqCst);

                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req| {
                            let state = state.clone();
                            async move {
                                Ok::<_, hyper::Error>(route(req, remote_addr, state).await)
                            }
                        });

                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            tracing::debug!(error = %e, remote = %remote_addr, "Connection ended with error");
                        }

                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            }
        }

        // Stop accepting, then give in-flight connections time to finish
        drop(listener);
        tracing::info!("Shutting down HTTP server...");

        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while in_flight.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    remaining = in_flight.load(Ordering::SeqCst),
                    "Drain timeout reached, dropping connections"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        Ok(())
    }
}

/// Dispatch one request: management paths first, everything else proxied
async fn route(
    req: Request<Incoming>,
    remote: SocketAddr,
    state: Arc<AppState>,
) -> Response<ProxyBody> {
    match req.uri().path() {
        "/clients" => {
            if let Some(clients) = &state.clients {
                return clients.handle_clients(req).await;
            }
        }
        "/client-status" => {
            if let Some(clients) = &state.clients {
                return clients.handle_status(req, remote).await;
            }
        }
        "/lb-status" => return lb_status(&state.balancer),
        "/stats" => return stats(&state.balancer),
        _ => {}
    }

    state.proxy.handle(req, remote).await
}

/// GET /lb-status — balancer name and healthy-backend count
fn lb_status(balancer: &Balancer) -> Response<ProxyBody> {
    let body = serde_json::json!({
        "status": "ok",
        "balancer": balancer.name(),
        "backends": balancer.healthy_backends().len(),
    });
    json_ok(&body)
}

/// GET /stats — per-backend request statistics
fn stats(balancer: &Balancer) -> Response<ProxyBody> {
    json_ok(&balancer.statistics())
}

fn json_ok<T: serde::Serialize>(value: &T) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(full(serde_json::to_vec(value).unwrap_or_default()))
        .unwrap()
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to listen for SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::Backend;
    use crate::config::Algorithm;
    use http_body_util::BodyExt;

    async fn body_json(resp: Response<ProxyBody>) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_lb_status_counts_healthy_backends() {
        let balancer = Balancer::new(Algorithm::LeastConnections);
        balancer.register(Arc::new(Backend::new("http://a:8001").unwrap()));
        balancer.register(Arc::new(Backend::new("http://b:8002").unwrap()));
        balancer.all_backends()[1].mark_down();

        let resp = lb_status(&balancer);
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["balancer"], "least_connections");
        assert_eq!(json["backends"], 1);
    }

    #[tokio::test]
    async fn test_stats_keyed_by_backend_url() {
        let balancer = Balancer::new(Algorithm::RoundRobin);
        balancer.register(Arc::new(Backend::new("http://a:8001").unwrap()));
        balancer.all_backends()[0].record_request(true);
        balancer.all_backends()[0].record_request(false);

        let resp = stats(&balancer);
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        let entry = &json["http://a:8001/"];
        assert_eq!(entry["total_requests"], 2);
        assert_eq!(entry["failed_requests"], 1);
        assert_eq!(entry["is_alive"], true);
        assert_eq!(entry["failure_rate"], 50.0);
    }
}
