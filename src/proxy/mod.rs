//! HTTP reverse proxy — the per-request pipeline
//!
//! rate-limit gate → backend selection → transparent forward → outcome
//! bookkeeping. Upstream response bodies are streamed back verbatim; the
//! backend's active-connection count stays held until the stream finishes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::StreamExt;
use http::{header, HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;

use crate::balancer::{Backend, Balancer};
use crate::config::ServerConfig;
use crate::error::{LbError, Result};
use crate::ratelimit::TokenBucketRateLimiter;

/// Response body type shared by the proxy and the management endpoints
pub type ProxyBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// A fully-buffered response body
pub fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// An empty response body
pub fn empty() -> ProxyBody {
    full(Bytes::new())
}

/// Reverse proxy over a balancer, with an optional rate-limit gate
pub struct Proxy {
    balancer: Arc<Balancer>,
    rate_limiter: Option<Arc<TokenBucketRateLimiter>>,
    client: reqwest::Client,
}

/// Holds a backend's active-connection count; released on drop
struct ActiveGuard(Arc<Backend>);

impl ActiveGuard {
    fn new(backend: Arc<Backend>) -> Self {
        backend.incr_active();
        Self(backend)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.decr_active();
    }
}

impl Proxy {
    /// Create a proxy. The upstream client uses the server timeout for both
    /// connect and total deadline, 30 s TCP keep-alive, and an idle pool of
    /// at most 100 connections per host reaped after 90 s.
    pub fn new(
        balancer: Arc<Balancer>,
        rate_limiter: Option<Arc<TokenBucketRateLimiter>>,
        server: &ServerConfig,
    ) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(server.timeout)
            .timeout(server.timeout)
            .tcp_keepalive(Duration::from_secs(30))
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(90))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();

        Self {
            balancer,
            rate_limiter,
            client,
        }
    }

    /// Run one request through the pipeline
    pub async fn handle<B>(&self, req: Request<B>, remote: SocketAddr) -> Response<ProxyBody>
    where
        B: hyper::body::Body + Send,
        B::Data: Send,
    {
        let start = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let remote_str = remote.to_string();

        if let Some(limiter) = &self.rate_limiter {
            let client_id = client_ip(req.headers(), remote);
            match limiter.allow(&client_id, 1).await {
                Ok(_) => {}
                Err(LbError::RateLimitExceeded { remaining }) => {
                    tracing::warn!(client_ip = client_id, "Rate limit exceeded");
                    self.log_request(
                        &method,
                        &path,
                        &remote_str,
                        None,
                        StatusCode::TOO_MANY_REQUESTS,
                        start,
                        Some("rate limit exceeded"),
                    );
                    return Response::builder()
                        .status(StatusCode::TOO_MANY_REQUESTS)
                        .header("X-RateLimit-Remaining", remaining.to_string())
                        .header(header::RETRY_AFTER, "1")
                        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
                        .body(full("Rate limit exceeded\n"))
                        .unwrap();
                }
                Err(e) => {
                    tracing::error!(client_ip = client_id, error = %e, "Rate limiter error");
                    self.log_request(
                        &method,
                        &path,
                        &remote_str,
                        None,
                        StatusCode::INTERNAL_SERVER_ERROR,
                        start,
                        Some("rate limiter unavailable"),
                    );
                    return plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error\n");
                }
            }
        }

        let backend = match self.balancer.next_backend() {
            Ok(backend) => backend,
            Err(e) => {
                tracing::error!(error = %e, "Failed to get backend");
                self.log_request(
                    &method,
                    &path,
                    &remote_str,
                    None,
                    StatusCode::SERVICE_UNAVAILABLE,
                    start,
                    Some("no backends available"),
                );
                return plain(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable\n");
            }
        };

        let guard = ActiveGuard::new(backend.clone());

        match self.forward(req, &backend, remote, guard).await {
            Ok(response) => {
                self.log_request(
                    &method,
                    &path,
                    &remote_str,
                    Some(&backend),
                    response.status(),
                    start,
                    None,
                );
                response
            }
            Err(e) => {
                backend.record_request(false);
                backend.incr_failure();
                tracing::error!(backend = %backend.url(), path, error = %e, "Backend request failed");
                self.log_request(
                    &method,
                    &path,
                    &remote_str,
                    Some(&backend),
                    StatusCode::BAD_GATEWAY,
                    start,
                    Some(&e.to_string()),
                );
                plain(StatusCode::BAD_GATEWAY, "Bad Gateway\n")
            }
        }
    }

    /// Forward the request to the chosen backend and stream the response
    /// back. The guard rides inside the response body so the active count
    /// covers the whole transfer.
    async fn forward<B>(
        &self,
        req: Request<B>,
        backend: &Arc<Backend>,
        remote: SocketAddr,
        guard: ActiveGuard,
    ) -> Result<Response<ProxyBody>>
    where
        B: hyper::body::Body + Send,
        B::Data: Send,
    {
        let (parts, body) = req.into_parts();
        let body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => Bytes::new(),
        };

        let backend_url = backend.url().as_str().trim_end_matches('/');
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let upstream_url = format!("{backend_url}{path_and_query}");

        let original_host = parts
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let forwarded_for = match parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            Some(existing) => format!("{existing}, {}", remote.ip()),
            None => remote.ip().to_string(),
        };

        let mut req_builder = self.client.request(parts.method.clone(), &upstream_url);
        for (key, value) in parts.headers.iter() {
            if !is_hop_by_hop(key.as_str()) {
                req_builder = req_builder.header(key, value);
            }
        }
        req_builder = req_builder
            .header("X-Forwarded-Host", &original_host)
            .header("X-Forwarded-For", &forwarded_for)
            .header("X-Origin-Host", backend.authority())
            .header("X-Proxy", "flowgate")
            .body(body_bytes);

        let upstream_resp = req_builder.send().await?;

        let status = upstream_resp.status();
        backend.record_request(status.as_u16() < 500);

        let mut builder = Response::builder().status(status);
        for (key, value) in upstream_resp.headers().iter() {
            if !is_hop_by_hop(key.as_str()) {
                builder = builder.header(key, value);
            }
        }

        let stream = upstream_resp.bytes_stream().map(move |chunk| {
            let _streaming = &guard;
            chunk.map(Frame::data).map_err(std::io::Error::other)
        });

        Ok(builder
            .body(StreamBody::new(stream).boxed_unsync())
            .unwrap())
    }

    #[allow(clippy::too_many_arguments)]
    fn log_request(
        &self,
        method: &Method,
        path: &str,
        remote: &str,
        backend: Option<&Backend>,
        status: StatusCode,
        start: Instant,
        error: Option<&str>,
    ) {
        let duration_ms = start.elapsed().as_millis() as u64;
        let backend_url = backend.map(|b| b.url().to_string());
        let backend_field = backend_url.as_deref().unwrap_or("-");

        match error {
            Some(err) => tracing::warn!(
                method = %method,
                path,
                remote,
                backend = backend_field,
                status = status.as_u16(),
                duration_ms,
                error = err,
                "Proxy request completed with error"
            ),
            None => tracing::info!(
                method = %method,
                path,
                remote,
                backend = backend_field,
                status = status.as_u16(),
                duration_ms,
                "Proxy request completed"
            ),
        }
    }
}

/// Plain-text error response; proxied-request errors are not JSON
fn plain(status: StatusCode, body: &'static str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full(body))
        .unwrap()
}

/// Derive the rate-limit client id: first `X-Forwarded-For` entry, then
/// `X-Real-IP`, then the connection's remote host.
pub(crate) fn client_ip(headers: &HeaderMap, remote: SocketAddr) -> String {
    if let Some(xff) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = xff.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    remote.ip().to_string()
}

/// Hop-by-hop headers that must not cross the proxy
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Algorithm, RateLimitConfig, TokenBucketConfig};
    use crate::storage::MemoryStorage;

    fn remote() -> SocketAddr {
        "192.168.1.7:52000".parse().unwrap()
    }

    fn request(headers: &[(&str, &str)]) -> Request<Full<Bytes>> {
        let mut builder = Request::builder().uri("/api/data");
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(Full::new(Bytes::new())).unwrap()
    }

    async fn body_text(resp: Response<ProxyBody>) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn limited_proxy(capacity: i64) -> Proxy {
        let storage = Arc::new(MemoryStorage::new());
        let config = RateLimitConfig {
            enabled: true,
            default: TokenBucketConfig {
                capacity,
                refill_rate: 1,
            },
            ..RateLimitConfig::default()
        };
        let limiter = Arc::new(TokenBucketRateLimiter::new(storage, &config).await.unwrap());
        let balancer = Arc::new(Balancer::new(Algorithm::RoundRobin));
        Proxy::new(balancer, Some(limiter), &ServerConfig::default())
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let req = request(&[
            ("X-Forwarded-For", "10.0.0.1, 10.0.0.2"),
            ("X-Real-IP", "10.0.0.9"),
        ]);
        assert_eq!(client_ip(req.headers(), remote()), "10.0.0.1");
    }

    #[test]
    fn test_client_ip_falls_back_to_real_ip() {
        let req = request(&[("X-Real-IP", "10.0.0.9")]);
        assert_eq!(client_ip(req.headers(), remote()), "10.0.0.9");
    }

    #[test]
    fn test_client_ip_falls_back_to_remote_host() {
        let req = request(&[]);
        assert_eq!(client_ip(req.headers(), remote()), "192.168.1.7");
    }

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("keep-alive"));
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(is_hop_by_hop("Upgrade"));

        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_hop_by_hop("Host"));
        assert!(!is_hop_by_hop("X-Forwarded-For"));
    }

    #[tokio::test]
    async fn test_no_backends_returns_503() {
        let balancer = Arc::new(Balancer::new(Algorithm::RoundRobin));
        let proxy = Proxy::new(balancer, None, &ServerConfig::default());

        let resp = proxy.handle(request(&[]), remote()).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_text(resp).await, "Service Unavailable\n");
    }

    #[tokio::test]
    async fn test_unreachable_backend_returns_502() {
        let balancer = Arc::new(Balancer::new(Algorithm::RoundRobin));
        // Port 9 (discard) is not listening
        balancer.register(Arc::new(Backend::new("http://127.0.0.1:9").unwrap()));
        let proxy = Proxy::new(balancer.clone(), None, &ServerConfig::default());

        let resp = proxy.handle(request(&[]), remote()).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);

        let backend = &balancer.all_backends()[0];
        assert_eq!(backend.total_requests(), 1);
        assert_eq!(backend.failed_requests(), 1);
        assert_eq!(backend.failure_count(), 1);
        // The active-connection guard released on the failure path
        assert_eq!(backend.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_rate_limit_denial_returns_429_with_headers() {
        let proxy = limited_proxy(1).await;

        // First request passes the gate, then 503s on the empty balancer
        let first = proxy.handle(request(&[]), remote()).await;
        assert_eq!(first.status(), StatusCode::SERVICE_UNAVAILABLE);

        let second = proxy.handle(request(&[]), remote()).await;
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(second.headers().get("X-RateLimit-Remaining").unwrap(), "0");
        assert_eq!(second.headers().get("Retry-After").unwrap(), "1");
        assert_eq!(body_text(second).await, "Rate limit exceeded\n");
    }

    #[tokio::test]
    async fn test_rate_limit_is_per_client() {
        let proxy = limited_proxy(1).await;

        let a = proxy
            .handle(request(&[("X-Forwarded-For", "10.0.0.1")]), remote())
            .await;
        assert_eq!(a.status(), StatusCode::SERVICE_UNAVAILABLE);

        // A different client id still has its own full bucket
        let b = proxy
            .handle(request(&[("X-Forwarded-For", "10.0.0.2")]), remote())
            .await;
        assert_eq!(b.status(), StatusCode::SERVICE_UNAVAILABLE);

        // The first client is now exhausted
        let a2 = proxy
            .handle(request(&[("X-Forwarded-For", "10.0.0.1")]), remote())
            .await;
        assert_eq!(a2.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_rate_limiter_infrastructure_error_returns_500() {
        let store = Arc::new(crate::ratelimit::testing::MockStorage::new());
        let config = RateLimitConfig::default();
        let limiter = Arc::new(
            TokenBucketRateLimiter::new(store.clone(), &config)
                .await
                .unwrap(),
        );
        *store.fail_take.lock().unwrap() = true;

        let balancer = Arc::new(Balancer::new(Algorithm::RoundRobin));
        let proxy = Proxy::new(balancer, Some(limiter), &ServerConfig::default());

        let resp = proxy.handle(request(&[]), remote()).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
