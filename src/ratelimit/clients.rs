//! Client-config management endpoints
//!
//! Thin JSON handlers around the rate limiter and its storage: CRUD on
//! per-client bucket parameters plus a live status view. Error bodies are
//! `{code, message}`.

use std::net::SocketAddr;
use std::sync::Arc;

use http::{header, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};

use crate::config::{RateLimitConfig, TokenBucketConfig};
use crate::proxy::{client_ip, empty, full, ProxyBody};
use crate::storage::Storage;

use super::TokenBucketRateLimiter;

#[derive(Debug, Deserialize)]
struct ClientConfigRequest {
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    capacity: i64,
    #[serde(default)]
    refill_rate: i64,
}

/// Echoed config, also the GET response shape
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientConfigResponse {
    pub client_id: String,
    pub capacity: i64,
    pub refill_rate: i64,
}

/// Live bucket view served by `/client-status`
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientStatus {
    pub client_id: String,
    pub capacity: i64,
    pub refill_rate: i64,
    pub tokens_remaining: i64,
    pub tokens_percentage: i64,
}

/// JSON error body for management responses
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,
}

/// Management surface over per-client rate-limit configuration
pub struct ClientManager {
    storage: Arc<dyn Storage>,
    limiter: Arc<TokenBucketRateLimiter>,
    default_config: TokenBucketConfig,
}

impl ClientManager {
    pub fn new(
        storage: Arc<dyn Storage>,
        limiter: Arc<TokenBucketRateLimiter>,
        config: &RateLimitConfig,
    ) -> Self {
        Self {
            storage,
            limiter,
            default_config: config.default,
        }
    }

    /// Dispatch `/clients` by method
    pub async fn handle_clients<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: hyper::body::Body + Send,
        B::Data: Send,
    {
        match *req.method() {
            Method::POST => self.handle_upsert(req).await,
            Method::GET => self.handle_get(req).await,
            Method::DELETE => self.handle_delete(req).await,
            _ => error_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed"),
        }
    }

    /// POST /clients — create or update a client config
    async fn handle_upsert<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: hyper::body::Body + Send,
        B::Data: Send,
    {
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => return error_response(StatusCode::BAD_REQUEST, "Failed to read body"),
        };

        let parsed: ClientConfigRequest = match serde_json::from_slice(&body) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::error!(error = %e, "Failed to decode client config request");
                return error_response(StatusCode::BAD_REQUEST, "Invalid request format");
            }
        };

        if parsed.client_id.is_empty() {
            return error_response(StatusCode::BAD_REQUEST, "Client ID is required");
        }

        // Non-positive values fall back to the configured defaults
        let capacity = if parsed.capacity > 0 {
            parsed.capacity
        } else {
            self.default_config.capacity
        };
        let refill_rate = if parsed.refill_rate > 0 {
            parsed.refill_rate
        } else {
            self.default_config.refill_rate
        };

        if let Err(e) = self
            .limiter
            .update_client_config(&parsed.client_id, capacity, refill_rate)
            .await
        {
            tracing::error!(client_id = parsed.client_id, error = %e, "Failed to update client config");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to update client configuration",
            );
        }

        json_response(
            StatusCode::OK,
            &ClientConfigResponse {
                client_id: parsed.client_id,
                capacity,
                refill_rate,
            },
        )
    }

    /// GET /clients?client_id=… — read a client config (defaults if unset)
    async fn handle_get<B>(&self, req: Request<B>) -> Response<ProxyBody> {
        let client_id = match query_param(req.uri().query(), "client_id") {
            Some(id) if !id.is_empty() => id,
            _ => return error_response(StatusCode::BAD_REQUEST, "Client ID is required"),
        };

        let (mut capacity, mut refill_rate) = match self.storage.get_client_config(&client_id).await
        {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(client_id, error = %e, "Failed to get client config");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to get client configuration",
                );
            }
        };

        if capacity == 0 || refill_rate == 0 {
            capacity = self.default_config.capacity;
            refill_rate = self.default_config.refill_rate;
        }

        json_response(
            StatusCode::OK,
            &ClientConfigResponse {
                client_id,
                capacity,
                refill_rate,
            },
        )
    }

    /// DELETE /clients?client_id=… — remove a client config
    async fn handle_delete<B>(&self, req: Request<B>) -> Response<ProxyBody> {
        let client_id = match query_param(req.uri().query(), "client_id") {
            Some(id) if !id.is_empty() => id,
            _ => return error_response(StatusCode::BAD_REQUEST, "Client ID is required"),
        };

        if let Err(e) = self.storage.set_client_config(&client_id, 0, 0).await {
            tracing::error!(client_id, error = %e, "Failed to delete client config");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to delete client configuration",
            );
        }

        // The persistent entry is gone; the cached resolution must go too
        self.limiter.invalidate(&client_id);

        tracing::info!(client_id, "Client configuration deleted");
        Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(empty())
            .unwrap()
    }

    /// GET /client-status?client_id=… — config plus live token count.
    /// The id defaults to the caller's IP.
    pub async fn handle_status<B>(&self, req: Request<B>, remote: SocketAddr) -> Response<ProxyBody>
    where
        B: hyper::body::Body,
    {
        if req.method() != Method::GET {
            return error_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
        }

        let client_id = match query_param(req.uri().query(), "client_id") {
            Some(id) if !id.is_empty() => id,
            _ => client_ip(req.headers(), remote),
        };

        let (mut capacity, mut refill_rate) = match self.storage.get_client_config(&client_id).await
        {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(client_id, error = %e, "Failed to get client config");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to get client status",
                );
            }
        };

        if capacity == 0 || refill_rate == 0 {
            capacity = self.default_config.capacity;
            refill_rate = self.default_config.refill_rate;
        }

        // Zero-token peek: reads the level without consuming anything
        let remaining = match self.limiter.allow(&client_id, 0).await {
            Ok(remaining) => remaining,
            Err(e) => {
                tracing::error!(client_id, error = %e, "Failed to get tokens remaining");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to get tokens remaining",
                );
            }
        };

        json_response(
            StatusCode::OK,
            &ClientStatus {
                client_id,
                capacity,
                refill_rate,
                tokens_remaining: remaining,
                tokens_percentage: (remaining as f64 / capacity as f64 * 100.0) as i64,
            },
        )
    }
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ProxyBody> {
    let body = serde_json::to_vec(value).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(full(body))
        .unwrap()
}

fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    json_response(
        status,
        &ErrorBody {
            code: status.as_u16(),
            message: message.to_string(),
        },
    )
}
