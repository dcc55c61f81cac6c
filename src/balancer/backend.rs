//! Backend — per-upstream runtime state
//!
//! Every field the request path or the health loop touches is an atomic, so
//! selection and bookkeeping never take a lock.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use url::Url;

use crate::error::{LbError, Result};

/// A single upstream server
#[derive(Debug)]
pub struct Backend {
    url: Url,
    is_alive: AtomicBool,
    active_connections: AtomicI64,
    failure_count: AtomicU32,
    /// Unix epoch milliseconds of the last probe verdict
    last_checked_ms: AtomicU64,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
}

/// Immutable snapshot of a backend's state
#[derive(Debug, Clone)]
pub struct BackendStatus {
    pub url: String,
    pub is_alive: bool,
    pub active_connections: i64,
    pub last_checked: DateTime<Utc>,
    pub failure_count: u32,
    pub total_requests: u64,
    pub failed_requests: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl Backend {
    /// Create a backend from a URL string. Starts alive with all counters
    /// at zero.
    pub fn new(backend_url: &str) -> Result<Self> {
        let url = Url::parse(backend_url)
            .map_err(|e| LbError::Config(format!("invalid backend URL {backend_url}: {e}")))?;

        Ok(Self {
            url,
            is_alive: AtomicBool::new(true),
            active_connections: AtomicI64::new(0),
            failure_count: AtomicU32::new(0),
            last_checked_ms: AtomicU64::new(now_ms()),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
        })
    }

    /// Normalized backend URL
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// host[:port] of the backend, as sent in `X-Origin-Host`
    pub fn authority(&self) -> String {
        match (self.url.host_str(), self.url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            _ => self.url.to_string(),
        }
    }

    pub fn incr_active(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr_active(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Transition to UP: clears the failure counter and stamps the check time
    pub fn mark_up(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        self.failure_count.store(0, Ordering::Relaxed);
        self.last_checked_ms.store(now_ms(), Ordering::Relaxed);
        tracing::info!(backend = %self.url, "Backend marked as UP");
    }

    /// Transition to DOWN: stamps the check time, failure counter untouched
    pub fn mark_down(&self) {
        self.is_alive.store(false, Ordering::Relaxed);
        self.last_checked_ms.store(now_ms(), Ordering::Relaxed);
        tracing::warn!(backend = %self.url, "Backend marked as DOWN");
    }

    pub fn is_available(&self) -> bool {
        self.is_alive.load(Ordering::Relaxed)
    }

    pub fn incr_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Clear the consecutive-failure counter without a state transition
    pub fn reset_failures(&self) {
        self.failure_count.store(0, Ordering::Relaxed);
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Relaxed)
    }

    /// Count a completed proxied request
    pub fn record_request(&self, success: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    /// Snapshot every counter at once
    pub fn status(&self) -> BackendStatus {
        let checked = self.last_checked_ms.load(Ordering::Relaxed);
        BackendStatus {
            url: self.url.to_string(),
            is_alive: self.is_alive.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            last_checked: DateTime::from_timestamp_millis(checked as i64)
                .unwrap_or_else(Utc::now),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_backend_starts_alive() {
        let b = Backend::new("http://127.0.0.1:8001").unwrap();
        assert!(b.is_available());
        assert_eq!(b.active_connections(), 0);
        assert_eq!(b.failure_count(), 0);
        assert_eq!(b.total_requests(), 0);
        assert_eq!(b.failed_requests(), 0);
    }

    #[test]
    fn test_invalid_url_rejected() {
        let err = Backend::new("://not-a-url").unwrap_err();
        assert!(matches!(err, LbError::Config(_)));
    }

    #[test]
    fn test_authority() {
        let b = Backend::new("http://10.0.0.1:9000/api").unwrap();
        assert_eq!(b.authority(), "10.0.0.1:9000");

        let no_port = Backend::new("http://backend.internal").unwrap();
        assert_eq!(no_port.authority(), "backend.internal");
    }

    #[test]
    fn test_active_connection_counter() {
        let b = Backend::new("http://127.0.0.1:8001").unwrap();
        b.incr_active();
        b.incr_active();
        assert_eq!(b.active_connections(), 2);
        b.decr_active();
        assert_eq!(b.active_connections(), 1);
    }

    #[test]
    fn test_mark_up_resets_failures() {
        let b = Backend::new("http://127.0.0.1:8001").unwrap();
        b.incr_failure();
        b.incr_failure();
        b.mark_down();
        assert!(!b.is_available());
        assert_eq!(b.failure_count(), 2);

        b.mark_up();
        assert!(b.is_available());
        assert_eq!(b.failure_count(), 0);
    }

    #[test]
    fn test_mark_down_keeps_failure_count() {
        let b = Backend::new("http://127.0.0.1:8001").unwrap();
        b.incr_failure();
        b.mark_down();
        assert_eq!(b.failure_count(), 1);
    }

    #[test]
    fn test_record_request() {
        let b = Backend::new("http://127.0.0.1:8001").unwrap();
        b.record_request(true);
        b.record_request(false);
        b.record_request(true);
        assert_eq!(b.total_requests(), 3);
        assert_eq!(b.failed_requests(), 1);
    }

    #[test]
    fn test_status_snapshot() {
        let b = Backend::new("http://127.0.0.1:8001").unwrap();
        b.incr_active();
        b.incr_failure();
        b.record_request(false);

        let status = b.status();
        assert_eq!(status.url, "http://127.0.0.1:8001/");
        assert!(status.is_alive);
        assert_eq!(status.active_connections, 1);
        assert_eq!(status.failure_count, 1);
        assert_eq!(status.total_requests, 1);
        assert_eq!(status.failed_requests, 1);
    }

    #[test]
    fn test_concurrent_counters() {
        use std::sync::Arc;

        let b = Arc::new(Backend::new("http://127.0.0.1:8001").unwrap());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let b = b.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    b.incr_active();
                    b.record_request(true);
                    b.decr_active();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(b.active_connections(), 0);
        assert_eq!(b.total_requests(), 8000);
        assert_eq!(b.failed_requests(), 0);
    }
}
