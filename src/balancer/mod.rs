//! Balancer — backend registry plus a selection algorithm
//!
//! One registry substrate (insertion-ordered, behind a read-write lock)
//! shared by the three algorithms. Selection works on a healthy-set
//! snapshot, so membership changes never tear a pick in half.

mod backend;

pub use backend::{Backend, BackendStatus};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::{Algorithm, Config};
use crate::error::{LbError, Result};

/// Per-backend statistics as served by `/stats`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendStats {
    pub url: String,
    pub is_alive: bool,
    pub active_connections: i64,
    pub total_requests: u64,
    pub failed_requests: u64,
    /// Percentage of failed requests; omitted while zero
    #[serde(default, skip_serializing_if = "is_zero")]
    pub failure_rate: f64,
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

/// Registry of backends with a configurable selection algorithm
pub struct Balancer {
    algorithm: Algorithm,
    backends: RwLock<Vec<Arc<Backend>>>,
    /// Free-running round-robin cursor. Indexes the *healthy* snapshot, so
    /// under membership churn the rotation may skip an entry; distribution
    /// is exact only while the healthy set is stable.
    cursor: AtomicU64,
}

impl Balancer {
    /// Create an empty balancer for the given algorithm
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            backends: RwLock::new(Vec::new()),
            cursor: AtomicU64::new(0),
        }
    }

    /// Build a balancer from configuration. Backends with unparseable URLs
    /// are skipped with an error log; at least one must survive.
    pub fn from_config(config: &Config) -> Result<Self> {
        let balancer = Self::new(config.balancer.algorithm);

        for backend_cfg in &config.backends {
            match Backend::new(&backend_cfg.url) {
                Ok(backend) => balancer.register(Arc::new(backend)),
                Err(e) => {
                    tracing::error!(url = backend_cfg.url, error = %e, "Failed to create backend")
                }
            }
        }

        if balancer.all_backends().is_empty() {
            tracing::error!("No valid backends configured");
            return Err(LbError::Config(
                "no valid backends in configuration".to_string(),
            ));
        }

        Ok(balancer)
    }

    /// Algorithm name as reported by `/lb-status`
    pub fn name(&self) -> &'static str {
        self.algorithm.name()
    }

    /// Add a backend. A duplicate URL is a no-op.
    pub fn register(&self, backend: Arc<Backend>) {
        let mut backends = self.backends.write().unwrap();
        if backends.iter().any(|b| b.url() == backend.url()) {
            tracing::warn!(url = %backend.url(), "Backend already registered");
            return;
        }
        tracing::info!(url = %backend.url(), "Backend registered");
        backends.push(backend);
    }

    /// Remove the backend with the same URL. Missing is a no-op.
    pub fn remove(&self, backend: &Backend) {
        let mut backends = self.backends.write().unwrap();
        if let Some(pos) = backends.iter().position(|b| b.url() == backend.url()) {
            backends.remove(pos);
            tracing::info!(url = %backend.url(), "Backend removed");
        }
    }

    /// Mark the registered backend with the same URL as UP
    pub fn mark_up(&self, backend: &Backend) {
        let backends = self.backends.read().unwrap();
        if let Some(registered) = backends.iter().find(|b| b.url() == backend.url()) {
            registered.mark_up();
        }
    }

    /// Mark the registered backend with the same URL as DOWN
    pub fn mark_down(&self, backend: &Backend) {
        let backends = self.backends.read().unwrap();
        if let Some(registered) = backends.iter().find(|b| b.url() == backend.url()) {
            registered.mark_down();
        }
    }

    /// Snapshot of the currently-available backends, in registration order
    pub fn healthy_backends(&self) -> Vec<Arc<Backend>> {
        self.backends
            .read()
            .unwrap()
            .iter()
            .filter(|b| b.is_available())
            .cloned()
            .collect()
    }

    /// Snapshot of every registered backend, in registration order
    pub fn all_backends(&self) -> Vec<Arc<Backend>> {
        self.backends.read().unwrap().clone()
    }

    /// Pick a backend for the next request. Never returns an unavailable
    /// backend; fails with [`LbError::NoBackends`] when the healthy set is
    /// empty.
    pub fn next_backend(&self) -> Result<Arc<Backend>> {
        let healthy = self.healthy_backends();
        if healthy.is_empty() {
            tracing::warn!("No healthy backends available");
            return Err(LbError::NoBackends);
        }

        let backend = match self.algorithm {
            Algorithm::RoundRobin => {
                let idx = self.cursor.fetch_add(1, Ordering::Relaxed) as usize % healthy.len();
                healthy[idx].clone()
            }
            Algorithm::LeastConnections => {
                // First occurrence wins ties, so selection is deterministic
                // for a given registration order
                let mut best = &healthy[0];
                for candidate in &healthy[1..] {
                    if candidate.active_connections() < best.active_connections() {
                        best = candidate;
                    }
                }
                best.clone()
            }
            Algorithm::Random => {
                let idx = rand::thread_rng().gen_range(0..healthy.len());
                healthy[idx].clone()
            }
        };

        tracing::debug!(
            backend = %backend.url(),
            algorithm = self.name(),
            "Selected backend"
        );
        Ok(backend)
    }

    /// Per-backend request statistics, keyed by URL
    pub fn statistics(&self) -> HashMap<String, BackendStats> {
        let backends = self.backends.read().unwrap();
        let mut stats = HashMap::with_capacity(backends.len());

        for backend in backends.iter() {
            let total = backend.total_requests();
            let failed = backend.failed_requests();
            let failure_rate = if total > 0 {
                failed as f64 / total as f64 * 100.0
            } else {
                0.0
            };

            stats.insert(
                backend.url().to_string(),
                BackendStats {
                    url: backend.url().to_string(),
                    is_alive: backend.is_available(),
                    active_connections: backend.active_connections(),
                    total_requests: total,
                    failed_requests: failed,
                    failure_rate,
                },
            );
        }

        stats
    }
}
