//! Active health checking
//!
//! A [`HealthChecker`] renders a plain healthy/unhealthy verdict per probe;
//! the [`HealthLoop`] owns the hysteresis state machine that turns verdicts
//! into UP/DOWN transitions. A backend goes DOWN only after a run of
//! consecutive failures reaches the threshold, and a single healthy probe
//! brings it back.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::balancer::{Backend, Balancer};
use crate::config::HealthCheckConfig;

/// Consecutive failures before a backend is marked DOWN
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Renders a liveness verdict for one backend
#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn check(&self, backend: &Backend) -> bool;
}

/// Default checker: GET `<backend>/<path>`, 2xx/3xx is healthy, anything
/// else (including transport errors) is not.
pub struct HttpHealthChecker {
    client: reqwest::Client,
    path: String,
}

impl HttpHealthChecker {
    /// Probe timeout is half the loop interval, capped at 5 s
    pub fn new(config: &HealthCheckConfig) -> Self {
        let timeout = (config.interval / 2).min(Duration::from_secs(5));

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent("flowgate-healthcheck/1.0")
            .build()
            .unwrap_or_default();

        Self {
            client,
            path: config.path.clone(),
        }
    }
}

#[async_trait]
impl HealthChecker for HttpHealthChecker {
    async fn check(&self, backend: &Backend) -> bool {
        let url = format!(
            "{}{}",
            backend.url().as_str().trim_end_matches('/'),
            self.path
        );

        match self.client.get(&url).send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let healthy = (200..400).contains(&status);
                if !healthy {
                    tracing::debug!(backend = %backend.url(), status, "Health probe returned error status");
                }
                healthy
            }
            Err(e) => {
                tracing::debug!(backend = %backend.url(), error = %e, "Health probe failed");
                false
            }
        }
    }
}

/// Test double returning a preconfigured verdict per backend URL.
/// Unconfigured backends read as unhealthy.
#[derive(Default)]
pub struct StaticHealthChecker {
    verdicts: RwLock<HashMap<String, bool>>,
}

impl StaticHealthChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_healthy(&self, url: &str, healthy: bool) {
        self.verdicts
            .write()
            .unwrap()
            .insert(url.to_string(), healthy);
    }
}

#[async_trait]
impl HealthChecker for StaticHealthChecker {
    async fn check(&self, backend: &Backend) -> bool {
        self.verdicts
            .read()
            .unwrap()
            .get(backend.url().as_str())
            .copied()
            .unwrap_or(false)
    }
}

/// Periodic driver that fans one probe per backend out every interval
pub struct HealthLoop {
    balancer: Arc<Balancer>,
    checker: Arc<dyn HealthChecker>,
    interval: Duration,
    threshold: u32,
}

impl HealthLoop {
    pub fn new(
        balancer: Arc<Balancer>,
        checker: Arc<dyn HealthChecker>,
        config: &HealthCheckConfig,
    ) -> Self {
        Self {
            balancer,
            checker,
            interval: config.interval,
            threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Start ticking. Aborting the returned handle stops the loop;
    /// outstanding probes run to completion on their own tasks.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            threshold = self.threshold,
            "Starting health checks"
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick of a tokio interval fires immediately; skip it
            // so backends get a full interval before their first probe.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                self.tick();
            }
        })
    }

    /// Launch one probe task per registered backend. Probes run
    /// concurrently, so one slow backend never delays the others.
    pub fn tick(&self) {
        for backend in self.balancer.all_backends() {
            let checker = self.checker.clone();
            let threshold = self.threshold;
            tokio::spawn(async move {
                probe(checker.as_ref(), &backend, threshold).await;
            });
        }
    }
}

/// Probe one backend and fold the verdict into its UP/DOWN state
pub async fn probe(checker: &dyn HealthChecker, backend: &Backend, threshold: u32) {
    let healthy = checker.check(backend).await;
    apply_verdict(backend, healthy, threshold);
}

/// The hysteresis state machine.
///
/// healthy + DOWN   → UP (failure counter reset)
/// healthy + UP     → stay UP, failure run broken
/// unhealthy + UP   → count the failure; DOWN at the threshold
/// unhealthy + DOWN → no-op; probes keep running so it can recover
fn apply_verdict(backend: &Backend, healthy: bool, threshold: u32) {
    if healthy {
        if backend.is_available() {
            backend.reset_failures();
        } else {
            backend.mark_up();
        }
        return;
    }

    if backend.is_available() {
        backend.incr_failure();
        let failures = backend.failure_count();
        if failures >= threshold {
            tracing::warn!(
                backend = %backend.url(),
                failure_count = failures,
                threshold,
                "Backend exceeded failure threshold"
            );
            backend.mark_down();
        }
    }
}
