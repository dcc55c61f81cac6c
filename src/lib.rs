//! # flowgate
//!
//! An HTTP reverse-proxy load balancer with active health checking and
//! per-client token-bucket rate limiting.
//!
//! ## Architecture
//!
//! ```text
//! Client → Proxy → RateLimiter(Storage) → Balancer → Backend
//!                        ↑
//!              HealthLoop (probes, hysteresis)
//! ```
//!
//! ## Core Features
//!
//! - **Load Balancing**: round-robin, least-connections, random over a
//!   lock-free healthy-set snapshot
//! - **Health Checks**: periodic HTTP probes with a consecutive-failure
//!   threshold before a backend goes DOWN
//! - **Rate Limiting**: distributed token bucket (in-process or Redis) with
//!   per-client configs and a read-through cache
//! - **Management API**: JSON endpoints for client configs, bucket status,
//!   balancer state, and per-backend statistics on the same port
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use flowgate::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(Some("config.yaml"))?;
//!     // assemble balancer, rate limiter, proxy, server — see src/main.rs
//!     Ok(())
//! }
//! ```

pub mod balancer;
pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod proxy;
pub mod ratelimit;
pub mod server;
pub mod storage;

pub use error::{LbError, Result};
