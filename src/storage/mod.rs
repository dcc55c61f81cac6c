//! Key-value backing for token buckets and per-client configs
//!
//! Two interchangeable implementations with identical semantics: an
//! in-process map for single-instance deployments and a Redis store whose
//! refill-and-take runs server-side as an atomic Lua script.

mod memory;
mod redis;

pub use self::memory::MemoryStorage;
pub use self::redis::RedisStorage;

use async_trait::async_trait;

use crate::error::Result;

/// Key prefix for token buckets
pub const RATE_LIMIT_PREFIX: &str = "ratelimit:";
/// Key prefix for per-client configs, nested under the rate-limit namespace
pub const CONFIG_PREFIX: &str = "config:";

/// Namespaced bucket key for a client
pub fn rate_limit_key(client_id: &str) -> String {
    format!("{RATE_LIMIT_PREFIX}{client_id}")
}

/// Namespaced config key for a client
pub fn config_key(client_id: &str) -> String {
    format!("{RATE_LIMIT_PREFIX}{CONFIG_PREFIX}{client_id}")
}

/// Backing store for the rate limiter.
///
/// Operations on the same key are linearizable; nothing is guaranteed
/// across keys.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Atomic refill-and-take on the bucket for `key`.
    ///
    /// Refill adds `floor(elapsed_ms * refill_rate / 1000)` tokens up to
    /// `capacity`; the refill timestamp advances only by the time those
    /// tokens account for, so fractional accumulation is never lost. A
    /// bucket seen for the first time starts full.
    ///
    /// `tokens <= 0` is a read-only peek: the refilled level is computed
    /// and returned but nothing is persisted.
    ///
    /// Returns `(allowed, remaining)`.
    async fn take_tokens(
        &self,
        key: &str,
        tokens: i64,
        capacity: i64,
        refill_rate: i64,
    ) -> Result<(bool, i64)>;

    /// Per-client `(capacity, refill_rate)`; `(0, 0)` means "unset"
    async fn get_client_config(&self, key: &str) -> Result<(i64, i64)>;

    /// Store a per-client config. Writing `(0, 0)` deletes the entry.
    async fn set_client_config(&self, key: &str, capacity: i64, refill_rate: i64) -> Result<()>;

    /// Liveness check, used at startup
    async fn ping(&self) -> Result<()>;

    /// Release any held resources
    async fn close(&self) -> Result<()>;
}
