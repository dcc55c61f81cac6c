//! In-process storage — a single mutex over both maps
//!
//! The default store when no Redis address is configured. The mutex makes
//! every refill-and-take trivially atomic; critical sections are a few map
//! operations, so contention is negligible next to request I/O.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::Result;

use super::Storage;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: i64,
    last_refill: Instant,
}

#[derive(Default)]
struct Inner {
    buckets: HashMap<String, Bucket>,
    configs: HashMap<String, (i64, i64)>,
}

/// Memory-backed [`Storage`]
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refill-and-take against an explicit clock reading. The public trait
    /// method passes `Instant::now()`; tests pass synthetic instants.
    fn take_at(
        &self,
        key: &str,
        tokens_to_take: i64,
        capacity: i64,
        refill_rate: i64,
        now: Instant,
    ) -> (bool, i64) {
        let mut inner = self.inner.lock().unwrap();

        if tokens_to_take <= 0 {
            // Peek: report the refilled level without persisting anything
            let current = match inner.buckets.get(key) {
                Some(bucket) => {
                    let (tokens, _) = refilled(bucket, capacity, refill_rate, now);
                    tokens
                }
                None => capacity,
            };
            return (true, current);
        }

        let bucket = inner.buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: capacity,
            last_refill: now,
        });

        let (tokens, last_refill) = refilled(bucket, capacity, refill_rate, now);
        bucket.tokens = tokens;
        bucket.last_refill = last_refill;

        if bucket.tokens >= tokens_to_take {
            bucket.tokens -= tokens_to_take;
            (true, bucket.tokens)
        } else {
            (false, bucket.tokens)
        }
    }
}

/// Compute the refilled token count and the advanced refill timestamp.
///
/// Integer-millisecond basis. The timestamp moves forward only by the time
/// the credited tokens account for, so sub-second progress is carried over
/// to the next call instead of being dropped. A full bucket snaps to `now`.
fn refilled(bucket: &Bucket, capacity: i64, refill_rate: i64, now: Instant) -> (i64, Instant) {
    if refill_rate <= 0 {
        return (bucket.tokens, bucket.last_refill);
    }

    let elapsed_ms = now.saturating_duration_since(bucket.last_refill).as_millis() as i64;
    let added = elapsed_ms.saturating_mul(refill_rate) / 1000;
    if added <= 0 {
        return (bucket.tokens, bucket.last_refill);
    }

    if bucket.tokens.saturating_add(added) >= capacity {
        (capacity, now)
    } else {
        let consumed_ms = (added.saturating_mul(1000) / refill_rate) as u64;
        (
            bucket.tokens + added,
            bucket.last_refill + Duration::from_millis(consumed_ms),
        )
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn take_tokens(
        &self,
        key: &str,
        tokens: i64,
        capacity: i64,
        refill_rate: i64,
    ) -> Result<(bool, i64)> {
        Ok(self.take_at(key, tokens, capacity, refill_rate, Instant::now()))
    }

    async fn get_client_config(&self, key: &str) -> Result<(i64, i64)> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.configs.get(key).copied().unwrap_or((0, 0)))
    }

    async fn set_client_config(&self, key: &str, capacity: i64, refill_rate: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if capacity == 0 && refill_rate == 0 {
            inner.configs.remove(key);
        } else {
            inner.configs.insert(key.to_string(), (capacity, refill_rate));
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
