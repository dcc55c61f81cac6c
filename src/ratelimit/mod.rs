//! Token-bucket rate limiter with a read-through per-client config cache

mod clients;

pub use clients::ClientManager;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::{RateLimitConfig, TokenBucketConfig};
use crate::error::{LbError, Result};
use crate::storage::Storage;

/// Token-bucket policy engine over a [`Storage`].
///
/// Per-client capacity and refill rate are resolved through an in-process
/// cache; misses read through to storage and fall back to the default
/// config when the store has no entry. Updates write through storage first
/// and only then refresh the cache, so a failed write never leaves the
/// cache ahead of the store.
pub struct TokenBucketRateLimiter {
    storage: Arc<dyn Storage>,
    default_config: TokenBucketConfig,
    clients: RwLock<HashMap<String, TokenBucketConfig>>,
}

impl TokenBucketRateLimiter {
    /// Create a limiter, verifying the storage responds
    pub async fn new(storage: Arc<dyn Storage>, config: &RateLimitConfig) -> Result<Self> {
        storage.ping().await?;

        Ok(Self {
            storage,
            default_config: config.default,
            clients: RwLock::new(HashMap::new()),
        })
    }

    /// Bucket parameters applied to clients without an explicit config
    pub fn default_config(&self) -> TokenBucketConfig {
        self.default_config
    }

    /// Try to take `tokens` from the client's bucket.
    ///
    /// Returns the remaining token count on success. `tokens <= 0` is a
    /// peek: the current level is returned and nothing is consumed. A
    /// policy denial is [`LbError::RateLimitExceeded`] (carrying the
    /// remaining count) so callers can tell it apart from storage failures.
    pub async fn allow(&self, client_id: &str, tokens: i64) -> Result<i64> {
        let config = self.resolve_config(client_id).await.map_err(|e| {
            tracing::error!(client_id, error = %e, "Failed to get client config");
            e
        })?;

        let (allowed, remaining) = self
            .storage
            .take_tokens(client_id, tokens, config.capacity, config.refill_rate)
            .await
            .map_err(|e| {
                tracing::error!(client_id, error = %e, "Failed to take tokens");
                e
            })?;

        if !allowed {
            tracing::debug!(
                client_id,
                requested = tokens,
                remaining,
                capacity = config.capacity,
                "Rate limit exceeded"
            );
            return Err(LbError::RateLimitExceeded { remaining });
        }

        tracing::debug!(
            client_id,
            requested = tokens,
            remaining,
            capacity = config.capacity,
            "Request allowed"
        );
        Ok(remaining)
    }

    /// Resolve the client's bucket parameters: cache, then storage, then
    /// the default config. The resolved pair is cached either way.
    async fn resolve_config(&self, client_id: &str) -> Result<TokenBucketConfig> {
        if let Some(config) = self.clients.read().unwrap().get(client_id) {
            return Ok(*config);
        }

        let (capacity, refill_rate) = self.storage.get_client_config(client_id).await?;
        let config = if capacity == 0 || refill_rate == 0 {
            self.default_config
        } else {
            TokenBucketConfig {
                capacity,
                refill_rate,
            }
        };

        self.clients
            .write()
            .unwrap()
            .insert(client_id.to_string(), config);

        Ok(config)
    }

    /// Validate and persist a client's bucket parameters, then refresh the
    /// cache. Storage failure leaves the cache untouched.
    pub async fn update_client_config(
        &self,
        client_id: &str,
        capacity: i64,
        refill_rate: i64,
    ) -> Result<()> {
        if capacity <= 0 || refill_rate <= 0 {
            return Err(LbError::InvalidArgument(
                "capacity and refill_rate must be positive".to_string(),
            ));
        }

        self.storage
            .set_client_config(client_id, capacity, refill_rate)
            .await?;

        self.clients.write().unwrap().insert(
            client_id.to_string(),
            TokenBucketConfig {
                capacity,
                refill_rate,
            },
        );

        tracing::info!(
            client_id,
            capacity,
            refill_rate,
            "Client rate limit config updated"
        );
        Ok(())
    }

    /// Drop the cached config for a client, forcing the next resolution to
    /// read through storage again. Called after a config delete.
    pub fn invalidate(&self, client_id: &str) {
        self.clients.write().unwrap().remove(client_id);
    }

    /// Release limiter resources. The storage itself is closed by its owner.
    pub async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::error::{LbError, Result};
    use crate::storage::Storage;

    /// Scriptable in-memory [`Storage`] double: no refill, injectable
    /// failures, call counting for cache assertions.
    #[derive(Default)]
    pub struct MockStorage {
        pub tokens: Mutex<HashMap<String, i64>>,
        pub configs: Mutex<HashMap<String, (i64, i64)>>,
        pub fail_ping: Mutex<bool>,
        pub fail_take: Mutex<bool>,
        pub fail_config: Mutex<bool>,
        pub config_reads: Mutex<u32>,
    }

    impl MockStorage {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl Storage for MockStorage {
        async fn take_tokens(
            &self,
            key: &str,
            tokens: i64,
            capacity: i64,
            _refill_rate: i64,
        ) -> Result<(bool, i64)> {
            if *self.fail_take.lock().unwrap() {
                return Err(LbError::Store("take failed".to_string()));
            }

            let mut map = self.tokens.lock().unwrap();
            let bucket = map.entry(key.to_string()).or_insert(capacity);
            if tokens <= 0 {
                return Ok((true, *bucket));
            }
            if *bucket >= tokens {
                *bucket -= tokens;
                Ok((true, *bucket))
            } else {
                Ok((false, *bucket))
            }
        }

        async fn get_client_config(&self, key: &str) -> Result<(i64, i64)> {
            if *self.fail_config.lock().unwrap() {
                return Err(LbError::Store("config read failed".to_string()));
            }
            *self.config_reads.lock().unwrap() += 1;
            Ok(self
                .configs
                .lock()
                .unwrap()
                .get(key)
                .copied()
                .unwrap_or((0, 0)))
        }

        async fn set_client_config(&self, key: &str, capacity: i64, refill_rate: i64) -> Result<()> {
            if *self.fail_config.lock().unwrap() {
                return Err(LbError::Store("config write failed".to_string()));
            }
            let mut configs = self.configs.lock().unwrap();
            if capacity == 0 && refill_rate == 0 {
                configs.remove(key);
            } else {
                configs.insert(key.to_string(), (capacity, refill_rate));
            }
            Ok(())
        }

        async fn ping(&self) -> Result<()> {
            if *self.fail_ping.lock().unwrap() {
                return Err(LbError::Store("ping failed".to_string()));
            }
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockStorage;
    use super::*;

    fn rate_limit_config(capacity: i64, refill_rate: i64) -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            default: TokenBucketConfig {
                capacity,
                refill_rate,
            },
            ..RateLimitConfig::default()
        }
    }

    async fn limiter_with(store: Arc<MockStorage>) -> TokenBucketRateLimiter {
        TokenBucketRateLimiter::new(store, &rate_limit_config(50, 10))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_new_fails_when_ping_fails() {
        let store = Arc::new(MockStorage::new());
        *store.fail_ping.lock().unwrap() = true;
        let result = TokenBucketRateLimiter::new(store, &rate_limit_config(50, 10)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_allow_with_enough_tokens() {
        let store = Arc::new(MockStorage::new());
        store.configs.lock().unwrap().insert("c".into(), (20, 5));
        let limiter = limiter_with(store).await;

        let remaining = limiter.allow("c", 5).await.unwrap();
        assert_eq!(remaining, 15);
    }

    #[tokio::test]
    async fn test_denial_carries_remaining() {
        let store = Arc::new(MockStorage::new());
        store.configs.lock().unwrap().insert("c".into(), (2, 1));
        let limiter = limiter_with(store).await;

        limiter.allow("c", 2).await.unwrap();
        match limiter.allow("c", 1).await {
            Err(LbError::RateLimitExceeded { remaining }) => assert_eq!(remaining, 0),
            other => panic!("expected RateLimitExceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_zero_token_peek_does_not_consume() {
        let store = Arc::new(MockStorage::new());
        store.configs.lock().unwrap().insert("c".into(), (10, 1));
        let limiter = limiter_with(store.clone()).await;

        limiter.allow("c", 3).await.unwrap();
        assert_eq!(limiter.allow("c", 0).await.unwrap(), 7);
        // Still 7 afterwards
        assert_eq!(limiter.allow("c", 0).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_unknown_client_uses_defaults() {
        let store = Arc::new(MockStorage::new());
        let limiter = limiter_with(store).await;

        // Default capacity 50: bucket starts full
        let remaining = limiter.allow("unseen", 1).await.unwrap();
        assert_eq!(remaining, 49);
    }

    #[tokio::test]
    async fn test_config_is_cached_after_first_resolution() {
        let store = Arc::new(MockStorage::new());
        store.configs.lock().unwrap().insert("c".into(), (20, 5));
        let limiter = limiter_with(store.clone()).await;

        limiter.allow("c", 1).await.unwrap();
        limiter.allow("c", 1).await.unwrap();
        limiter.allow("c", 1).await.unwrap();
        assert_eq!(*store.config_reads.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reread() {
        let store = Arc::new(MockStorage::new());
        store.configs.lock().unwrap().insert("c".into(), (20, 5));
        let limiter = limiter_with(store.clone()).await;

        limiter.allow("c", 1).await.unwrap();
        limiter.invalidate("c");
        limiter.allow("c", 1).await.unwrap();
        assert_eq!(*store.config_reads.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_storage_error_propagates() {
        let store = Arc::new(MockStorage::new());
        let limiter = limiter_with(store.clone()).await;
        *store.fail_take.lock().unwrap() = true;

        match limiter.allow("c", 1).await {
            Err(LbError::Store(_)) => {}
            other => panic!("expected Store error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_update_validates_arguments() {
        let store = Arc::new(MockStorage::new());
        let limiter = limiter_with(store).await;

        assert!(matches!(
            limiter.update_client_config("c", 0, 5).await,
            Err(LbError::InvalidArgument(_))
        ));
        assert!(matches!(
            limiter.update_client_config("c", 5, -1).await,
            Err(LbError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_update_writes_through_then_caches() {
        let store = Arc::new(MockStorage::new());
        let limiter = limiter_with(store.clone()).await;

        limiter.update_client_config("c", 100, 20).await.unwrap();
        assert_eq!(
            store.configs.lock().unwrap().get("c").copied(),
            Some((100, 20))
        );

        // Served from the cache without touching storage
        limiter.allow("c", 1).await.unwrap();
        assert_eq!(*store.config_reads.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_update_leaves_cache_untouched() {
        let store = Arc::new(MockStorage::new());
        store.configs.lock().unwrap().insert("c".into(), (20, 5));
        let limiter = limiter_with(store.clone()).await;

        // Prime the cache with (20, 5)
        limiter.allow("c", 1).await.unwrap();

        *store.fail_config.lock().unwrap() = true;
        assert!(limiter.update_client_config("c", 999, 999).await.is_err());
        *store.fail_config.lock().unwrap() = false;

        // Cache still resolves to the old capacity: bucket was created with
        // capacity 20, and no re-read happened.
        assert_eq!(*store.config_reads.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_happens_before_allow() {
        let store = Arc::new(MockStorage::new());
        let limiter = limiter_with(store).await;

        limiter.update_client_config("c", 5, 1).await.unwrap();
        let remaining = limiter.allow("c", 1).await.unwrap();
        assert_eq!(remaining, 4);
    }
}
