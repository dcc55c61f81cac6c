//! Redis-backed storage — distributed token buckets via an atomic Lua script
//!
//! The refill-and-take runs server-side so that read, refill, take, and
//! write happen under Redis's per-key execution, even with several proxy
//! instances sharing the store. Config reads and writes go through a
//! bounded-retry wrapper that reconnects on connection-class errors.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError};
use tokio::sync::Mutex;

use crate::config::RedisConfig;
use crate::error::{LbError, Result};

use super::{config_key, rate_limit_key, Storage};

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Atomic token-bucket script.
///
/// KEYS[1] = bucket key; ARGV = tokens_to_take, capacity, refill_rate,
/// now (epoch ms). Returns {allowed, remaining}.
///
/// The refill timestamp advances only by the milliseconds the credited
/// tokens account for (`added * 1000 / rate`), so sustained sub-rate
/// traffic keeps its fractional accumulation. A take of zero is a pure
/// read and writes nothing back.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local take = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local rate = tonumber(ARGV[3])
local now = tonumber(ARGV[4])

local tokens = tonumber(redis.call('HGET', key, 'tokens') or capacity)
local last = tonumber(redis.call('HGET', key, 'last_refill') or now)

local elapsed = math.max(0, now - last)
local added = 0
if rate > 0 then
    added = math.floor(elapsed * rate / 1000)
end
if added > 0 then
    if tokens + added >= capacity then
        tokens = capacity
        last = now
    else
        tokens = tokens + added
        last = last + math.floor(added * 1000 / rate)
    end
end

if take <= 0 then
    return {1, tokens}
end

local allowed = 0
if tokens >= take then
    tokens = tokens - take
    allowed = 1
end

redis.call('HSET', key, 'tokens', tokens, 'last_refill', last)
return {allowed, tokens}
"#;

/// Redis-backed [`Storage`]
pub struct RedisStorage {
    client: redis::Client,
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl RedisStorage {
    /// Connect and verify the server responds to PING
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url().as_str())
            .map_err(|e| LbError::Config(format!("invalid redis address: {e}")))?;

        let storage = Self {
            client,
            connection: Mutex::new(None),
        };
        storage.ping().await?;

        tracing::info!(addr = config.addr, "Connected to Redis");
        Ok(storage)
    }

    /// Get the shared connection, establishing it if needed
    async fn connection(&self) -> std::result::Result<MultiplexedConnection, RedisError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self.client.get_multiplexed_async_connection().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Forget the cached connection so the next call dials fresh
    async fn drop_connection(&self) {
        *self.connection.lock().await = None;
    }

    /// Run `op` with bounded retries. Only connection-class failures are
    /// retried; each retry reconnects and backs off exponentially from
    /// 100 ms up to a 2 s cap.
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, RedisError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let conn = self
                .connection()
                .await
                .map_err(|e| LbError::Store(e.to_string()))?;

            match op(conn).await {
                Ok(value) => return Ok(value),
                Err(e) if is_connection_error(&e) && attempt < MAX_RETRIES => {
                    attempt += 1;
                    tracing::warn!(
                        error = %e,
                        retry = attempt,
                        max_retries = MAX_RETRIES,
                        "Redis connection error, reconnecting"
                    );
                    self.drop_connection().await;
                    tokio::time::sleep(backoff(attempt)).await;
                }
                Err(e) => return Err(LbError::Store(e.to_string())),
            }
        }
    }
}

/// Exponential backoff for the given 1-based attempt, capped at 2 s
fn backoff(attempt: u32) -> Duration {
    let exp = INITIAL_BACKOFF * 2u32.saturating_pow(attempt.saturating_sub(1));
    exp.min(MAX_BACKOFF)
}

fn is_connection_error(e: &RedisError) -> bool {
    e.is_io_error() || e.is_timeout() || e.is_connection_refusal() || e.is_connection_dropped()
}

fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[async_trait]
impl Storage for RedisStorage {
    async fn take_tokens(
        &self,
        key: &str,
        tokens: i64,
        capacity: i64,
        refill_rate: i64,
    ) -> Result<(bool, i64)> {
        let bucket_key = rate_limit_key(key);
        let now = epoch_ms();

        let result: Vec<i64> = self
            .with_retry(|mut conn| {
                let bucket_key = bucket_key.clone();
                async move {
                    redis::Script::new(TOKEN_BUCKET_SCRIPT)
                        .key(&bucket_key)
                        .arg(tokens)
                        .arg(capacity)
                        .arg(refill_rate)
                        .arg(now)
                        .invoke_async(&mut conn)
                        .await
                }
            })
            .await?;

        if result.len() != 2 {
            return Err(LbError::Store(format!(
                "unexpected token bucket script reply: {result:?}"
            )));
        }

        Ok((result[0] == 1, result[1]))
    }

    async fn get_client_config(&self, key: &str) -> Result<(i64, i64)> {
        let config_key = config_key(key);

        let fields: HashMap<String, i64> = self
            .with_retry(|mut conn| {
                let config_key = config_key.clone();
                async move { conn.hgetall(&config_key).await }
            })
            .await?;

        if fields.is_empty() {
            return Ok((0, 0));
        }

        Ok((
            fields.get("capacity").copied().unwrap_or(0),
            fields.get("refill_rate").copied().unwrap_or(0),
        ))
    }

    async fn set_client_config(&self, key: &str, capacity: i64, refill_rate: i64) -> Result<()> {
        let config_key = config_key(key);

        if capacity == 0 && refill_rate == 0 {
            self.with_retry(|mut conn| {
                let config_key = config_key.clone();
                async move { conn.del::<_, ()>(&config_key).await }
            })
            .await?;
            return Ok(());
        }

        self.with_retry(|mut conn| {
            let config_key = config_key.clone();
            async move {
                conn.hset_multiple::<_, _, _, ()>(
                    &config_key,
                    &[("capacity", capacity), ("refill_rate", refill_rate)],
                )
                .await
            }
        })
        .await?;

        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self
            .connection()
            .await
            .map_err(|e| LbError::Store(format!("redis connection failed: {e}")))?;

        redis::cmd("PING")
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| LbError::Store(format!("redis ping failed: {e}")))
    }

    async fn close(&self) -> Result<()> {
        self.drop_connection().await;
        Ok(())
    }
}
