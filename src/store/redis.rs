//! Redis-backed counter store shared by every instance.
//!
//! Atomicity comes from an optimistic compare-and-set loop: read the encoded
//! state, run the transition locally, then commit through a Lua script that
//! writes only if the stored value is still the one that was read. A lost race
//! re-reads and re-runs the transition, which is why transitions must be pure.
//! Losing every race is reported as contention on that key, not as the store
//! being unavailable.

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use super::{CounterStore, Transition, Update};
use crate::config::RedisConfig;
use crate::error::{GatekeeperError, Result};
use crate::ratelimit::{CounterKey, CounterState};

/// Write `ARGV[2]` with a `PX ARGV[3]` expiry if the key still holds `ARGV[1]`
/// (empty string meaning absent). Returns 1 on commit, 0 on conflict.
const COMPARE_AND_SET: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == false then
    current = ''
end
if current ~= ARGV[1] then
    return 0
end
redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
return 1
"#;

/// Pull the key's expiry in to `ARGV[1]` milliseconds if it is later than that.
const SHORTEN_EXPIRY: &str = r#"
local pttl = redis.call('PTTL', KEYS[1])
if pttl == -1 or pttl > tonumber(ARGV[1]) then
    return redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return 0
"#;

/// Runtime settings for [`RedisStore`].
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    pub url: String,
    /// Namespace prepended to every key
    pub key_prefix: String,
    /// Bound on each store operation, connection setup included
    pub timeout: Duration,
    /// Compare-and-set attempts before giving up on a contended key
    pub max_attempts: u32,
}

impl From<&RedisConfig> for RedisStoreConfig {
    fn from(config: &RedisConfig) -> Self {
        Self {
            url: config.url.clone(),
            key_prefix: config.key_prefix.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            max_attempts: config.max_attempts.max(1),
        }
    }
}

/// Counter store kept in Redis.
pub struct RedisStore {
    client: ::redis::Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    config: RedisStoreConfig,
    compare_and_set: Script,
    shorten_expiry: Script,
}

impl RedisStore {
    /// Create the store. Does not connect; see [`RedisStore::connection`].
    pub fn new(config: RedisStoreConfig) -> Result<Self> {
        let client = ::redis::Client::open(config.url.as_str()).map_err(|e| {
            GatekeeperError::Configuration(format!("invalid Redis URL '{}': {e}", config.url))
        })?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
            config,
            compare_and_set: Script::new(COMPARE_AND_SET),
            shorten_expiry: Script::new(SHORTEN_EXPIRY),
        })
    }

    fn storage_key(&self, key: &CounterKey) -> String {
        format!("{}{}", self.config.key_prefix, key.to_storage_key())
    }

    /// Shared multiplexed connection, established on first use and after failures.
    async fn connection(&self) -> Result<MultiplexedConnection> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        info!(url = %self.config.url, "Connected to Redis counter store");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Run `op` within the configured timeout, dropping the cached connection
    /// on any failure so the next call reconnects. Contention leaves the
    /// connection alone.
    async fn bounded<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        T: Send,
        F: Future<Output = Result<T>> + Send,
    {
        match tokio::time::timeout(self.config.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) if err.is_store_contention() => {
                debug!(op, error = %err, "Redis counter contended");
                Err(err)
            }
            Ok(Err(err)) => {
                warn!(op, error = %err, "Redis counter store operation failed");
                *self.connection.lock().await = None;
                Err(err)
            }
            Err(_) => {
                warn!(
                    op,
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "Redis counter store operation timed out"
                );
                *self.connection.lock().await = None;
                Err(GatekeeperError::StoreUnavailable(format!(
                    "{op} timed out after {}ms",
                    self.config.timeout.as_millis()
                )))
            }
        }
    }

    async fn compare_and_set_loop(
        &self,
        key: &str,
        ttl_ms: u64,
        transition: Transition<'_>,
    ) -> Result<Update> {
        let mut conn = self.connection().await?;

        for attempt in 1..=self.config.max_attempts {
            let raw: Option<String> = conn.get(key).await?;
            let current = match raw.as_deref().map(serde_json::from_str::<CounterState>) {
                Some(Ok(state)) => Some(state),
                Some(Err(e)) => {
                    warn!(key, error = %e, "Discarding undecodable counter state");
                    None
                }
                None => None,
            };

            let update = transition(current);
            let encoded = serde_json::to_string(&update.state).map_err(|e| {
                GatekeeperError::StoreUnavailable(format!("failed to encode counter state: {e}"))
            })?;

            let committed: i64 = self
                .compare_and_set
                .key(key)
                .arg(raw.unwrap_or_default())
                .arg(encoded)
                .arg(ttl_ms.max(1))
                .invoke_async(&mut conn)
                .await?;

            if committed == 1 {
                return Ok(update);
            }
            trace!(key, attempt, "Counter changed concurrently, retrying");
            tokio::task::yield_now().await;
        }

        Err(GatekeeperError::StoreContention(format!(
            "could not commit update to '{key}' after {} attempts",
            self.config.max_attempts
        )))
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn atomic_update(
        &self,
        key: &CounterKey,
        ttl: Duration,
        transition: Transition<'_>,
    ) -> Result<Update> {
        let key = self.storage_key(key);
        let ttl_ms = ttl.as_millis() as u64;
        self.bounded(
            "atomic_update",
            self.compare_and_set_loop(&key, ttl_ms, transition),
        )
        .await
    }

    async fn expire_if_idle(&self, key: &CounterKey, ttl: Duration) -> Result<()> {
        let key = self.storage_key(key);
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        self.bounded("expire_if_idle", async {
            let mut conn = self.connection().await?;
            let _: i64 = self
                .shorten_expiry
                .key(&key)
                .arg(ttl_ms)
                .invoke_async(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, key: &CounterKey) -> Result<()> {
        let key = self.storage_key(key);
        self.bounded("remove", async {
            let mut conn = self.connection().await?;
            let _: i64 = conn.del(&key).await?;
            Ok(())
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.bounded("ping", async {
            let mut conn = self.connection().await?;
            let _pong: String = ::redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }
}
