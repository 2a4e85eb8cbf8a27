//! Counter stores.
//!
//! A counter store is where per-key admission state lives. The algorithms are
//! written only against [`CounterStore::atomic_update`], so the same code runs
//! over a single-process map or a remote store shared by many instances.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::{RedisStore, RedisStoreConfig};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{StoreConfig, StoreKind};
use crate::error::Result;
use crate::ratelimit::{AdmissionOutcome, Clock, CounterKey, CounterState};

/// Result of a state transition: the state to persist and what to report.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub state: CounterState,
    pub outcome: AdmissionOutcome,
}

/// A pure state transition. Backends that retry on conflict may call it more
/// than once, so it must not have side effects.
pub type Transition<'a> = &'a (dyn Fn(Option<CounterState>) -> Update + Send + Sync);

/// Atomic primitives over per-key counter state.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Apply `transition` to the stored state (or `None` if absent/expired)
    /// and persist the result with an idle `ttl`.
    ///
    /// No other `atomic_update` on the same key interleaves with the
    /// read-modify-write.
    async fn atomic_update(
        &self,
        key: &CounterKey,
        ttl: Duration,
        transition: Transition<'_>,
    ) -> Result<Update>;

    /// Advisory: drop the entry if it has not been touched for `ttl`.
    async fn expire_if_idle(&self, key: &CounterKey, ttl: Duration) -> Result<()>;

    /// Remove the entry unconditionally.
    async fn remove(&self, key: &CounterKey) -> Result<()>;

    /// Check the store is reachable.
    async fn ping(&self) -> Result<()>;
}

/// Concrete store selected by configuration.
pub enum StoreBackend {
    Memory(MemoryStore),
    Redis(RedisStore),
}

impl StoreBackend {
    /// Build the backend named by `config`.
    ///
    /// Building a Redis backend does not connect; the first call that needs the
    /// server connects, so an unreachable server degrades at request time.
    pub fn from_config(config: &StoreConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        match config.backend {
            StoreKind::Memory => Ok(StoreBackend::Memory(MemoryStore::new(clock))),
            StoreKind::Redis => Ok(StoreBackend::Redis(RedisStore::new(
                RedisStoreConfig::from(&config.redis),
            )?)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StoreBackend::Memory(_) => "memory",
            StoreBackend::Redis(_) => "redis",
        }
    }
}

#[async_trait]
impl CounterStore for StoreBackend {
    async fn atomic_update(
        &self,
        key: &CounterKey,
        ttl: Duration,
        transition: Transition<'_>,
    ) -> Result<Update> {
        match self {
            StoreBackend::Memory(store) => store.atomic_update(key, ttl, transition).await,
            StoreBackend::Redis(store) => store.atomic_update(key, ttl, transition).await,
        }
    }

    async fn expire_if_idle(&self, key: &CounterKey, ttl: Duration) -> Result<()> {
        match self {
            StoreBackend::Memory(store) => store.expire_if_idle(key, ttl).await,
            StoreBackend::Redis(store) => store.expire_if_idle(key, ttl).await,
        }
    }

    async fn remove(&self, key: &CounterKey) -> Result<()> {
        match self {
            StoreBackend::Memory(store) => store.remove(key).await,
            StoreBackend::Redis(store) => store.remove(key).await,
        }
    }

    async fn ping(&self) -> Result<()> {
        match self {
            StoreBackend::Memory(store) => store.ping().await,
            StoreBackend::Redis(store) => store.ping().await,
        }
    }
}
