//! Core rate limiter implementation.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::catalog::LimitCatalog;
use super::clock::{Clock, SystemClock};
use super::composer::{compose, Decision, DecisionReason};
use super::context::RequestContext;
use super::fallback::FallbackPolicy;
use super::key::CounterKey;
use crate::config::GatekeeperConfig;
use crate::error::{GatekeeperError, Result};
use crate::store::{CounterStore, StoreBackend};

/// Point-in-time copy of the limiter counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimiterStats {
    pub requests_total: u64,
    /// Requests rejected because a rule was exhausted
    pub throttled_total: u64,
    /// Requests decided by the fallback verdict
    pub fallback_total: u64,
    /// Requests rejected because their counter stayed contended
    pub contended_total: u64,
    pub degraded: bool,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    throttled: AtomicU64,
    fallback: AtomicU64,
    contended: AtomicU64,
}

/// The rate limiting engine.
///
/// This struct is thread-safe and can be shared across multiple tasks. Each
/// call to [`RateLimiter::check`] resolves the applicable rules from one
/// catalog snapshot, evaluates them against the counter store and returns a
/// [`Decision`]. Store failures are absorbed by the fallback policy, while
/// contention on one counter only rejects the request that hit it.
pub struct RateLimiter<S = StoreBackend> {
    catalog: Arc<LimitCatalog>,
    store: Arc<S>,
    fallback: FallbackPolicy,
    clock: Arc<dyn Clock>,
    counters: Counters,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<S: CounterStore> RateLimiter<S> {
    pub fn new(
        catalog: Arc<LimitCatalog>,
        store: Arc<S>,
        fallback: FallbackPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            catalog,
            store,
            fallback,
            clock,
            counters: Counters::default(),
            sweeper: Mutex::new(None),
        }
    }

    pub fn catalog(&self) -> &Arc<LimitCatalog> {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn fallback(&self) -> &FallbackPolicy {
        &self.fallback
    }

    /// Decide whether to admit `ctx`. Never fails; every outcome, including
    /// an unreachable store, is expressed as a [`Decision`].
    pub async fn check(&self, ctx: &RequestContext) -> Decision {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        if let Err(err) = ctx.validate() {
            debug!(error = %err, endpoint = %ctx.endpoint, "Rejecting unclassifiable request");
            return Decision::invalid_request_context();
        }

        let now = self.clock.now_millis();

        if self.fallback.is_degraded() {
            if !self.fallback.try_acquire_probe(now) {
                return self.fallback_decision();
            }
            match self.store.ping().await {
                Ok(()) => self.fallback.mark_recovered(),
                Err(err) => {
                    debug!(error = %err, "Counter store probe failed");
                    return self.fallback_decision();
                }
            }
        }

        let rules = self.catalog.snapshot().resolve(ctx);
        trace!(endpoint = %ctx.endpoint, rules = rules.len(), "Checking rate limit");

        match compose(self.store.as_ref(), &rules, ctx, now).await {
            Ok(decision) => {
                if decision.reason == DecisionReason::RateLimited {
                    self.counters.throttled.fetch_add(1, Ordering::Relaxed);
                }
                decision
            }
            Err(err) if err.is_store_contention() => {
                // One hot counter; the store and every other key are fine.
                warn!(error = %err, endpoint = %ctx.endpoint, "Rejecting request on contended counter");
                self.counters.contended.fetch_add(1, Ordering::Relaxed);
                Decision::store_contention()
            }
            Err(err) => {
                self.fallback.mark_unavailable(now, &err.to_string());
                self.fallback_decision()
            }
        }
    }

    fn fallback_decision(&self) -> Decision {
        self.counters.fallback.fetch_add(1, Ordering::Relaxed);
        Decision::store_unavailable(self.fallback.mode().allows())
    }

    fn keys_for(&self, ctx: &RequestContext) -> Vec<(CounterKey, std::time::Duration)> {
        self.catalog
            .snapshot()
            .resolve(ctx)
            .iter()
            .filter_map(|rule| {
                CounterKey::for_rule(rule, ctx).map(|key| (key, rule.interval.duration()))
            })
            .collect()
    }

    /// Clear every counter the rules applying to `ctx` address.
    pub async fn reset(&self, ctx: &RequestContext) -> Result<()> {
        ctx.validate()?;
        for (key, _) in self.keys_for(ctx) {
            self.store.remove(&key).await?;
            debug!(key = %key, "Counter reset");
        }
        Ok(())
    }

    /// Let the store reclaim counters for `ctx` that have been idle for a full
    /// rule interval.
    pub async fn expire_idle(&self, ctx: &RequestContext) -> Result<()> {
        ctx.validate()?;
        for (key, interval) in self.keys_for(ctx) {
            self.store.expire_if_idle(&key, interval).await?;
        }
        Ok(())
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            requests_total: self.counters.requests.load(Ordering::Relaxed),
            throttled_total: self.counters.throttled.load(Ordering::Relaxed),
            fallback_total: self.counters.fallback.load(Ordering::Relaxed),
            contended_total: self.counters.contended.load(Ordering::Relaxed),
            degraded: self.fallback.is_degraded(),
        }
    }
}

impl RateLimiter<StoreBackend> {
    /// Build a limiter from service configuration.
    ///
    /// Loads the rule file named by `rules_path` and the configured store.
    /// With the memory store, an idle-counter sweeper is started when called
    /// inside a tokio runtime.
    pub fn from_config(config: &GatekeeperConfig) -> Result<Self> {
        let rules_path = config.rules_path.as_ref().ok_or_else(|| {
            GatekeeperError::Configuration("rules_path is not set".to_string())
        })?;
        let catalog = Arc::new(LimitCatalog::from_file(rules_path)?);
        Self::with_catalog(config, catalog, Arc::new(SystemClock))
    }

    /// Build a limiter from service configuration around an existing catalog.
    pub fn with_catalog(
        config: &GatekeeperConfig,
        catalog: Arc<LimitCatalog>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let store = StoreBackend::from_config(&config.store, clock.clone())?;
        info!(
            backend = store.name(),
            fallback = ?config.fallback.mode,
            "Rate limiter initialized"
        );

        let sweeper = match (&store, config.store.memory.sweep_interval()) {
            (StoreBackend::Memory(memory), Some(interval)) => {
                match tokio::runtime::Handle::try_current() {
                    Ok(_) => Some(memory.spawn_sweeper(interval)),
                    Err(_) => {
                        warn!("No tokio runtime, idle counters are only expired lazily");
                        None
                    }
                }
            }
            _ => None,
        };

        let limiter = Self::new(
            catalog,
            Arc::new(store),
            FallbackPolicy::from_config(&config.fallback),
            clock,
        );
        *limiter.sweeper.lock() = sweeper;
        Ok(limiter)
    }
}

impl<S> Drop for RateLimiter<S> {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}
