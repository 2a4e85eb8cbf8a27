//! In-process counter store.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{CounterStore, Transition, Update};
use crate::error::Result;
use crate::ratelimit::{Clock, CounterKey, CounterState};

struct Entry {
    state: CounterState,
    touched_ms: u64,
    ttl_ms: u64,
}

impl Entry {
    fn is_idle(&self, now_ms: u64, ttl_ms: u64) -> bool {
        now_ms.saturating_sub(self.touched_ms) > ttl_ms
    }
}

/// Counter store backed by a sharded concurrent map.
///
/// `atomic_update` runs the transition while holding the entry's shard lock,
/// so updates on one key are serialized. Entries idle past their TTL read as
/// absent and are physically removed by [`MemoryStore::purge_expired`].
#[derive(Clone)]
pub struct MemoryStore {
    map: Arc<DashMap<CounterKey, Entry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            map: Arc::new(DashMap::new()),
            clock,
        }
    }

    /// Remove every entry idle past its TTL. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.map.len();
        self.map.retain(|_, entry| !entry.is_idle(now, entry.ttl_ms));
        let purged = before.saturating_sub(self.map.len());
        if purged > 0 {
            debug!(purged, remaining = self.map.len(), "Purged idle counters");
        }
        purged
    }

    /// Periodically purge idle entries on the current tokio runtime.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                store.purge_expired();
            }
        })
    }

    /// Number of entries held, including idle ones not yet purged.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Current state for a key, if present and not idle.
    pub fn get(&self, key: &CounterKey) -> Option<CounterState> {
        let now = self.clock.now_millis();
        self.map
            .get(key)
            .filter(|entry| !entry.is_idle(now, entry.ttl_ms))
            .map(|entry| entry.state.clone())
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn atomic_update(
        &self,
        key: &CounterKey,
        ttl: Duration,
        transition: Transition<'_>,
    ) -> Result<Update> {
        let now = self.clock.now_millis();
        let ttl_ms = ttl.as_millis() as u64;

        let update = match self.map.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let current = if entry.is_idle(now, entry.ttl_ms) {
                    trace!(key = %key, "Counter idle past its TTL, starting fresh");
                    None
                } else {
                    Some(entry.state.clone())
                };
                let update = transition(current);
                entry.state = update.state.clone();
                entry.touched_ms = entry.touched_ms.max(now);
                entry.ttl_ms = ttl_ms;
                update
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                debug!(key = %key, "Creating counter");
                let update = transition(None);
                vacant.insert(Entry {
                    state: update.state.clone(),
                    touched_ms: now,
                    ttl_ms,
                });
                update
            }
        };

        Ok(update)
    }

    async fn expire_if_idle(&self, key: &CounterKey, ttl: Duration) -> Result<()> {
        let now = self.clock.now_millis();
        let ttl_ms = ttl.as_millis() as u64;
        self.map.remove_if(key, |_, entry| entry.is_idle(now, ttl_ms));
        Ok(())
    }

    async fn remove(&self, key: &CounterKey) -> Result<()> {
        self.map.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{AdmissionOutcome, ManualClock, Subject, WindowState};

    fn key(name: &str) -> CounterKey {
        CounterKey::new("rule", Subject::Client(name.to_string()))
    }

    fn bump(current: Option<CounterState>) -> Update {
        let mut window = current
            .and_then(|state| state.as_window().cloned())
            .unwrap_or_else(|| WindowState::empty(0));
        window.current_count += 1;
        Update {
            state: CounterState::Window(window),
            outcome: AdmissionOutcome {
                allowed: true,
                remaining: 0,
                reset_after_ms: 0,
            },
        }
    }

    fn count(store: &MemoryStore, key: &CounterKey) -> Option<u64> {
        store
            .get(key)
            .and_then(|state| state.as_window().map(|w| w.current_count))
    }

    #[tokio::test]
    async fn test_update_creates_and_accumulates() {
        let store = MemoryStore::new(Arc::new(ManualClock::new(0)));
        let k = key("alice");
        assert!(store.is_empty());

        store.atomic_update(&k, Duration::from_secs(1), &bump).await.unwrap();
        store.atomic_update(&k, Duration::from_secs(1), &bump).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(count(&store, &k), Some(2));
    }

    #[tokio::test]
    async fn test_idle_entry_reads_as_absent() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::new(clock.clone());
        let k = key("bob");

        store.atomic_update(&k, Duration::from_secs(1), &bump).await.unwrap();
        store.atomic_update(&k, Duration::from_secs(1), &bump).await.unwrap();

        clock.advance(Duration::from_millis(1_001));
        assert_eq!(count(&store, &k), None);

        store.atomic_update(&k, Duration::from_secs(1), &bump).await.unwrap();
        assert_eq!(count(&store, &k), Some(1));
    }

    #[tokio::test]
    async fn test_expire_if_idle() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::new(clock.clone());
        let k = key("carol");
        store.atomic_update(&k, Duration::from_secs(60), &bump).await.unwrap();

        clock.advance(Duration::from_secs(5));
        store.expire_if_idle(&k, Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.len(), 1);

        store.expire_if_idle(&k, Duration::from_secs(1)).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::new(clock.clone());
        store.atomic_update(&key("short"), Duration::from_secs(1), &bump).await.unwrap();
        store.atomic_update(&key("long"), Duration::from_secs(60), &bump).await.unwrap();

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(count(&store, &key("long")), Some(1));
    }

    #[tokio::test]
    async fn test_remove() {
        let store = MemoryStore::new(Arc::new(ManualClock::new(0)));
        let k = key("dave");
        store.atomic_update(&k, Duration::from_secs(1), &bump).await.unwrap();
        store.remove(&k).await.unwrap();
        assert!(store.is_empty());
        tokio_test::assert_ok!(store.ping().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_are_serialized() {
        let store = MemoryStore::new(Arc::new(ManualClock::new(0)));
        let k = key("shared");

        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let store = store.clone();
                let k = k.clone();
                tokio::spawn(async move {
                    store.atomic_update(&k, Duration::from_secs(60), &bump).await
                })
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            result.unwrap().unwrap();
        }
        assert_eq!(count(&store, &k), Some(200));
    }
}
