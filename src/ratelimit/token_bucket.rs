//! Token bucket admission.
//!
//! Capacity is the rule's `rate`, refilled continuously at `rate / interval`.
//! Refill is computed lazily from the elapsed time whenever the bucket is
//! observed, so no timer is needed.

use tracing::trace;

use super::counter::{AdmissionOutcome, BucketState, CounterState};
use super::key::CounterKey;
use super::rules::LimitRule;
use crate::error::Result;
use crate::store::{CounterStore, Update};

/// Bucket parameters derived from a rule.
#[derive(Debug, Clone, Copy)]
pub struct BucketParams {
    pub capacity: f64,
    pub interval_ms: f64,
}

impl BucketParams {
    pub fn from_rule(rule: &LimitRule) -> Self {
        Self {
            capacity: rule.rate as f64,
            interval_ms: rule.interval.as_millis() as f64,
        }
    }

    /// Milliseconds needed to regenerate `tokens` tokens.
    fn millis_for(&self, tokens: f64) -> u64 {
        (tokens.max(0.0) * self.interval_ms / self.capacity).ceil() as u64
    }
}

/// Refill `state` up to `now_ms`. A clock that moved backward adds nothing and
/// leaves the refill timestamp where it was.
pub fn refill(state: BucketState, params: BucketParams, now_ms: u64) -> BucketState {
    let elapsed_ms = now_ms.saturating_sub(state.last_refill_ms) as f64;
    let tokens = state.tokens + elapsed_ms * params.capacity / params.interval_ms;
    BucketState {
        tokens: tokens.clamp(0.0, params.capacity),
        last_refill_ms: state.last_refill_ms.max(now_ms),
    }
}

/// The pure transition: refill, then take `cost` tokens if they are there.
pub fn consume(
    current: Option<CounterState>,
    params: BucketParams,
    cost: u64,
    now_ms: u64,
) -> Update {
    let state = current
        .and_then(|state| state.as_bucket().copied())
        .unwrap_or_else(|| BucketState::full(params.capacity, now_ms));
    let mut state = refill(state, params, now_ms);
    let cost = cost as f64;

    let outcome = if state.tokens >= cost {
        state.tokens -= cost;
        AdmissionOutcome {
            allowed: true,
            remaining: state.tokens.floor() as u64,
            reset_after_ms: params.millis_for(params.capacity - state.tokens),
        }
    } else {
        AdmissionOutcome {
            allowed: false,
            remaining: 0,
            reset_after_ms: params.millis_for(cost - state.tokens).max(1),
        }
    };

    Update {
        state: CounterState::Bucket(state),
        outcome,
    }
}

/// Consume `cost` tokens from the bucket at `key` as one atomic store update.
pub async fn try_consume<S: CounterStore + ?Sized>(
    store: &S,
    key: &CounterKey,
    rule: &LimitRule,
    cost: u64,
    now_ms: u64,
) -> Result<AdmissionOutcome> {
    let params = BucketParams::from_rule(rule);
    let transition = move |current: Option<CounterState>| consume(current, params, cost, now_ms);
    let update = store
        .atomic_update(key, rule.interval.duration(), &transition)
        .await?;

    trace!(
        key = %key,
        allowed = update.outcome.allowed,
        remaining = update.outcome.remaining,
        "Token bucket evaluated"
    );
    Ok(update.outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::counter::TimeWindow;
    use crate::ratelimit::rules::{Algorithm, RuleScope};
    use crate::ratelimit::{Clock, ManualClock, Subject, Tier};
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use std::time::Duration;

    const START_MS: u64 = 1_700_000_000_000;

    fn rule(rate: u64, interval: TimeWindow) -> LimitRule {
        LimitRule {
            id: "tier:anonymous".to_string(),
            scope: RuleScope::Tier(Tier::Anonymous),
            rate,
            interval,
            algorithm: Algorithm::TokenBucket,
            sub_windows: 1,
        }
    }

    fn key() -> CounterKey {
        CounterKey::new("tier:anonymous", Subject::Origin("10.0.0.1".to_string()))
    }

    #[test]
    fn test_first_observation_starts_full() {
        let params = BucketParams::from_rule(&rule(10, TimeWindow::Minute));
        let update = consume(None, params, 1, START_MS);
        assert!(update.outcome.allowed);
        assert_eq!(update.outcome.remaining, 9);
        assert_eq!(update.outcome.reset_after_ms, 6_000);
    }

    #[test]
    fn test_refill_is_capped_at_capacity() {
        let params = BucketParams::from_rule(&rule(10, TimeWindow::Second));
        let state = BucketState {
            tokens: 4.0,
            last_refill_ms: START_MS,
        };
        let refilled = refill(state, params, START_MS + 10_000);
        assert_eq!(refilled.tokens, 10.0);
        assert_eq!(refilled.last_refill_ms, START_MS + 10_000);
    }

    #[test]
    fn test_backward_clock_adds_nothing() {
        let params = BucketParams::from_rule(&rule(10, TimeWindow::Second));
        let state = BucketState {
            tokens: 2.5,
            last_refill_ms: START_MS,
        };
        let refilled = refill(state, params, START_MS - 5_000);
        assert_eq!(refilled.tokens, 2.5);
        assert_eq!(refilled.last_refill_ms, START_MS);
    }

    #[test]
    fn test_tokens_shrink_to_reduced_capacity() {
        let params = BucketParams::from_rule(&rule(3, TimeWindow::Second));
        let current = CounterState::Bucket(BucketState {
            tokens: 50.0,
            last_refill_ms: START_MS,
        });
        let update = consume(Some(current), params, 1, START_MS);
        assert_eq!(update.state.as_bucket().unwrap().tokens, 2.0);
    }

    #[test]
    fn test_cost_above_capacity_is_rejected() {
        let params = BucketParams::from_rule(&rule(5, TimeWindow::Second));
        let update = consume(None, params, 6, START_MS);
        assert!(!update.outcome.allowed);
        assert_eq!(update.outcome.remaining, 0);
        assert_eq!(update.state.as_bucket().unwrap().tokens, 5.0);
    }

    #[tokio::test]
    async fn test_ten_per_minute_rejects_eleventh_with_six_second_reset() {
        let clock = Arc::new(ManualClock::new(START_MS));
        let store = MemoryStore::new(clock.clone());
        let rule = rule(10, TimeWindow::Minute);
        let key = key();

        for i in 0..10 {
            let outcome = try_consume(&store, &key, &rule, 1, clock.now_millis())
                .await
                .unwrap();
            assert!(outcome.allowed, "request {} should be allowed", i + 1);
            assert_eq!(outcome.remaining, 9 - i);
        }

        let outcome = try_consume(&store, &key, &rule, 1, clock.now_millis())
            .await
            .unwrap();
        assert!(!outcome.allowed);
        assert_eq!(outcome.remaining, 0);
        assert_eq!(outcome.reset_after_ms, 6_000);

        clock.advance(Duration::from_secs(6));
        let outcome = try_consume(&store, &key, &rule, 1, clock.now_millis())
            .await
            .unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.remaining, 0);
    }

    #[tokio::test]
    async fn test_tokens_stay_within_bounds() {
        let clock = Arc::new(ManualClock::new(START_MS));
        let store = MemoryStore::new(clock.clone());
        let rule = rule(4, TimeWindow::Second);
        let key = key();

        let steps = [0u64, 0, 0, 100, 0, 0, 3_000, 0, 250, 0, 0, 0, 0, 10, 999];
        for (i, step) in steps.iter().enumerate() {
            clock.advance(Duration::from_millis(*step));
            let cost = (i % 3) as u64 + 1;
            try_consume(&store, &key, &rule, cost, clock.now_millis())
                .await
                .unwrap();
            let tokens = store.get(&key).unwrap().as_bucket().unwrap().tokens;
            assert!((0.0..=4.0).contains(&tokens), "tokens {tokens} out of range");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_consumers_never_double_spend() {
        let clock = Arc::new(ManualClock::new(START_MS));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let rule = Arc::new(rule(25, TimeWindow::Hour));
        let key = key();
        let now = clock.now_millis();

        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let store = store.clone();
                let rule = rule.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    try_consume(store.as_ref(), &key, &rule, 1, now).await
                })
            })
            .collect();

        let mut allowed = 0;
        for result in futures::future::join_all(tasks).await {
            if result.unwrap().unwrap().allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 25);
    }
}
