//! Weighted sliding window admission.
//!
//! A rule's interval is split into `sub_windows` epoch-aligned sub-windows,
//! each with its own counter. The trailing interval always spans the current
//! sub-window, the `sub_windows - 1` full ones before it, and part of the
//! oldest one. The oldest is weighted by the share of it still inside the
//! interval, so the estimate is
//! `sum(newer counts) + oldest_count * (1 - elapsed_fraction)`.
//! With one sub-window this is the two-counter estimate
//! `previous_count * (1 - elapsed_fraction) + current_count`.

use tracing::trace;

use super::counter::{AdmissionOutcome, CounterState, WindowState};
use super::key::CounterKey;
use super::rules::LimitRule;
use crate::error::Result;
use crate::store::{CounterStore, Update};

/// Tolerance for float noise when comparing the estimate against the limit.
const EPSILON: f64 = 1e-9;

/// Window parameters derived from a rule.
#[derive(Debug, Clone, Copy)]
pub struct WindowParams {
    pub rate: u64,
    pub sub_window_ms: u64,
    /// Sub-windows per interval, at least 1
    pub sub_windows: usize,
}

impl WindowParams {
    pub fn from_rule(rule: &LimitRule) -> Self {
        Self {
            rate: rule.rate,
            sub_window_ms: rule.sub_window_millis(),
            sub_windows: rule.sub_windows.max(1) as usize,
        }
    }

    fn align(&self, now_ms: u64) -> u64 {
        now_ms - now_ms % self.sub_window_ms
    }
}

/// Advance the window to `now_ms`. Boundaries only ever move forward.
pub fn rotate(state: WindowState, params: WindowParams, now_ms: u64) -> WindowState {
    let elapsed = now_ms.saturating_sub(state.current_window_start_ms);
    let passed = elapsed / params.sub_window_ms;
    let start = state.current_window_start_ms + passed * params.sub_window_ms;

    let mut previous_counts = if passed == 0 {
        state.previous_counts
    } else if passed > params.sub_windows as u64 {
        return WindowState::empty(start);
    } else {
        let mut shifted = vec![0; passed as usize - 1];
        shifted.push(state.current_count);
        shifted.extend(state.previous_counts);
        shifted
    };
    // A catalog reload may have lowered the sub-window count.
    previous_counts.truncate(params.sub_windows);
    while previous_counts.last() == Some(&0) {
        previous_counts.pop();
    }

    WindowState {
        previous_counts,
        current_count: if passed == 0 { state.current_count } else { 0 },
        current_window_start_ms: start,
    }
}

/// Fraction of the current sub-window that has elapsed, in `[0, 1]`.
fn elapsed_fraction(state: &WindowState, params: WindowParams, now_ms: u64) -> f64 {
    let into = now_ms.saturating_sub(state.current_window_start_ms) as f64;
    (into / params.sub_window_ms as f64).clamp(0.0, 1.0)
}

/// Split the counts, as they will stand `ahead` sub-windows from now with no
/// further hits, into the fully counted part and the decaying oldest count.
fn split(state: &WindowState, params: WindowParams, ahead: usize) -> (f64, f64) {
    let mut full = 0.0;
    let mut oldest = 0.0;
    for (age, count) in state.counts_by_age().enumerate() {
        let age = age + ahead;
        if age < params.sub_windows {
            full += count as f64;
        } else if age == params.sub_windows {
            oldest = count as f64;
        }
    }
    (full, oldest)
}

/// Weighted request estimate over the trailing interval.
pub fn weighted_count(state: &WindowState, params: WindowParams, now_ms: u64) -> f64 {
    let fraction = elapsed_fraction(state, params, now_ms);
    let (full, oldest) = split(state, params, 0);
    full + oldest * (1.0 - fraction)
}

/// Milliseconds until `estimate + cost <= rate` holds again, assuming no
/// further admissions.
fn reset_after(state: &WindowState, params: WindowParams, cost: u64, now_ms: u64) -> u64 {
    let sub = params.sub_window_ms as f64;
    let fraction = elapsed_fraction(state, params, now_ms);
    let budget = params.rate as f64 - cost as f64;

    // After `sub_windows + 1` rotations nothing recorded so far is counted.
    let mut wait = (params.sub_windows + 1) as f64 * sub - fraction * sub;
    for ahead in 0..=params.sub_windows {
        let (full, oldest) = split(state, params, ahead);
        if full > budget + EPSILON {
            continue;
        }
        let needed = if oldest > 0.0 {
            (1.0 - (budget - full) / oldest).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let at = if ahead == 0 { needed.max(fraction) } else { needed };
        wait = ahead as f64 * sub + (at - fraction) * sub;
        break;
    }

    ((wait - EPSILON).ceil() as u64).max(1)
}

/// The pure transition: rotate, estimate, and record `cost` hits if they fit.
pub fn consume(
    current: Option<CounterState>,
    params: WindowParams,
    cost: u64,
    now_ms: u64,
) -> Update {
    let state = match current {
        Some(CounterState::Window(state)) => state,
        _ => WindowState::empty(params.align(now_ms)),
    };
    let mut state = rotate(state, params, now_ms);
    let estimate = weighted_count(&state, params, now_ms);

    let outcome = if estimate + cost as f64 <= params.rate as f64 + EPSILON {
        state.current_count += cost;
        let left = (params.rate as f64 - estimate - cost as f64).max(0.0);
        AdmissionOutcome {
            allowed: true,
            remaining: (left + EPSILON).floor() as u64,
            reset_after_ms: params
                .sub_window_ms
                .saturating_sub(now_ms.saturating_sub(state.current_window_start_ms)),
        }
    } else {
        AdmissionOutcome {
            allowed: false,
            remaining: 0,
            reset_after_ms: reset_after(&state, params, cost, now_ms),
        }
    };

    Update {
        state: CounterState::Window(state),
        outcome,
    }
}

/// Record `cost` hits in the window at `key` as one atomic store update.
pub async fn try_consume<S: CounterStore + ?Sized>(
    store: &S,
    key: &CounterKey,
    rule: &LimitRule,
    cost: u64,
    now_ms: u64,
) -> Result<AdmissionOutcome> {
    let params = WindowParams::from_rule(rule);
    let transition = move |current: Option<CounterState>| consume(current, params, cost, now_ms);
    let update = store
        .atomic_update(key, rule.interval.duration(), &transition)
        .await?;

    trace!(
        key = %key,
        allowed = update.outcome.allowed,
        remaining = update.outcome.remaining,
        "Sliding window evaluated"
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

    // A multiple of every sub-window length used below.
    const START_MS: u64 = 1_700_000_000_000;

    fn params(rate: u64, sub_window_ms: u64, sub_windows: usize) -> WindowParams {
        WindowParams {
            rate,
            sub_window_ms,
            sub_windows,
        }
    }

    fn window(previous_counts: Vec<u64>, current_count: u64, start_ms: u64) -> WindowState {
        WindowState {
            previous_counts,
            current_count,
            current_window_start_ms: start_ms,
        }
    }

    fn rule(rate: u64, interval: TimeWindow, sub_windows: u32) -> LimitRule {
        LimitRule {
            id: "tier:anonymous".to_string(),
            scope: RuleScope::Tier(Tier::Anonymous),
            rate,
            interval,
            algorithm: Algorithm::SlidingWindow,
            sub_windows,
        }
    }

    fn key() -> CounterKey {
        CounterKey::new("tier:anonymous", Subject::Origin("10.0.0.1".to_string()))
    }

    /// Run one transition against `state` and keep the result.
    fn step(state: &mut Option<CounterState>, p: WindowParams, now_ms: u64) -> AdmissionOutcome {
        let update = consume(state.take(), p, 1, now_ms);
        *state = Some(update.state);
        update.outcome
    }

    #[test]
    fn test_rotate_one_and_many() {
        let p = params(5, 1_000, 1);
        let state = window(vec![7], 3, 10_000);

        assert_eq!(rotate(state.clone(), p, 10_999), state);

        let once = rotate(state.clone(), p, 11_200);
        assert_eq!(once, window(vec![3], 0, 11_000));

        let many = rotate(state, p, 15_500);
        assert_eq!(many, window(vec![], 0, 15_000));
    }

    #[test]
    fn test_rotate_shifts_every_sub_window() {
        let p = params(5, 1_000, 3);
        let state = window(vec![7], 3, 10_000);

        assert_eq!(rotate(state.clone(), p, 12_500), window(vec![0, 3, 7], 0, 12_000));
        // The 7 has aged out of the interval.
        assert_eq!(rotate(state.clone(), p, 13_000), window(vec![0, 0, 3], 0, 13_000));
        assert_eq!(rotate(state, p, 14_000), window(vec![], 0, 14_000));
    }

    #[test]
    fn test_backward_clock_does_not_move_window() {
        let p = params(5, 1_000, 1);
        let state = window(vec![4], 1, 10_000);
        let rotated = rotate(state.clone(), p, 9_000);
        assert_eq!(rotated, state);
        // Treated as the very start of the sub-window.
        assert_eq!(weighted_count(&state, p, 9_000), 5.0);
    }

    #[test]
    fn test_weighted_count_decays_previous() {
        let p = params(10, 1_000, 1);
        let state = window(vec![8], 2, 0);
        assert_eq!(weighted_count(&state, p, 0), 10.0);
        assert_eq!(weighted_count(&state, p, 250), 8.0);
        assert_eq!(weighted_count(&state, p, 500), 6.0);
    }

    #[test]
    fn test_weighted_count_only_decays_oldest_sub_window() {
        let p = params(20, 1_000, 3);
        let state = window(vec![1, 2, 8], 4, 0);
        assert_eq!(weighted_count(&state, p, 0), 15.0);
        assert_eq!(weighted_count(&state, p, 500), 11.0);
    }

    #[test]
    fn test_first_observation_aligns_to_sub_window() {
        let update = consume(None, params(5, 10_000, 1), 1, START_MS + 3_500);
        let state = update.state.as_window().cloned().unwrap();
        assert_eq!(state.current_window_start_ms, START_MS);
        assert_eq!(state.current_count, 1);
        assert_eq!(update.outcome.remaining, 4);
        assert_eq!(update.outcome.reset_after_ms, 6_500);
    }

    #[test]
    fn test_reset_after_waits_for_previous_decay() {
        let p = params(10, 1_000, 1);
        let state = window(vec![10], 5, 0);
        // budget 9; needs 10 * (1 - f) <= 4 -> f >= 0.6; at f = 0.5 that is 100ms away
        let update = consume(Some(CounterState::Window(state)), p, 1, 500);
        assert!(!update.outcome.allowed);
        assert_eq!(update.outcome.reset_after_ms, 100);
    }

    #[test]
    fn test_five_per_ten_seconds() {
        // A ten-second interval kept as two adjacent counters.
        let p = params(5, 10_000, 1);
        let mut state = None;

        for i in 0..5u64 {
            let outcome = step(&mut state, p, START_MS + 150 * (i + 1));
            assert!(outcome.allowed, "request {} should be allowed", i + 1);
            assert_eq!(outcome.remaining, 4 - i);
        }

        // A sixth in the same second is not.
        let rejected = step(&mut state, p, START_MS + 900);
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
        // 9.1s for the burst to become the previous counter, then 2s for
        // 5 * (1 - f) to fall to 4.
        assert_eq!(rejected.reset_after_ms, 11_100);

        assert!(!step(&mut state, p, START_MS + 11_999).allowed);
        assert!(step(&mut state, p, START_MS + 12_000).allowed);

        // Once the burst has rotated out of both counters the window is empty.
        let mut state = None;
        for i in 0..5u64 {
            assert!(step(&mut state, p, START_MS + 150 * (i + 1)).allowed);
        }
        for _ in 0..5 {
            assert!(step(&mut state, p, START_MS + 20_000).allowed);
        }
    }

    #[tokio::test]
    async fn test_rate_holds_over_the_whole_interval() {
        for sub_windows in [1, 2, 6, 60] {
            let clock = Arc::new(ManualClock::new(START_MS));
            let store = MemoryStore::new(clock.clone());
            let rule = rule(5, TimeWindow::Minute, sub_windows);
            let key = key();

            // One attempt every 100ms for a full minute.
            let mut admitted = 0;
            for _ in 0..600 {
                if try_consume(&store, &key, &rule, 1, clock.now_millis())
                    .await
                    .unwrap()
                    .allowed
                {
                    admitted += 1;
                }
                clock.advance(Duration::from_millis(100));
            }
            assert_eq!(admitted, 5, "sub_windows = {sub_windows}");
        }
    }

    #[tokio::test]
    async fn test_rejection_reset_is_accurate() {
        let clock = Arc::new(ManualClock::new(START_MS));
        let store = MemoryStore::new(clock.clone());
        // Ten-second sub-windows.
        let rule = rule(5, TimeWindow::Minute, 6);
        assert_eq!(rule.sub_window_millis(), 10_000);
        let key = key();

        for _ in 0..5 {
            assert!(try_consume(&store, &key, &rule, 1, clock.now_millis())
                .await
                .unwrap()
                .allowed);
        }
        let rejected = try_consume(&store, &key, &rule, 1, clock.now_millis())
            .await
            .unwrap();
        assert!(!rejected.allowed);
        // The burst counts in full for a minute, then 2s of decay in the
        // oldest sub-window brings 5 * (1 - f) down to 4.
        assert_eq!(rejected.reset_after_ms, 62_000);

        clock.advance(Duration::from_secs(30));
        let rejected = try_consume(&store, &key, &rule, 1, clock.now_millis())
            .await
            .unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.reset_after_ms, 32_000);

        clock.set(START_MS + 61_999);
        assert!(!try_consume(&store, &key, &rule, 1, clock.now_millis())
            .await
            .unwrap()
            .allowed);

        clock.set(START_MS + 62_000);
        assert!(try_consume(&store, &key, &rule, 1, clock.now_millis())
            .await
            .unwrap()
            .allowed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_consumers_never_overshoot() {
        let clock = Arc::new(ManualClock::new(START_MS));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let rule = Arc::new(rule(30, TimeWindow::Hour, 1));
        let key = key();
        let now = clock.now_millis();

        let tasks: Vec<_> = (0..120)
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
        assert_eq!(allowed, 30);
        let state = store.get(&key).unwrap();
        assert_eq!(state.as_window().unwrap().current_count, 30);
    }
}
