//! Time windows and the per-key counter state kept in the counter store.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Interval over which a rule's `rate` applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
}

impl TimeWindow {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Second => Duration::from_secs(1),
            TimeWindow::Minute => Duration::from_secs(60),
            TimeWindow::Hour => Duration::from_secs(3600),
            TimeWindow::Day => Duration::from_secs(86400),
        }
    }

    /// Length of the window in milliseconds.
    pub fn as_millis(&self) -> u64 {
        self.duration().as_millis() as u64
    }
}

impl std::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TimeWindow::Second => "second",
            TimeWindow::Minute => "minute",
            TimeWindow::Hour => "hour",
            TimeWindow::Day => "day",
        };
        f.write_str(name)
    }
}

/// Token bucket state for one counter key.
///
/// `tokens` is kept within `[0, capacity]` by every transition in
/// [`token_bucket`](super::token_bucket).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Tokens currently available.
    pub tokens: f64,
    /// Epoch milliseconds of the last refill. Never moves backward.
    pub last_refill_ms: u64,
}

impl BucketState {
    /// A full bucket observed for the first time at `now_ms`.
    pub fn full(capacity: f64, now_ms: u64) -> Self {
        Self {
            tokens: capacity,
            last_refill_ms: now_ms,
        }
    }
}

/// Sliding window state for one counter key.
///
/// The current sub-window counter plus the counters of the sub-windows before
/// it. With one sub-window per interval this is the classic pair of adjacent
/// counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowState {
    /// Hits recorded in earlier sub-windows, newest first. Never longer than
    /// the rule's sub-window count; trailing empty sub-windows are dropped.
    #[serde(default)]
    pub previous_counts: Vec<u64>,
    /// Hits recorded in the current sub-window.
    pub current_count: u64,
    /// Epoch milliseconds at which the current sub-window started.
    pub current_window_start_ms: u64,
}

impl WindowState {
    /// An empty window whose current sub-window starts at `start_ms`.
    pub fn empty(start_ms: u64) -> Self {
        Self {
            previous_counts: Vec::new(),
            current_count: 0,
            current_window_start_ms: start_ms,
        }
    }

    /// Counts by age in sub-windows: the current one first, then older ones.
    pub fn counts_by_age(&self) -> impl Iterator<Item = u64> + '_ {
        std::iter::once(self.current_count).chain(self.previous_counts.iter().copied())
    }
}

/// State stored under a counter key. Tagged so a remote store can hold
/// either algorithm's state in the same keyspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CounterState {
    Bucket(BucketState),
    Window(WindowState),
}

impl CounterState {
    pub fn as_bucket(&self) -> Option<&BucketState> {
        match self {
            CounterState::Bucket(state) => Some(state),
            CounterState::Window(_) => None,
        }
    }

    pub fn as_window(&self) -> Option<&WindowState> {
        match self {
            CounterState::Window(state) => Some(state),
            CounterState::Bucket(_) => None,
        }
    }
}

/// What one rule's admission check decided for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionOutcome {
    pub allowed: bool,
    pub remaining: u64,
    /// Milliseconds until quota partially or fully replenishes.
    pub reset_after_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_window_duration() {
        assert_eq!(TimeWindow::Second.duration(), Duration::from_secs(1));
        assert_eq!(TimeWindow::Minute.duration(), Duration::from_secs(60));
        assert_eq!(TimeWindow::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(TimeWindow::Day.duration(), Duration::from_secs(86400));
        assert_eq!(TimeWindow::Minute.as_millis(), 60_000);
    }

    #[test]
    fn test_time_window_parses_lowercase() {
        let window: TimeWindow = serde_yaml::from_str("hour").unwrap();
        assert_eq!(window, TimeWindow::Hour);
        assert!(serde_yaml::from_str::<TimeWindow>("fortnight").is_err());
    }

    #[test]
    fn test_counter_state_is_tagged() {
        let state = CounterState::Window(WindowState {
            previous_counts: vec![3, 0, 2],
            current_count: 1,
            current_window_start_ms: 10_000,
        });
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"kind\":\"window\""));

        let decoded: CounterState = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, state);
        assert!(decoded.as_bucket().is_none());
        let window = decoded.as_window().unwrap();
        assert_eq!(window.counts_by_age().collect::<Vec<_>>(), vec![1, 3, 0, 2]);
    }
}
