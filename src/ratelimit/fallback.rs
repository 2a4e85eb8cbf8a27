//! Behaviour while the counter store is unreachable.
//!
//! The policy is a two state machine. In `Normal` every request goes to the
//! store. The first `StoreUnavailable` flips it to `Degraded`, where requests
//! get the configured verdict without touching the store. Once per probe
//! interval a single caller is allowed to ping the store; a successful ping
//! returns the policy to `Normal`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::FallbackConfig;

/// Verdict applied to every request while degraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    /// Admit everything
    #[default]
    FailOpen,
    /// Reject everything
    FailClosed,
}

impl FallbackMode {
    pub fn allows(&self) -> bool {
        matches!(self, FallbackMode::FailOpen)
    }
}

/// Observable policy state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackState {
    Normal,
    Degraded,
}

#[derive(Debug)]
pub struct FallbackPolicy {
    mode: FallbackMode,
    probe_interval_ms: u64,
    degraded: AtomicBool,
    next_probe_ms: AtomicU64,
}

impl FallbackPolicy {
    pub fn new(mode: FallbackMode, probe_interval: Duration) -> Self {
        Self {
            mode,
            probe_interval_ms: probe_interval.as_millis() as u64,
            degraded: AtomicBool::new(false),
            next_probe_ms: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &FallbackConfig) -> Self {
        Self::new(config.mode, config.probe_interval())
    }

    pub fn mode(&self) -> FallbackMode {
        self.mode
    }

    pub fn state(&self) -> FallbackState {
        if self.degraded.load(Ordering::Acquire) {
            FallbackState::Degraded
        } else {
            FallbackState::Normal
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.state() == FallbackState::Degraded
    }

    /// Record a store failure observed at `now_ms`.
    pub fn mark_unavailable(&self, now_ms: u64, reason: &str) {
        if self.degraded.load(Ordering::Acquire) {
            return;
        }
        self.next_probe_ms
            .store(now_ms.saturating_add(self.probe_interval_ms), Ordering::Release);
        if self
            .degraded
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            warn!(
                mode = ?self.mode,
                probe_interval_ms = self.probe_interval_ms,
                reason,
                "Counter store unavailable, applying fallback verdict"
            );
        }
    }

    /// Record a successful probe.
    pub fn mark_recovered(&self) {
        if self
            .degraded
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            info!("Counter store reachable again, resuming normal evaluation");
        }
    }

    /// Claim the probe slot if it is due. At most one caller per interval
    /// gets `true`; the slot is rescheduled as it is claimed.
    pub fn try_acquire_probe(&self, now_ms: u64) -> bool {
        let due = self.next_probe_ms.load(Ordering::Acquire);
        if now_ms < due {
            return false;
        }
        self.next_probe_ms
            .compare_exchange(
                due,
                now_ms.saturating_add(self.probe_interval_ms),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self::from_config(&FallbackConfig::default())
    }
}
