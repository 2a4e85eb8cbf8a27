//! Combining per-rule verdicts into one decision.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::context::RequestContext;
use super::counter::AdmissionOutcome;
use super::key::CounterKey;
use super::rules::{Algorithm, LimitRule};
use super::{sliding_window, token_bucket};
use crate::error::Result;
use crate::store::CounterStore;

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    Allowed,
    RateLimited,
    /// The counter store was unreachable and the fallback verdict applied
    StoreUnavailable,
    /// A counter was updated concurrently so often that this request could not
    /// be recorded; the store is healthy and the next attempt is evaluated
    /// normally
    StoreContention,
    /// The request costs more than an applicable rule's whole rate. Retrying
    /// cannot succeed
    CostExceedsLimit,
    /// The request had no usable identity
    InvalidRequestContext,
}

/// The outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u64,
    /// Until the reported rule's quota replenishes. Zero when the decision is
    /// not about quota, see [`DecisionReason`].
    pub reset_after: Duration,
    /// The rule that rejected the request, or the tightest rule when allowed
    pub limiting_rule_id: Option<String>,
    /// Numeric limit of `limiting_rule_id`
    pub limit: Option<u64>,
    pub reason: DecisionReason,
}

impl Decision {
    fn from_rule(rule: &LimitRule, outcome: AdmissionOutcome) -> Self {
        Self {
            allowed: outcome.allowed,
            remaining: outcome.remaining,
            reset_after: Duration::from_millis(outcome.reset_after_ms),
            limiting_rule_id: Some(rule.id.clone()),
            limit: Some(rule.rate),
            reason: if outcome.allowed {
                DecisionReason::Allowed
            } else {
                DecisionReason::RateLimited
            },
        }
    }

    /// The verdict applied while the store is unreachable.
    pub fn store_unavailable(allowed: bool) -> Self {
        Self {
            allowed,
            remaining: 0,
            reset_after: Duration::ZERO,
            limiting_rule_id: None,
            limit: None,
            reason: DecisionReason::StoreUnavailable,
        }
    }

    /// Rejection of a request whose counter could not be committed.
    pub fn store_contention() -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_after: Duration::ZERO,
            limiting_rule_id: None,
            limit: None,
            reason: DecisionReason::StoreContention,
        }
    }

    fn cost_exceeds_limit(rule: &LimitRule) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_after: Duration::ZERO,
            limiting_rule_id: Some(rule.id.clone()),
            limit: Some(rule.rate),
            reason: DecisionReason::CostExceedsLimit,
        }
    }

    pub fn invalid_request_context() -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_after: Duration::ZERO,
            limiting_rule_id: None,
            limit: None,
            reason: DecisionReason::InvalidRequestContext,
        }
    }

    /// `reset_after` in whole seconds, rounded up.
    pub fn reset_after_seconds(&self) -> u64 {
        let millis = self.reset_after.as_millis() as u64;
        millis.div_ceil(1000)
    }

    /// Seconds a rejected caller should wait before retrying; 0 when allowed.
    pub fn retry_after_seconds(&self) -> u64 {
        if self.allowed {
            0
        } else {
            self.reset_after_seconds().max(1)
        }
    }
}

/// Run one rule's algorithm for `ctx`, or `None` when the context lacks the
/// identity the rule counts.
async fn evaluate_rule<S: CounterStore + ?Sized>(
    store: &S,
    rule: &LimitRule,
    ctx: &RequestContext,
    now_ms: u64,
) -> Result<Option<AdmissionOutcome>> {
    let Some(key) = CounterKey::for_rule(rule, ctx) else {
        return Ok(None);
    };
    let cost = u64::from(ctx.cost);
    let outcome = match rule.algorithm {
        Algorithm::TokenBucket => token_bucket::try_consume(store, &key, rule, cost, now_ms).await?,
        Algorithm::SlidingWindow => {
            sliding_window::try_consume(store, &key, rule, cost, now_ms).await?
        }
    };
    Ok(Some(outcome))
}

/// Evaluate every rule and merge the verdicts.
///
/// All rules are consumed even after one rejects, and nothing is refunded.
/// A rejection reports the rejecting rule that takes longest to recover
/// (the first such rule on ties); an admission reports the rule with the
/// least remaining quota. Store errors abort the evaluation.
///
/// A request costing more than some applicable rule's rate is rejected with
/// [`DecisionReason::CostExceedsLimit`] before any counter is touched.
pub async fn compose<S: CounterStore + ?Sized>(
    store: &S,
    rules: &[Arc<LimitRule>],
    ctx: &RequestContext,
    now_ms: u64,
) -> Result<Decision> {
    let cost = u64::from(ctx.cost);
    if let Some(rule) = rules
        .iter()
        .find(|rule| cost > rule.rate && CounterKey::for_rule(rule, ctx).is_some())
    {
        debug!(rule = %rule.id, cost, limit = rule.rate, "Request cost exceeds rule rate");
        return Ok(Decision::cost_exceeds_limit(rule));
    }

    let mut rejecting: Option<(&LimitRule, AdmissionOutcome)> = None;
    let mut tightest: Option<(&LimitRule, AdmissionOutcome)> = None;

    for rule in rules.iter().map(Arc::as_ref) {
        let Some(outcome) = evaluate_rule(store, rule, ctx, now_ms).await? else {
            trace!(rule = %rule.id, "Rule has no subject for this request, skipping");
            continue;
        };

        if outcome.allowed {
            if tightest.map_or(true, |(_, best)| outcome.remaining < best.remaining) {
                tightest = Some((rule, outcome));
            }
        } else if rejecting.map_or(true, |(_, worst)| outcome.reset_after_ms > worst.reset_after_ms)
        {
            rejecting = Some((rule, outcome));
        }
    }

    let decision = match (rejecting, tightest) {
        (Some((rule, outcome)), _) => {
            debug!(
                rule = %rule.id,
                endpoint = %ctx.endpoint,
                reset_after_ms = outcome.reset_after_ms,
                "Rate limit exceeded"
            );
            Decision::from_rule(rule, outcome)
        }
        (None, Some((rule, outcome))) => Decision::from_rule(rule, outcome),
        // Unreachable with a validated catalog, which always resolves a tier rule.
        (None, None) => Decision {
            allowed: true,
            remaining: 0,
            reset_after: Duration::ZERO,
            limiting_rule_id: None,
            limit: None,
            reason: DecisionReason::Allowed,
        },
    };
    Ok(decision)
}
