//! The limit catalog: the loaded rule set and rule resolution.
//!
//! Rules live in an immutable [`CatalogSnapshot`]. Reloading builds a complete
//! new snapshot and swaps it in with a single pointer store, so a resolution in
//! flight keeps using the snapshot it started with.

use arc_swap::{ArcSwap, ArcSwapOption};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::context::{RequestContext, Tier};
use super::rules::{LimitRule, RuleScope, RulesConfig};
use crate::error::{GatekeeperError, Result};

/// One immutable generation of the rule set.
#[derive(Debug)]
pub struct CatalogSnapshot {
    version: u64,
    /// Endpoint overrides, most specific first
    endpoints: Vec<Arc<LimitRule>>,
    origin_cap: Option<Arc<LimitRule>>,
    /// Tier defaults, most privileged first
    tiers: Vec<Arc<LimitRule>>,
}

impl CatalogSnapshot {
    fn build(rules: Vec<LimitRule>, version: u64) -> Result<Self> {
        let mut endpoints = Vec::new();
        let mut origin_cap = None;
        let mut tiers = Vec::new();

        for rule in rules {
            match rule.scope {
                RuleScope::Endpoint(_) => endpoints.push(Arc::new(rule)),
                RuleScope::Origin => origin_cap = Some(Arc::new(rule)),
                RuleScope::Tier(_) => tiers.push(Arc::new(rule)),
            }
        }

        if !tiers
            .iter()
            .any(|rule| rule.scope == RuleScope::Tier(Tier::Anonymous))
        {
            return Err(GatekeeperError::Configuration(
                "no default rule for the anonymous tier".to_string(),
            ));
        }

        // Stable sorts: among equal priorities, file order wins.
        endpoints.sort_by(|a, b| b.priority().cmp(&a.priority()));
        tiers.sort_by(|a, b| b.priority().cmp(&a.priority()));

        Ok(Self {
            version,
            endpoints,
            origin_cap,
            tiers,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Every rule in evaluation order.
    pub fn rules(&self) -> impl Iterator<Item = &Arc<LimitRule>> {
        self.endpoints
            .iter()
            .chain(self.origin_cap.iter())
            .chain(self.tiers.iter())
    }

    pub fn len(&self) -> usize {
        self.rules().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The rules that apply to `ctx`, in priority order.
    ///
    /// All matching endpoint overrides come first, then the origin cap when
    /// the request carries an origin address, then the single tier default of
    /// the most privileged tier the request is entitled to. The result is
    /// never empty because the anonymous default always exists.
    pub fn resolve(&self, ctx: &RequestContext) -> Vec<Arc<LimitRule>> {
        let mut resolved: Vec<Arc<LimitRule>> = self
            .endpoints
            .iter()
            .filter(|rule| match &rule.scope {
                RuleScope::Endpoint(pattern) => pattern.matches(&ctx.endpoint),
                _ => false,
            })
            .cloned()
            .collect();

        if ctx.origin_subject().is_some() {
            resolved.extend(self.origin_cap.iter().cloned());
        }

        let entitled = ctx.effective_tier();
        let tier_rule = self.tiers.iter().find(|rule| match rule.scope {
            RuleScope::Tier(tier) => tier <= entitled,
            _ => false,
        });
        resolved.extend(tier_rule.cloned());

        resolved
    }
}

/// Holder of the current [`CatalogSnapshot`].
#[derive(Debug)]
pub struct LimitCatalog {
    current: ArcSwap<CatalogSnapshot>,
}

impl LimitCatalog {
    /// Build a catalog from already-validated rules.
    pub fn new(rules: Vec<LimitRule>) -> Result<Self> {
        let snapshot = CatalogSnapshot::build(rules, 1)?;
        info!(rules = snapshot.len(), "Limit catalog loaded");
        Ok(Self {
            current: ArcSwap::from_pointee(snapshot),
        })
    }

    pub fn from_config(config: &RulesConfig) -> Result<Self> {
        Self::new(config.build_rules()?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_config(&RulesConfig::from_file(path)?)
    }

    /// The current snapshot. Hold on to it to resolve several times against
    /// one consistent rule set.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.current.load_full()
    }

    pub fn resolve(&self, ctx: &RequestContext) -> Vec<Arc<LimitRule>> {
        self.current.load().resolve(ctx)
    }

    /// Validate `config` and atomically replace the rule set with it. On error
    /// the current rules stay in place.
    pub fn reload(&self, config: &RulesConfig) -> Result<()> {
        let rules = config.build_rules()?;
        let version = self.current.load().version + 1;
        let snapshot = CatalogSnapshot::build(rules, version)?;
        info!(version, rules = snapshot.len(), "Limit catalog reloaded");
        self.current.store(Arc::new(snapshot));
        Ok(())
    }
}

static GLOBAL: ArcSwapOption<LimitCatalog> = ArcSwapOption::const_empty();

/// Install `catalog` as the process-wide catalog, replacing any previous one.
pub fn init(catalog: LimitCatalog) -> Arc<LimitCatalog> {
    let catalog = Arc::new(catalog);
    GLOBAL.store(Some(catalog.clone()));
    debug!("Process-wide limit catalog installed");
    catalog
}

/// The process-wide catalog, if one is installed.
pub fn global() -> Option<Arc<LimitCatalog>> {
    GLOBAL.load_full()
}

/// Reload the process-wide catalog in place.
pub fn reload(config: &RulesConfig) -> Result<()> {
    match GLOBAL.load_full() {
        Some(catalog) => catalog.reload(config),
        None => Err(GatekeeperError::Configuration(
            "no process-wide limit catalog installed".to_string(),
        )),
    }
}

/// Remove the process-wide catalog. Holders of an `Arc` keep theirs.
pub fn teardown() {
    if GLOBAL.swap(None).is_some() {
        debug!("Process-wide limit catalog removed");
    }
}
