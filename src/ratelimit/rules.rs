//! Rate limit rules configuration and matching.
//!
//! This module handles loading limit rules from YAML and turning them into
//! the immutable [`LimitRule`] set held by the catalog. A rule file looks like:
//!
//! ```yaml
//! algorithm: token_bucket
//! tiers:
//!   anonymous: { rate: 60, interval: minute }
//!   authenticated: { rate: 600, interval: minute }
//!   premium: { rate: 6000, interval: minute }
//! endpoints:
//!   - endpoint: /api/search
//!     rate: 5
//!     interval: minute
//!   - endpoint: /api/export/*
//!     rate: 10
//!     interval: hour
//!     algorithm: sliding_window
//! origin_cap:
//!   rate: 1000
//!   interval: minute
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

use super::context::Tier;
use super::counter::TimeWindow;
use crate::error::{GatekeeperError, Result};

/// Rule id used for the per-origin cap.
pub const ORIGIN_CAP_RULE_ID: &str = "origin_cap";

/// Admission algorithm applied by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    TokenBucket,
    SlidingWindow,
}

/// A complete rule file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Algorithm for rules that do not name one
    #[serde(default)]
    pub algorithm: Algorithm,
    /// Sliding window tuning
    #[serde(default)]
    pub sliding_window: SlidingWindowConfig,
    /// Default limit per client tier
    #[serde(default)]
    pub tiers: TierDefaults,
    /// Per-endpoint overrides
    #[serde(default)]
    pub endpoints: Vec<EndpointOverride>,
    /// Cap applied per origin address regardless of client identity
    #[serde(default)]
    pub origin_cap: Option<LimitSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlidingWindowConfig {
    /// Number of sub-windows each interval is divided into
    #[serde(default = "default_sub_windows")]
    pub sub_windows: u32,
}

impl Default for SlidingWindowConfig {
    fn default() -> Self {
        Self {
            sub_windows: default_sub_windows(),
        }
    }
}

fn default_sub_windows() -> u32 {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierDefaults {
    #[serde(default)]
    pub anonymous: Option<LimitSettings>,
    #[serde(default)]
    pub authenticated: Option<LimitSettings>,
    #[serde(default)]
    pub premium: Option<LimitSettings>,
}

impl TierDefaults {
    pub fn get(&self, tier: Tier) -> Option<&LimitSettings> {
        match tier {
            Tier::Anonymous => self.anonymous.as_ref(),
            Tier::Authenticated => self.authenticated.as_ref(),
            Tier::Premium => self.premium.as_ref(),
        }
    }
}

/// The limit itself: `rate` tokens per `interval`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    pub rate: u64,
    pub interval: TimeWindow,
    /// Overrides the file-level algorithm
    #[serde(default)]
    pub algorithm: Option<Algorithm>,
    /// Disabled rules are dropped at load time
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// A limit bound to an endpoint path. A trailing `*` makes it a prefix match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointOverride {
    /// Explicit rule id; defaults to `endpoint:{endpoint}`
    #[serde(default)]
    pub id: Option<String>,
    pub endpoint: String,
    #[serde(flatten)]
    pub limit: LimitSettings,
}

/// How an endpoint override matches request paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointPattern {
    Exact(String),
    Prefix(String),
}

impl EndpointPattern {
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix('*') {
            Some(prefix) => EndpointPattern::Prefix(prefix.to_string()),
            None => EndpointPattern::Exact(pattern.to_string()),
        }
    }

    pub fn matches(&self, endpoint: &str) -> bool {
        match self {
            EndpointPattern::Exact(path) => path == endpoint,
            EndpointPattern::Prefix(prefix) => endpoint.starts_with(prefix.as_str()),
        }
    }
}

/// What a rule applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleScope {
    Endpoint(EndpointPattern),
    Origin,
    Tier(Tier),
}

/// Ordering key for rules; higher values are evaluated and reported first.
///
/// Exact endpoint overrides beat prefix overrides, longer prefixes beat
/// shorter ones, and any override beats the origin cap and tier defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RulePriority {
    class: u8,
    specificity: usize,
}

/// A single immutable limit rule.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitRule {
    pub id: String,
    pub scope: RuleScope,
    /// Tokens per interval; also the bucket capacity
    pub rate: u64,
    pub interval: TimeWindow,
    pub algorithm: Algorithm,
    /// Sliding window sub-window count (ignored by the token bucket)
    pub sub_windows: u32,
}

impl LimitRule {
    pub fn priority(&self) -> RulePriority {
        match &self.scope {
            RuleScope::Endpoint(EndpointPattern::Exact(path)) => RulePriority {
                class: 3,
                specificity: path.len(),
            },
            RuleScope::Endpoint(EndpointPattern::Prefix(prefix)) => RulePriority {
                class: 2,
                specificity: prefix.len(),
            },
            RuleScope::Origin => RulePriority {
                class: 1,
                specificity: 0,
            },
            RuleScope::Tier(tier) => RulePriority {
                class: 0,
                specificity: *tier as usize,
            },
        }
    }

    /// Length of one sliding window sub-window in milliseconds.
    pub fn sub_window_millis(&self) -> u64 {
        (self.interval.as_millis() / u64::from(self.sub_windows.max(1))).max(1)
    }

    fn from_settings(
        id: String,
        scope: RuleScope,
        settings: &LimitSettings,
        defaults: &RulesConfig,
    ) -> Result<Self> {
        if settings.rate == 0 {
            return Err(GatekeeperError::Configuration(format!(
                "rule '{id}' must have a positive rate"
            )));
        }
        Ok(Self {
            id,
            scope,
            rate: settings.rate,
            interval: settings.interval,
            algorithm: settings.algorithm.unwrap_or(defaults.algorithm),
            sub_windows: defaults.sliding_window.sub_windows,
        })
    }
}

impl RulesConfig {
    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            GatekeeperError::Configuration(format!("Failed to parse rate limit rules: {e}"))
        })
    }

    /// Validate the file and build the enabled rules.
    pub fn build_rules(&self) -> Result<Vec<LimitRule>> {
        if self.sliding_window.sub_windows == 0 {
            return Err(GatekeeperError::Configuration(
                "sliding_window.sub_windows must be at least 1".to_string(),
            ));
        }
        match &self.tiers.anonymous {
            Some(settings) if settings.enabled => {}
            _ => {
                return Err(GatekeeperError::Configuration(
                    "no default rule for the anonymous tier; unclassified clients would be unlimited"
                        .to_string(),
                ))
            }
        }

        let mut rules = Vec::new();

        for endpoint in &self.endpoints {
            if endpoint.endpoint.is_empty() {
                return Err(GatekeeperError::Configuration(
                    "endpoint override with an empty endpoint".to_string(),
                ));
            }
            if !endpoint.limit.enabled {
                continue;
            }
            let id = endpoint
                .id
                .clone()
                .unwrap_or_else(|| format!("endpoint:{}", endpoint.endpoint));
            let scope = RuleScope::Endpoint(EndpointPattern::parse(&endpoint.endpoint));
            rules.push(LimitRule::from_settings(id, scope, &endpoint.limit, self)?);
        }

        if let Some(settings) = self.origin_cap.as_ref().filter(|settings| settings.enabled) {
            rules.push(LimitRule::from_settings(
                ORIGIN_CAP_RULE_ID.to_string(),
                RuleScope::Origin,
                settings,
                self,
            )?);
        }

        for tier in Tier::ALL {
            if let Some(settings) = self.tiers.get(tier).filter(|settings| settings.enabled) {
                rules.push(LimitRule::from_settings(
                    format!("tier:{tier}"),
                    RuleScope::Tier(tier),
                    settings,
                    self,
                )?);
            }
        }

        let mut seen = HashSet::new();
        for rule in &rules {
            if !seen.insert(rule.id.as_str()) {
                return Err(GatekeeperError::Configuration(format!(
                    "duplicate rule id '{}'",
                    rule.id
                )));
            }
        }

        Ok(rules)
    }
}
