//! Counter key generation.

use super::context::{RequestContext, Subject};
use super::rules::{LimitRule, RuleScope};

/// A key that uniquely identifies one rule's counter for one subject.
///
/// Two requests with equal keys always address the same stored state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// The rule this counter belongs to
    pub rule_id: String,
    /// The identity being counted
    pub subject: Subject,
}

impl CounterKey {
    pub fn new(rule_id: &str, subject: Subject) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            subject,
        }
    }

    /// The key `rule` counts `ctx` under. Origin-scoped rules count the origin
    /// address; every other rule counts the client, falling back to the
    /// origin. `None` when the context lacks the identity the rule needs.
    pub fn for_rule(rule: &LimitRule, ctx: &RequestContext) -> Option<Self> {
        let subject = match rule.scope {
            RuleScope::Origin => ctx.origin_subject(),
            RuleScope::Endpoint(_) | RuleScope::Tier(_) => ctx.client_subject(),
        }?;
        Some(Self::new(&rule.id, subject))
    }

    /// Convert the key to its storage representation.
    ///
    /// Format: `{rule_id}|{subject}`. The rule id comes first so a key can be
    /// split on the first `|` even when the subject contains one.
    pub fn to_storage_key(&self) -> String {
        format!("{}|{}", self.rule_id, self.subject)
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_storage_key())
    }
}
