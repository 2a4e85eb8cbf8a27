//! Per-request input to the engine.

use serde::{Deserialize, Serialize};

use crate::error::{GatekeeperError, Result};

/// Client classification that selects the default limits.
///
/// Ordered from least to most privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Anonymous,
    Authenticated,
    Premium,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Anonymous, Tier::Authenticated, Tier::Premium];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Anonymous => "anonymous",
            Tier::Authenticated => "authenticated",
            Tier::Premium => "premium",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = GatekeeperError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "anonymous" => Ok(Tier::Anonymous),
            "authenticated" => Ok(Tier::Authenticated),
            "premium" => Ok(Tier::Premium),
            other => Err(GatekeeperError::Configuration(format!(
                "unknown tier '{other}'"
            ))),
        }
    }
}

/// Everything the engine needs to know about one inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Authenticated client id, if the caller resolved one.
    pub client_id: Option<String>,
    /// Address the request originated from.
    pub origin_address: String,
    /// Requested endpoint path.
    pub endpoint: String,
    /// Tier claimed by the caller's credential check.
    pub tier: Tier,
    /// Tokens this request consumes from every applicable rule.
    pub cost: u32,
}

/// The identity a counter is kept for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subject {
    Client(String),
    Origin(String),
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subject::Client(id) => write!(f, "client:{id}"),
            Subject::Origin(addr) => write!(f, "origin:{addr}"),
        }
    }
}

impl RequestContext {
    pub fn anonymous(origin_address: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            client_id: None,
            origin_address: origin_address.into(),
            endpoint: endpoint.into(),
            tier: Tier::Anonymous,
            cost: 1,
        }
    }

    pub fn authenticated(
        client_id: impl Into<String>,
        tier: Tier,
        origin_address: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            client_id: Some(client_id.into()),
            origin_address: origin_address.into(),
            endpoint: endpoint.into(),
            tier,
            cost: 1,
        }
    }

    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }

    fn client_id(&self) -> Option<&str> {
        self.client_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    fn origin(&self) -> Option<&str> {
        Some(self.origin_address.trim()).filter(|addr| !addr.is_empty())
    }

    /// Reject contexts with no usable identity at all.
    pub fn validate(&self) -> Result<()> {
        if self.client_id().is_none() && self.origin().is_none() {
            return Err(GatekeeperError::InvalidRequestContext(
                "no client id and no origin address".to_string(),
            ));
        }
        if self.cost == 0 {
            return Err(GatekeeperError::InvalidRequestContext(
                "request cost must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Tier the request is entitled to. Without a client id no credential
    /// was presented, so only the anonymous tier applies.
    pub fn effective_tier(&self) -> Tier {
        match self.client_id() {
            Some(_) => self.tier,
            None => Tier::Anonymous,
        }
    }

    /// Identity for client-scoped rules: the client id, or the origin address as fallback.
    pub fn client_subject(&self) -> Option<Subject> {
        match self.client_id() {
            Some(id) => Some(Subject::Client(id.to_string())),
            None => self.origin_subject(),
        }
    }

    /// Identity for origin-scoped rules.
    pub fn origin_subject(&self) -> Option<Subject> {
        self.origin().map(|addr| Subject::Origin(addr.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert!(Tier::Premium > Tier::Authenticated);
        assert!(Tier::Authenticated > Tier::Anonymous);
        assert_eq!("Premium".parse::<Tier>().unwrap(), Tier::Premium);
        assert!("gold".parse::<Tier>().is_err());
    }

    #[test]
    fn test_client_subject_falls_back_to_origin() {
        let ctx = RequestContext::anonymous("10.0.0.1", "/search");
        assert_eq!(
            ctx.client_subject(),
            Some(Subject::Origin("10.0.0.1".to_string()))
        );

        let ctx = RequestContext::authenticated("alice", Tier::Premium, "10.0.0.1", "/search");
        assert_eq!(ctx.client_subject(), Some(Subject::Client("alice".to_string())));
        assert_eq!(ctx.client_subject().unwrap().to_string(), "client:alice");
    }

    #[test]
    fn test_effective_tier_requires_client_id() {
        let mut ctx = RequestContext::anonymous("10.0.0.1", "/");
        ctx.tier = Tier::Premium;
        assert_eq!(ctx.effective_tier(), Tier::Anonymous);

        ctx.client_id = Some("   ".to_string());
        assert_eq!(ctx.effective_tier(), Tier::Anonymous);

        ctx.client_id = Some("bob".to_string());
        assert_eq!(ctx.effective_tier(), Tier::Premium);
    }

    #[test]
    fn test_validate() {
        let ctx = RequestContext::anonymous("", "/");
        assert!(matches!(
            ctx.validate(),
            Err(GatekeeperError::InvalidRequestContext(_))
        ));

        let ctx = RequestContext::authenticated("carol", Tier::Authenticated, "", "/");
        assert!(ctx.validate().is_ok());

        let ctx = RequestContext::anonymous("10.0.0.1", "/").with_cost(0);
        assert!(ctx.validate().is_err());
    }
}
