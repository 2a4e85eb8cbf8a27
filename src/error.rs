//! Error types for the Gatekeeper engine.

use thiserror::Error;

/// Main error type for Gatekeeper operations.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Invalid or incomplete rule/service configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The counter store could not be reached within its bounded timeout.
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// A counter kept changing under every commit attempt. The store is
    /// reachable; only the request that hit the counter is affected.
    #[error("Counter store contention: {0}")]
    StoreContention(String),

    /// The caller supplied neither a client identity nor an origin address.
    #[error("Invalid request context: {0}")]
    InvalidRequestContext(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatekeeperError {
    /// Whether this error is the transient store failure handled by the fallback policy.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, GatekeeperError::StoreUnavailable(_))
    }

    pub fn is_store_contention(&self) -> bool {
        matches!(self, GatekeeperError::StoreContention(_))
    }
}

impl From<redis::RedisError> for GatekeeperError {
    fn from(err: redis::RedisError) -> Self {
        GatekeeperError::StoreUnavailable(err.to_string())
    }
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
