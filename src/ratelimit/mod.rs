//! Rate limiting logic and state management.

pub mod catalog;
mod clock;
mod composer;
mod context;
mod counter;
mod fallback;
mod key;
mod limiter;
pub mod rules;
pub mod sliding_window;
pub mod token_bucket;

pub use catalog::{CatalogSnapshot, LimitCatalog};
pub use clock::{Clock, ManualClock, SystemClock};
pub use composer::{compose, Decision, DecisionReason};
pub use context::{RequestContext, Subject, Tier};
pub use counter::{AdmissionOutcome, BucketState, CounterState, TimeWindow, WindowState};
pub use fallback::{FallbackMode, FallbackPolicy, FallbackState};
pub use key::CounterKey;
pub use limiter::{LimiterStats, RateLimiter};
pub use rules::{Algorithm, LimitRule, RulesConfig};
