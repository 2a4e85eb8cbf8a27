//! Gatekeeper - Embeddable Rate Limiting Engine
//!
//! This crate decides, per request, whether to admit or reject it under every
//! limit rule that applies (tier defaults, endpoint overrides, an origin cap).
//! Counter state lives either in process memory or in Redis, shared by every
//! instance, and all updates to one counter are serialized.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
