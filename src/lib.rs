//! Slidegate
//!
//! A distributed sliding-window rate limiter. Nodes share request logs in Redis
//! sorted sets, fall back to process-local counters when Redis is unreachable,
//! and announce themselves to peers through expiring heartbeat records.

pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod limiter;
pub mod liveness;
pub mod metrics;
pub mod redis;
pub mod ring;
pub mod service;
pub mod store;
pub mod utils;

// Re-export main types
pub use cache::LocalFallbackCache;
pub use config::Settings;
pub use error::{RateLimitError, Result};
pub use limiter::{CheckOptions, Decision, RateLimitEngine, StatusReport};
pub use ring::HashRing;
pub use service::RateLimitService;
