//! Fault tolerance helpers for the exchange client
//!
//! - Circuit breaker that stops hammering a failing venue
//! - Token-bucket rate limiter

pub mod circuit_breaker;
pub mod rate_limiter;

pub use circuit_breaker::{BreakerSettings, BreakerState, CircuitBreaker};
pub use rate_limiter::RateLimiter;
