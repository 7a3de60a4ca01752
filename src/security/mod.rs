//! Security middleware — cached authentication and per-client rate limiting.
//!
//! - [`AuthMiddleware`] — verifies a cached "is authenticated" verdict; a
//!   bypass list lets capability discovery through without it.
//! - [`RateLimiter`] / [`RateLimitMiddleware`] — sliding-window request budget
//!   per client id.
//!
//! Both fail fast: the handler is never invoked for a rejected call.

mod auth;
mod rate_limit;

pub use auth::{AuthMiddleware, AuthVerifier, DEFAULT_BYPASS};
pub use rate_limit::{RateLimitConfig, RateLimitMiddleware, RateLimiter};
