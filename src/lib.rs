//! # hostgate
//!
//! A tool server in front of a remote booking API. Every call passes through
//! a middleware pipeline (logging, cached authentication, per-client rate
//! limiting, metrics); reads are served from a TTL/LRU response cache and
//! outbound calls are retried with exponential backoff.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use hostgate::config::Settings;
//! use hostgate::server::Server;
//! use hostgate::tools::ToolService;
//! use hostgate::upstream::Upstream;
//!
//! # async fn start(upstream: Arc<dyn Upstream>) -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load("hostgate.toml")?;
//! let service = ToolService::from_settings(&settings, upstream, || async { Ok(true) });
//!
//! let server = Server::bind(&settings.server.bind).await?;
//! server.serve(Arc::new(service)).await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod protocol;
pub mod retry;
pub mod security;
pub mod server;
pub mod tools;
pub mod upstream;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{Cache, CacheConfig, EvictionStrategy};
pub use config::Settings;
pub use error::{ErrorKind, ToolError};
pub use metrics::MetricsCollector;
pub use middleware::{Middleware, Next, Pipeline};
pub use retry::{RetryExecutor, RetryPolicy};
pub use security::{AuthMiddleware, RateLimitConfig, RateLimiter};
pub use server::{Server, ServerError};
pub use tools::ToolService;
