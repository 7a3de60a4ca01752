//! Per-client sliding-window rate limiting.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::context::Context;
use crate::error::ToolError;
use crate::middleware::{BoxFuture, Middleware, Next, ToolResult};

/// Rate limiter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Maximum accepted requests per client inside one window.
    pub requests_per_window: u32,
    /// Length of the trailing window.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::per_minute(60)
    }
}

impl RateLimitConfig {
    /// Allows `requests_per_window` accepted calls in any trailing `window`.
    #[must_use]
    pub fn new(requests_per_window: u32, window: Duration) -> Self {
        Self {
            requests_per_window,
            window,
        }
    }

    #[must_use]
    pub fn per_second(requests: u32) -> Self {
        Self::new(requests, Duration::from_secs(1))
    }

    #[must_use]
    pub fn per_minute(requests: u32) -> Self {
        Self::new(requests, Duration::from_secs(60))
    }
}

/// In-memory sliding-window limiter keyed by client id.
///
/// Each client owns a queue of accepted request instants. A check drops the
/// instants that have left the window, then accepts and records the request
/// only if the remaining count is under the limit. Rejected requests are not
/// recorded, so hammering a full window does not extend it.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    /// Creates a limiter with no recorded requests.
    ///
    /// # Examples
    ///
    /// ```
    /// use hostgate::security::{RateLimitConfig, RateLimiter};
    ///
    /// let limiter = RateLimiter::new(RateLimitConfig::per_minute(2));
    /// assert_eq!(limiter.usage("ops"), (0, 2));
    /// ```
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// The limit and window this limiter enforces.
    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Instant>>> {
        self.windows.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Accepts and records one request for `client_id`, or returns
    /// [`ToolError::RateLimitExceeded`] with the time until a slot frees up.
    pub fn check(&self, client_id: &str) -> Result<(), ToolError> {
        let now = Instant::now();
        let mut windows = self.lock();
        let window = windows.entry(client_id.to_owned()).or_default();
        prune(window, now, self.config.window);

        if window.len() >= self.config.requests_per_window as usize {
            let retry_after = window
                .front()
                .map(|oldest| {
                    self.config
                        .window
                        .saturating_sub(now.saturating_duration_since(*oldest))
                })
                .unwrap_or(self.config.window);
            return Err(ToolError::RateLimitExceeded {
                client_id: client_id.to_owned(),
                retry_after,
            });
        }

        window.push_back(now);
        Ok(())
    }

    /// Like [`check`](Self::check) but only reports whether the request was accepted.
    pub fn allow(&self, client_id: &str) -> bool {
        self.check(client_id).is_ok()
    }

    /// Returns `(requests in the current window, limit)` without recording anything.
    pub fn usage(&self, client_id: &str) -> (u32, u32) {
        let now = Instant::now();
        let mut windows = self.lock();
        let current = match windows.get_mut(client_id) {
            Some(window) => {
                prune(window, now, self.config.window);
                window.len() as u32
            }
            None => 0,
        };
        (current, self.config.requests_per_window)
    }
}

// Drops instants that are a full window or more in the past.
fn prune(window: &mut VecDeque<Instant>, now: Instant, length: Duration) {
    while let Some(oldest) = window.front() {
        if now.saturating_duration_since(*oldest) >= length {
            window.pop_front();
        } else {
            break;
        }
    }
}

/// Rejects calls from clients that are over budget before any work is done.
pub struct RateLimitMiddleware {
    limiter: Arc<RateLimiter>,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

impl Middleware for RateLimitMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture<ToolResult> {
        let limiter = Arc::clone(&self.limiter);
        Box::pin(async move {
            if let Err(e) = limiter.check(ctx.client_id()) {
                warn!(client = %ctx.client_id(), method = %ctx.method(), "rate limit exceeded");
                return Err(e);
            }
            next.run(ctx).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{Pipeline, handler};
    use serde_json::Value;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn third_call_in_window_is_rejected() {
        let limiter = RateLimiter::new(RateLimitConfig::new(2, Duration::from_secs(60)));

        assert!(limiter.check("X").is_ok());
        advance(Duration::from_millis(300)).await;
        assert!(limiter.check("X").is_ok());
        advance(Duration::from_millis(300)).await;

        match limiter.check("X") {
            Err(ToolError::RateLimitExceeded { client_id, retry_after }) => {
                assert_eq!(client_id, "X");
                assert_eq!(retry_after, Duration::from_millis(59_400));
            }
            other => panic!("expected RateLimitExceeded, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_n_plus_one_rejects_only_the_last() {
        let limiter = RateLimiter::new(RateLimitConfig::per_minute(5));
        let accepted: Vec<bool> = (0..6).map(|_| limiter.allow("c")).collect();
        assert_eq!(accepted, vec![true, true, true, true, true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn window_elapsing_frees_budget() {
        let limiter = RateLimiter::new(RateLimitConfig::new(1, Duration::from_secs(10)));
        assert!(limiter.allow("c"));
        assert!(!limiter.allow("c"));

        advance(Duration::from_secs(10)).await;
        assert!(limiter.allow("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_calls_are_not_recorded() {
        let limiter = RateLimiter::new(RateLimitConfig::new(1, Duration::from_secs(10)));
        assert!(limiter.allow("c"));
        advance(Duration::from_secs(9)).await;
        assert!(!limiter.allow("c"));
        advance(Duration::from_secs(1)).await;
        // Only the first call occupied the window, so a slot is free at t=10s.
        assert!(limiter.allow("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn clients_are_independent() {
        let limiter = RateLimiter::new(RateLimitConfig::new(1, Duration::from_secs(60)));
        assert!(limiter.allow("a"));
        assert!(limiter.allow("b"));
        assert!(!limiter.allow("a"));
        assert_eq!(limiter.usage("a"), (1, 1));
        assert_eq!(limiter.usage("unknown"), (0, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn middleware_short_circuits_before_handler() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::new(1, Duration::from_secs(60))));
        let mut pipeline = Pipeline::new();
        pipeline.register(RateLimitMiddleware::new(Arc::clone(&limiter)));

        let calls = Arc::new(AtomicU32::new(0));
        let counted = {
            let calls = Arc::clone(&calls);
            handler(move |_ctx: Context| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ToolError>(Value::Null)
                }
            })
        };

        let first = pipeline
            .dispatch(Context::new("list_properties", "X", Value::Null), Arc::clone(&counted))
            .await;
        let second = pipeline
            .dispatch(Context::new("list_properties", "X", Value::Null), counted)
            .await;

        assert!(first.is_ok());
        assert!(matches!(second, Err(ToolError::RateLimitExceeded { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_calls_accept_exactly_the_limit() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::per_minute(50)));

        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.allow("X") })
            })
            .collect();

        let mut accepted = 0;
        for task in tasks {
            if task.await.unwrap() {
                accepted += 1;
            }
        }

        assert_eq!(accepted, 50);
        assert_eq!(limiter.usage("X"), (50, 50));
    }
}
