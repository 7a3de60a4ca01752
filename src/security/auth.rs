//! Cached authentication check.
//!
//! The booking API credentials are verified by an external callable. Its
//! verdict is cached for a TTL of its own, independent of the response cache,
//! so a burst of calls costs one verification.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::ToolError;
use crate::middleware::{BoxFuture, Middleware, Next, ToolResult};

/// Methods that never require authentication.
pub const DEFAULT_BYPASS: &[&str] = &["initialize", "ping", "tools/list"];

/// Type-erased verifier: resolves to whether the server is authenticated upstream.
pub type AuthVerifier = Arc<dyn Fn() -> BoxFuture<Result<bool, ToolError>> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct Verdict {
    authenticated: bool,
    checked_at: Instant,
}

struct AuthState {
    verifier: AuthVerifier,
    ttl: Duration,
    bypass: HashSet<String>,
    verdict: Mutex<Option<Verdict>>,
}

impl AuthState {
    fn cached(&self, now: Instant) -> Option<bool> {
        let verdict = self.verdict.lock().unwrap_or_else(|e| e.into_inner());
        (*verdict)
            .filter(|v| now.saturating_duration_since(v.checked_at) < self.ttl)
            .map(|v| v.authenticated)
    }

    fn store(&self, authenticated: bool) {
        let mut verdict = self.verdict.lock().unwrap_or_else(|e| e.into_inner());
        *verdict = Some(Verdict {
            authenticated,
            checked_at: Instant::now(),
        });
    }

    async fn is_authenticated(&self) -> Result<bool, ToolError> {
        if let Some(authenticated) = self.cached(Instant::now()) {
            return Ok(authenticated);
        }

        debug!("auth verdict expired, verifying");
        let authenticated = (self.verifier)().await.map_err(|e| {
            warn!(error = %e, "auth verifier failed");
            ToolError::Authentication(format!("verification failed: {e}"))
        })?;
        self.store(authenticated);
        Ok(authenticated)
    }
}

/// Rejects calls with [`ToolError::Authentication`] unless the cached
/// verdict says we are authenticated. Methods in the bypass list always pass.
///
/// Both positive and negative verdicts are cached for the TTL; verifier
/// errors are not.
#[derive(Clone)]
pub struct AuthMiddleware {
    state: Arc<AuthState>,
}

impl AuthMiddleware {
    pub fn new<F, Fut>(ttl: Duration, verifier: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, ToolError>> + Send + 'static,
    {
        let verifier: AuthVerifier = Arc::new(move || Box::pin(verifier()));
        Self {
            state: Arc::new(AuthState {
                verifier,
                ttl,
                bypass: DEFAULT_BYPASS.iter().map(|m| (*m).to_owned()).collect(),
                verdict: Mutex::new(None),
            }),
        }
    }

    /// Replaces the bypass list.
    ///
    /// Must be called before the middleware is shared.
    #[must_use]
    pub fn with_bypass<I, S>(self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let bypass = methods.into_iter().map(Into::into).collect();
        let state = match Arc::try_unwrap(self.state) {
            Ok(state) => AuthState { bypass, ..state },
            Err(shared) => AuthState {
                verifier: Arc::clone(&shared.verifier),
                ttl: shared.ttl,
                bypass,
                verdict: Mutex::new(None),
            },
        };
        Self {
            state: Arc::new(state),
        }
    }

    pub fn bypasses(&self, method: &str) -> bool {
        self.state.bypass.contains(method)
    }

    /// Resolves the cached verdict, calling the verifier when it has expired.
    pub async fn is_authenticated(&self) -> Result<bool, ToolError> {
        self.state.is_authenticated().await
    }

    /// Forgets the cached verdict so the next call re-verifies.
    pub fn invalidate(&self) {
        *self
            .state
            .verdict
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl Middleware for AuthMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture<ToolResult> {
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            if state.bypass.contains(ctx.method()) {
                return next.run(ctx).await;
            }
            if !state.is_authenticated().await? {
                return Err(ToolError::Authentication(
                    "not authenticated with the booking API".to_owned(),
                ));
            }
            next.run(ctx).await
        })
    }
}
