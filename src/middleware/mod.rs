//! Middleware pipeline — ordered interceptors around every tool call.
//!
//! This module defines the core types for building an ordered middleware stack.
//! Each middleware wraps the next layer, so it can inspect the call, refuse it
//! by returning an error without calling [`Next::run`], or observe the result
//! on the way back out.
//!
//! ## Core types
//!
//! - [`Middleware`] — trait implemented by all middleware.
//! - [`Next`] — cursor into the remaining chain; call [`Next::run`] to advance.
//! - [`Pipeline`] — the ordered stack; [`Pipeline::register`] appends and
//!   [`Pipeline::dispatch`] runs a call through it to a [`Handler`].
//! - [`LoggerMiddleware`] and [`MetricsMiddleware`] — built-in observers.
//!
//! The standard order, built by [`Pipeline::standard`], is logging, auth,
//! rate limiting, metrics, then the handler. Logging is outermost so it sees
//! every call, including the ones auth or rate limiting reject; auth runs
//! before rate limiting so unauthenticated traffic spends no client budget.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::ToolError;
use crate::metrics::MetricsCollector;
use crate::security::{AuthMiddleware, RateLimitMiddleware};

/// Boxed `Send` future, the return type of every middleware and handler.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Outcome of a tool call.
pub type ToolResult = Result<Value, ToolError>;

/// Type-erased terminal handler at the bottom of the pipeline.
pub type Handler = Arc<dyn Fn(Context) -> BoxFuture<ToolResult> + Send + Sync + 'static>;

/// Type-erased, reference-counted middleware function.
pub type MiddlewareHandler =
    Arc<dyn Fn(Context, Next) -> BoxFuture<ToolResult> + Send + Sync + 'static>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(Context) -> impl Future<Output = ToolResult> + Send` that is also
/// `Send + Sync + 'static` implements this trait through the blanket impl.
pub trait IntoHandler: Send + Sync + 'static {
    fn call(&self, ctx: Context) -> BoxFuture<ToolResult>;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = ToolResult> + Send + 'static,
{
    fn call(&self, ctx: Context) -> BoxFuture<ToolResult> {
        Box::pin((self)(ctx))
    }
}

/// Erases a handler's concrete type.
pub fn handler(handler: impl IntoHandler) -> Handler {
    Arc::new(move |ctx| handler.call(ctx))
}

/// Converts a [`Middleware`] into a [`MiddlewareHandler`].
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

/// A cursor into the remaining middleware chain for a single call.
///
/// `Next` is consumed by [`run`](Self::run), so a middleware can forward a
/// call at most once.
pub struct Next {
    middlewares: Arc<Vec<MiddlewareHandler>>,
    // Index of the middleware the next `run` call invokes.
    index: usize,
    handler: Handler,
}

impl Next {
    fn new(middlewares: Arc<Vec<MiddlewareHandler>>, handler: Handler) -> Self {
        Self {
            middlewares,
            index: 0,
            handler,
        }
    }

    /// Invokes the next middleware, or the terminal handler once the chain is
    /// exhausted.
    pub async fn run(mut self, ctx: Context) -> ToolResult {
        if let Some(middleware) = self.middlewares.get(self.index).cloned() {
            self.index += 1;
            middleware(ctx, self).await
        } else {
            (self.handler)(ctx).await
        }
    }
}

/// The core trait for all middleware.
///
/// Implementors receive a [`Context`] and a [`Next`] cursor. They may:
///
/// - **Pass through** — `next.run(ctx).await`.
/// - **Short-circuit** — return an `Err` without calling `next`; the error
///   unwinds through every middleware already entered.
/// - **Observe** — await `next.run(ctx)` and inspect the result.
///
/// Implementations must not hold locks across an `.await`.
pub trait Middleware: Send + Sync {
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture<ToolResult>;
}

/// An ordered middleware stack.
#[derive(Clone, Default)]
pub struct Pipeline {
    middlewares: Arc<Vec<MiddlewareHandler>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the default stack: logging → auth → rate limiting → metrics.
    pub fn standard(
        auth: AuthMiddleware,
        rate_limit: RateLimitMiddleware,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let mut pipeline = Self::new();
        pipeline
            .register(LoggerMiddleware)
            .register(auth)
            .register(rate_limit)
            .register(MetricsMiddleware::new(metrics));
        pipeline
    }

    /// Appends `middleware`; it runs after every middleware registered before it.
    pub fn register<M>(&mut self, middleware: M) -> &mut Self
    where
        M: Middleware + 'static,
    {
        Arc::make_mut(&mut self.middlewares).push(from_middleware(Arc::new(middleware)));
        self
    }

    /// Number of registered middlewares.
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Runs `ctx` through every middleware in order and finally `handler`.
    pub async fn dispatch(&self, ctx: Context, handler: Handler) -> ToolResult {
        Next::new(Arc::clone(&self.middlewares), handler)
            .run(ctx)
            .await
    }
}

/// Logs the start and outcome of every call with its duration, measured from
/// [`Context::started_at`].
///
/// Never short-circuits. Failures are logged at `warn` with their error kind.
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture<ToolResult> {
        Box::pin(async move {
            let start = ctx.started_at();
            let method = ctx.method().to_owned();
            let client = ctx.client_id().to_owned();
            debug!(%method, %client, "call started");

            let result = next.run(ctx).await;
            let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

            match &result {
                Ok(_) => info!(%method, %client, duration_ms, "call succeeded"),
                Err(e) => warn!(
                    %method,
                    %client,
                    duration_ms,
                    kind = %e.kind(),
                    error = %e,
                    "call failed"
                ),
            }
            result
        })
    }
}

/// Counts calls, errors and durations for calls that got past auth and rate
/// limiting. Durations run from [`Context::started_at`].
pub struct MetricsMiddleware {
    metrics: Arc<MetricsCollector>,
}

impl MetricsMiddleware {
    pub fn new(metrics: Arc<MetricsCollector>) -> Self {
        metrics.describe("tool_calls_total", "Tool calls by method and outcome");
        metrics.describe("tool_call_duration_seconds", "Tool call latency");
        metrics.describe("tool_errors_total", "Tool call failures by error kind");
        Self { metrics }
    }
}

impl Middleware for MetricsMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture<ToolResult> {
        let metrics = Arc::clone(&self.metrics);
        Box::pin(async move {
            let start = ctx.started_at();
            let method = ctx.method().to_owned();

            let result = next.run(ctx).await;

            let outcome = if result.is_ok() { "ok" } else { "error" };
            metrics.increment_counter(
                "tool_calls_total",
                &[("method", &method), ("outcome", outcome)],
                1,
            );
            metrics.observe_histogram(
                "tool_call_duration_seconds",
                start.elapsed().as_secs_f64(),
                &[("method", &method)],
            );
            if let Err(e) = &result {
                metrics.increment_counter("tool_errors_total", &[("kind", e.kind().as_str())], 1);
            }
            result
        })
    }
}
