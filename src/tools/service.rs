//! [`ToolService`]: the pipeline in front of the registry, the built-in
//! methods and the wire-level `handle`.

use std::future::Future;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::info;

use crate::cache::Cache;
use crate::config::Settings;
use crate::context::Context;
use crate::error::ToolError;
use crate::metrics::MetricsCollector;
use crate::middleware::{Handler, Pipeline, ToolResult, handler};
use crate::protocol::{Request, Response};
use crate::retry::RetryExecutor;
use crate::security::{AuthMiddleware, RateLimitMiddleware, RateLimiter};
use crate::upstream::Upstream;

use super::{BookingTools, ToolRegistry};

/// Client id used when a request names none and no peer address is known.
pub const ANONYMOUS_CLIENT: &str = "anonymous";

/// Entry point for tool calls: runs each call through the pipeline and then
/// either a built-in method or the registry.
///
/// Built-in methods: `initialize`, `ping`, `tools/list` and `metrics/export`.
pub struct ToolService {
    registry: Arc<ToolRegistry>,
    pipeline: Pipeline,
    metrics: Arc<MetricsCollector>,
    handler: Handler,
}

impl ToolService {
    /// Serves `registry` behind `pipeline`. Built-ins are routed before the registry.
    pub fn new(registry: ToolRegistry, pipeline: Pipeline, metrics: Arc<MetricsCollector>) -> Self {
        let registry = Arc::new(registry);
        let handler = {
            let registry = Arc::clone(&registry);
            let metrics = Arc::clone(&metrics);
            handler(move |ctx: Context| route(Arc::clone(&registry), Arc::clone(&metrics), ctx))
        };
        Self {
            registry,
            pipeline,
            metrics,
            handler,
        }
    }

    /// Wires the booking tools, cache, retry executor and standard pipeline
    /// from `settings`. `verifier` answers whether we are authenticated with
    /// the booking API.
    pub fn from_settings<F, Fut>(settings: &Settings, upstream: Arc<dyn Upstream>, verifier: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, ToolError>> + Send + 'static,
    {
        let metrics = Arc::new(MetricsCollector::new());
        let cache = Arc::new(
            Cache::new(settings.cache.to_config()).with_metrics("responses", Arc::clone(&metrics)),
        );
        let executor = RetryExecutor::new().with_metrics(Arc::clone(&metrics));

        let mut tools = BookingTools::new(upstream, cache, executor, settings.retry.to_policy());
        if let Some(timeout) = settings.retry.timeout() {
            tools = tools.with_timeout(timeout);
        }
        let mut registry = ToolRegistry::new();
        Arc::new(tools).register(&mut registry);

        let auth = AuthMiddleware::new(settings.auth.ttl(), verifier)
            .with_bypass(settings.auth.bypass.iter().cloned());
        let limiter = Arc::new(RateLimiter::new(settings.rate_limit.to_config()));
        let pipeline = Pipeline::standard(
            auth,
            RateLimitMiddleware::new(limiter),
            Arc::clone(&metrics),
        );

        info!(
            tools = registry.len(),
            middlewares = pipeline.len(),
            "tool service ready"
        );
        Self::new(registry, pipeline, metrics)
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Runs one call through the pipeline.
    pub async fn call(&self, method: &str, client_id: &str, params: Value) -> ToolResult {
        let ctx = Context::new(method, client_id, params);
        self.pipeline.dispatch(ctx, Arc::clone(&self.handler)).await
    }

    /// Serves one protocol request. The response echoes the request id.
    pub async fn handle(&self, request: Request) -> Response {
        let Request {
            id,
            method,
            params,
            client_id,
        } = request;
        let client_id = client_id.as_deref().unwrap_or(ANONYMOUS_CLIENT);
        let result = self.call(&method, client_id, params).await;
        Response::from_result(id, result)
    }
}

async fn route(registry: Arc<ToolRegistry>, metrics: Arc<MetricsCollector>, ctx: Context) -> ToolResult {
    let method = ctx.method().to_owned();
    match method.as_str() {
        "initialize" => Ok(json!({
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "tools": registry.len(),
        })),
        "ping" => Ok(json!({ "pong": true })),
        "tools/list" => Ok(json!({ "tools": registry.list() })),
        "metrics/export" => Ok(json!({
            "format": "text",
            "body": metrics.export(),
        })),
        _ => registry.call(ctx).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::BoxFuture;
    use crate::upstream::UpstreamRequest;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingUpstream {
        calls: AtomicU32,
    }

    impl Upstream for CountingUpstream {
        fn send(&self, request: UpstreamRequest) -> BoxFuture<Result<Value, ToolError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok(json!({ "path": request.path })) })
        }
    }

    fn service(settings: &Settings, authenticated: bool) -> (ToolService, Arc<CountingUpstream>) {
        let upstream = Arc::new(CountingUpstream {
            calls: AtomicU32::new(0),
        });
        let service = ToolService::from_settings(settings, upstream.clone(), move || async move {
            Ok(authenticated)
        });
        (service, upstream)
    }

    #[tokio::test(start_paused = true)]
    async fn handles_tool_calls_and_echoes_id() {
        let (service, upstream) = service(&Settings::default(), true);

        let req = Request::new(json!("r-1"), "get_property", json!({ "id": "7" }))
            .with_client_id("ops");
        let resp = service.handle(req.clone()).await;
        assert_eq!(resp.id, json!("r-1"));
        assert_eq!(resp.result, Some(json!({ "path": "/properties/7" })));

        service.handle(req).await;
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);

        let snap = service.metrics().snapshot();
        assert_eq!(
            snap.counter("cache_hits_total", &[("cache", "responses")]),
            Some(1)
        );
        assert_eq!(
            snap.counter(
                "tool_calls_total",
                &[("method", "get_property"), ("outcome", "ok")]
            ),
            Some(2)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn builtins_answer_without_authentication() {
        let (service, _) = service(&Settings::default(), false);

        let pong = service.call("ping", "c", Value::Null).await.unwrap();
        assert_eq!(pong, json!({ "pong": true }));

        let listed = service.call("tools/list", "c", Value::Null).await.unwrap();
        let names: Vec<&str> = listed["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                "list_properties",
                "get_property",
                "list_reservations",
                "get_reservation",
                "update_reservation"
            ]
        );

        let err = service.call("metrics/export", "c", Value::Null).await.unwrap_err();
        assert!(matches!(err, ToolError::Authentication(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_methods_are_reported() {
        let (service, _) = service(&Settings::default(), true);
        let resp = service
            .handle(Request::new(json!(3), "delete_everything", Value::Null))
            .await;
        let error = resp.error.unwrap();
        assert_eq!(error.kind, "PermanentError");
        assert!(error.message.contains("delete_everything"));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_applies_per_client() {
        let settings = Settings::from_toml_str("[rate_limit]\nrequests_per_window = 2\n").unwrap();
        let (service, _) = service(&settings, true);

        for _ in 0..2 {
            service.call("ping", "X", Value::Null).await.unwrap();
        }
        let err = service.call("ping", "X", Value::Null).await.unwrap_err();
        assert!(matches!(err, ToolError::RateLimitExceeded { .. }));
        assert!(service.call("ping", "Y", Value::Null).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn metrics_export_renders_text() {
        let (service, _) = service(&Settings::default(), true);
        service.call("ping", "c", Value::Null).await.unwrap();

        let exported = service.call("metrics/export", "c", Value::Null).await.unwrap();
        let body = exported["body"].as_str().unwrap();
        assert!(body.contains("tool_calls_total{method=\"ping\",outcome=\"ok\"} 1"));
    }
}
