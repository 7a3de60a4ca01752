//! Booking API tools: properties and reservations.
//!
//! Reads go through the response cache (cache-aside) and every outbound call
//! goes through the retry executor. Writes use a non-idempotent policy and
//! invalidate the reservation entries they may have changed.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::debug;

use crate::cache::{Cache, Ttl, cached};
use crate::context::Context;
use crate::error::ToolError;
use crate::middleware::ToolResult;
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::upstream::{Method, Upstream, UpstreamRequest};

use super::ToolRegistry;
use super::params::{Pagination, optional_str, optional_u64, required_u64};

pub const PROPERTIES_TAG: &str = "properties";
pub const RESERVATIONS_TAG: &str = "reservations";

/// The booking tools and the collaborators they share.
pub struct BookingTools {
    upstream: Arc<dyn Upstream>,
    cache: Arc<Cache<Value>>,
    executor: RetryExecutor,
    policy: RetryPolicy,
    timeout: Option<Duration>,
}

impl BookingTools {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        cache: Arc<Cache<Value>>,
        executor: RetryExecutor,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            upstream,
            cache,
            executor,
            policy,
            timeout: None,
        }
    }

    /// Bounds each call, retries included, by `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cache(&self) -> &Arc<Cache<Value>> {
        &self.cache
    }

    /// Registers every booking tool on `registry`.
    pub fn register(self: Arc<Self>, registry: &mut ToolRegistry) {
        let tools = Arc::clone(&self);
        registry.register(
            "list_properties",
            "List properties, paginated with page and per_page",
            move |ctx: Context| {
                let tools = Arc::clone(&tools);
                async move { tools.list_properties(ctx.params()).await }
            },
        );

        let tools = Arc::clone(&self);
        registry.register(
            "get_property",
            "Fetch one property by id",
            move |ctx: Context| {
                let tools = Arc::clone(&tools);
                async move { tools.get_property(ctx.params()).await }
            },
        );

        let tools = Arc::clone(&self);
        registry.register(
            "list_reservations",
            "List reservations, optionally filtered by status and property_id",
            move |ctx: Context| {
                let tools = Arc::clone(&tools);
                async move { tools.list_reservations(ctx.params()).await }
            },
        );

        let tools = Arc::clone(&self);
        registry.register(
            "get_reservation",
            "Fetch one reservation by id",
            move |ctx: Context| {
                let tools = Arc::clone(&tools);
                async move { tools.get_reservation(ctx.params()).await }
            },
        );

        let tools = self;
        registry.register(
            "update_reservation",
            "Update fields of a reservation; every other param is sent as the patch body",
            move |ctx: Context| {
                let tools = Arc::clone(&tools);
                async move { tools.update_reservation(ctx.params()).await }
            },
        );
    }

    pub async fn list_properties(&self, params: &Value) -> ToolResult {
        let page = Pagination::from_params(params)?;
        let key = format!("properties:page={}:per_page={}", page.page, page.per_page);
        let request = UpstreamRequest::get("/properties")
            .query("page", page.page)
            .query("per_page", page.per_page);
        self.fetch(&key, &[PROPERTIES_TAG], request).await
    }

    pub async fn get_property(&self, params: &Value) -> ToolResult {
        let id = required_u64(params, "id")?;
        let request = UpstreamRequest::get(format!("/properties/{id}"));
        self.fetch(&property_key(id), &[PROPERTIES_TAG], request)
            .await
    }

    pub async fn list_reservations(&self, params: &Value) -> ToolResult {
        let page = Pagination::from_params(params)?;
        let status = optional_str(params, "status")?;
        let property_id = optional_u64(params, "property_id")?;

        let mut key = format!(
            "reservations:page={}:per_page={}",
            page.page, page.per_page
        );
        let mut request = UpstreamRequest::get("/reservations")
            .query("page", page.page)
            .query("per_page", page.per_page);
        if let Some(status) = status {
            key.push_str(&format!(":status={status}"));
            request = request.query("status", status);
        }
        if let Some(property_id) = property_id {
            key.push_str(&format!(":property={property_id}"));
            request = request.query("property_id", property_id);
        }
        self.fetch(&key, &[RESERVATIONS_TAG], request).await
    }

    pub async fn get_reservation(&self, params: &Value) -> ToolResult {
        let id = required_u64(params, "id")?;
        let request = UpstreamRequest::get(format!("/reservations/{id}"));
        self.fetch(&reservation_key(id), &[RESERVATIONS_TAG], request)
            .await
    }

    pub async fn update_reservation(&self, params: &Value) -> ToolResult {
        let id = required_u64(params, "id")?;
        let patch: Map<String, Value> = params
            .as_object()
            .into_iter()
            .flatten()
            .filter(|(k, _)| k.as_str() != "id")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if patch.is_empty() {
            return Err(ToolError::Validation(
                "update_reservation needs at least one field to change".to_owned(),
            ));
        }

        let request = UpstreamRequest::new(Method::Patch, format!("/reservations/{id}"))
            .body(Value::Object(patch));
        let mut policy = self.policy();
        if !request.method.is_idempotent() {
            policy = policy.non_idempotent();
        }

        let result = self
            .executor
            .execute(&policy, || self.upstream.send(request.clone()))
            .await?;

        let dropped = self.cache.invalidate_tags(&[RESERVATIONS_TAG])
            + usize::from(self.cache.delete(&reservation_key(id)));
        debug!(reservation = id, dropped, "reservation updated, cache invalidated");
        Ok(result)
    }

    fn policy(&self) -> RetryPolicy {
        match self.timeout {
            Some(timeout) => self.policy.clone().with_timeout(timeout),
            None => self.policy.clone(),
        }
    }

    async fn fetch(&self, key: &str, tags: &[&str], request: UpstreamRequest) -> ToolResult {
        let policy = self.policy();
        cached(&self.cache, key, Ttl::Default, tags, || {
            self.executor
                .execute(&policy, || self.upstream.send(request.clone()))
        })
        .await
    }
}

pub fn property_key(id: u64) -> String {
    format!("property:{id}")
}

pub fn reservation_key(id: u64) -> String {
    format!("reservation:{id}")
}
