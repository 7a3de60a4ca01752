//! Per-call context — the state a tool invocation carries through the pipeline.
//!
//! A [`Context`] is created when a call enters the middleware pipeline and is
//! dropped when the result leaves it. Middleware may stash typed values in its
//! [`Extensions`] for handlers further down the chain.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;

use crate::error::ToolError;

/// Type-erased per-call extensions map, keyed by type.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value`, replacing any previous value of the same type.
    pub fn insert<T>(&mut self, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.map.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }
}

/// State of one tool invocation.
pub struct Context {
    method: String,
    client_id: String,
    params: Value,
    started_at: Instant,
    extensions: Extensions,
}

impl Context {
    /// Starts the clock for a call to `method` made by `client_id`.
    pub fn new(method: impl Into<String>, client_id: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            client_id: client_id.into(),
            params,
            started_at: Instant::now(),
            extensions: Extensions::new(),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    /// When the call was received. Durations are measured from here.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Deserializes the call params into `T`. A missing or `null` params value
    /// is treated as an empty object.
    pub fn parse_params<T>(&self) -> Result<T, ToolError>
    where
        T: DeserializeOwned,
    {
        let params = match &self.params {
            Value::Null => Value::Object(serde_json::Map::new()),
            other => other.clone(),
        };
        serde_json::from_value(params).map_err(|e| ToolError::Validation(e.to_string()))
    }
}
