//! Tool registry and the booking tools built on it.
//!
//! A tool is a named async handler from [`Context`] to a JSON result. The
//! [`ToolRegistry`] maps names to handlers in registration order;
//! [`ToolService`] puts the registry behind the middleware pipeline and speaks
//! the wire protocol.

use std::collections::HashMap;

use serde::Serialize;

use crate::context::Context;
use crate::error::ToolError;
use crate::middleware::{BoxFuture, Handler, IntoHandler, ToolResult, handler};

pub mod booking;
pub mod params;
mod service;

pub use booking::BookingTools;
pub use service::ToolService;

/// Name and one-line description of a registered tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
}

/// Name → handler table.
#[derive(Default)]
pub struct ToolRegistry {
    descriptors: Vec<ToolDescriptor>,
    handlers: HashMap<String, Handler>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `tool` under `name`, replacing any previous tool of that name.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        tool: impl IntoHandler,
    ) -> &mut Self {
        let name = name.into();
        let descriptor = ToolDescriptor {
            name: name.clone(),
            description: description.into(),
        };
        match self.descriptors.iter_mut().find(|d| d.name == name) {
            Some(existing) => *existing = descriptor,
            None => self.descriptors.push(descriptor),
        }
        self.handlers.insert(name, handler(tool));
        self
    }

    /// Registered tools in registration order.
    pub fn list(&self) -> &[ToolDescriptor] {
        &self.descriptors
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Invokes the tool named by `ctx.method()`.
    pub fn call(&self, ctx: Context) -> BoxFuture<ToolResult> {
        match self.handlers.get(ctx.method()) {
            Some(tool) => tool(ctx),
            None => {
                let name = ctx.method().to_owned();
                Box::pin(async move { Err(ToolError::MethodNotFound(name)) })
            }
        }
    }
}
