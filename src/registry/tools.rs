//! Tool registry
//!
//! Input schemas are kept as the provider declared them (a JSON string) and
//! parsed on every listing; a schema that fails to parse is listed verbatim
//! rather than breaking `tools/list` for every other tool.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_mcp_sdk::schema::{CallToolResult, ContentBlock, TextContent};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::{HandlerError, RegistryError};
use crate::mcp::context::RequestContext;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub input_schema: String,
}

impl ToolInfo {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: input_schema.into(),
        }
    }

    pub fn to_listing(&self) -> Value {
        let input_schema = match serde_json::from_str::<Value>(&self.input_schema) {
            Ok(schema) => schema,
            Err(err) => {
                warn!(tool = %self.name, error = %err, "tool input schema is not valid json, listing raw");
                Value::String(self.input_schema.clone())
            }
        };

        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": input_schema,
        })
    }
}

/// What a tool hands back: human-readable text plus optional structured data.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub text: String,
    pub structured: Option<Map<String, Value>>,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            structured: None,
        }
    }

    pub fn structured(text: impl Into<String>, structured: Map<String, Value>) -> Self {
        Self {
            text: text.into(),
            structured: Some(structured),
        }
    }

    pub fn into_call_result(self) -> CallToolResult {
        CallToolResult {
            content: vec![ContentBlock::from(TextContent::new(self.text, None, None))],
            is_error: None,
            meta: None,
            structured_content: self.structured,
        }
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(
        &self,
        ctx: &RequestContext,
        arguments: Map<String, Value>,
    ) -> Result<ToolOutput, HandlerError>;
}

pub struct ToolDefinition {
    pub info: ToolInfo,
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolDefinition {
    pub fn new(info: ToolInfo, handler: Arc<dyn ToolHandler>) -> Self {
        Self { info, handler }
    }
}

/// A host-side component contributing tools.
pub trait ToolProvider: Send + Sync {
    fn tools(&self) -> Vec<ToolDefinition>;
}

#[derive(Debug)]
pub enum ToolCallError {
    UnknownTool(String),
    Failed(HandlerError),
}

#[derive(Default)]
pub struct ToolRegistry {
    entries: Vec<ToolInfo>,
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn build(providers: &[Arc<dyn ToolProvider>]) -> Result<Self, RegistryError> {
        let mut registry = Self::default();

        for provider in providers {
            for definition in provider.tools() {
                let name = definition.info.name.clone();
                if registry.handlers.contains_key(&name) {
                    return Err(RegistryError::Duplicate { kind: "tool", name });
                }
                registry.handlers.insert(name, definition.handler);
                registry.entries.push(definition.info);
            }
        }

        info!(tools = registry.entries.len(), "tool registry built");
        Ok(registry)
    }

    pub fn list(&self) -> Vec<Value> {
        self.entries.iter().map(ToolInfo::to_listing).collect()
    }

    pub async fn call(
        &self,
        ctx: &RequestContext,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallToolResult, ToolCallError> {
        let Some(handler) = self.handlers.get(name) else {
            return Err(ToolCallError::UnknownTool(name.to_string()));
        };

        handler
            .call(ctx, arguments)
            .await
            .map(ToolOutput::into_call_result)
            .map_err(ToolCallError::Failed)
    }
}
