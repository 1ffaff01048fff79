//! The central Model Context Protocol engine
//!
//! Validates envelopes, routes methods through a static table, and composes the
//! registries and the rate limiter. Handler failures are turned into JSON-RPC
//! errors here; internal detail is logged and never sent to the client.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rust_mcp_sdk::schema::{
    CallToolRequestParams, Implementation, InitializeResult, ListResourcesResult, ProtocolVersion,
    ReadResourceRequestParams, ServerCapabilities, ServerCapabilitiesPrompts,
    ServerCapabilitiesResources, ServerCapabilitiesTools,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use crate::mcp::context::RequestContext;
use crate::mcp::rpc::{json_rpc_error, ErrorCode, JsonRpcRequest, JsonRpcResponse, RpcError};
use crate::rate_limit::TokenBucket;
use crate::registry::{
    resources::ResourceReadError, tools::ToolCallError, HandlerError, PromptRegistry,
    ResourceRegistry, ToolRegistry,
};

pub const SUPPORTED_PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Initialize,
    Initialized,
    Ping,
    ToolsList,
    ToolsCall,
    ResourcesList,
    ResourcesRead,
    ResourceTemplatesList,
    PromptsList,
    PromptsGet,
}

impl FromStr for Method {
    type Err = ();

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Ok(match name {
            "initialize" => Self::Initialize,
            "notifications/initialized" => Self::Initialized,
            "ping" => Self::Ping,
            "tools/list" => Self::ToolsList,
            "tools/call" => Self::ToolsCall,
            "resources/list" => Self::ResourcesList,
            "resources/read" => Self::ResourcesRead,
            "resources/templates/list" => Self::ResourceTemplatesList,
            "prompts/list" => Self::PromptsList,
            "prompts/get" => Self::PromptsGet,
            _ => return Err(()),
        })
    }
}

/// Transport-level facts about where a message came from.
#[derive(Debug, Clone, Default)]
pub struct Inbound {
    pub session_id: Option<String>,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PromptGetParams {
    name: String,
    #[serde(default)]
    arguments: Map<String, Value>,
}

pub struct Dispatcher {
    tools: ToolRegistry,
    resources: ResourceRegistry,
    prompts: PromptRegistry,
    rate_limiter: Option<Arc<TokenBucket>>,
    call_timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(tools: ToolRegistry, resources: ResourceRegistry, prompts: PromptRegistry) -> Self {
        Self {
            tools,
            resources,
            prompts,
            rate_limiter: None,
            call_timeout: None,
        }
    }

    /// Guards `tools/call` with a shared token bucket.
    pub fn with_rate_limiter(mut self, limiter: Arc<TokenBucket>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Bounds how long a tool handler may run before the caller gets a timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Handles one decoded JSON value. `None` means no response is due.
    pub async fn handle_value(&self, inbound: &Inbound, payload: Value) -> Option<JsonRpcResponse> {
        if !payload.is_object() {
            return Some(json_rpc_error(None, ErrorCode::InvalidRequest));
        }

        let raw_id = payload.get("id").cloned();
        let request: JsonRpcRequest = match serde_json::from_value(payload) {
            Ok(request) => request,
            Err(_) => return Some(json_rpc_error(raw_id, ErrorCode::InvalidRequest)),
        };

        self.dispatch(inbound, request).await
    }

    pub async fn dispatch(
        &self,
        inbound: &Inbound,
        request: JsonRpcRequest,
    ) -> Option<JsonRpcResponse> {
        if !request.is_valid() {
            return Some(json_rpc_error(request.id, ErrorCode::InvalidRequest));
        }

        let mut ctx = RequestContext::new(request.id.clone(), inbound.session_id.clone());
        if let Some(correlation_id) = &inbound.correlation_id {
            ctx = ctx.with_correlation_id(correlation_id.clone());
        }

        let notification = request.is_notification();
        let audit_params = audit_params(request.params.as_ref());
        let method = request.method.clone();

        let response = ctx
            .clone()
            .scope(self.route(&ctx, request))
            .await;

        info!(
            method = %method,
            params = %audit_params,
            correlation_id = ctx.correlation_id(),
            request_id = ?ctx.request_id(),
            session_id = ctx.session_id().unwrap_or("-"),
            outcome = if response.is_error() { "failure" } else { "success" },
            "mcp action audited"
        );

        (!notification).then_some(response)
    }

    async fn route(&self, ctx: &RequestContext, request: JsonRpcRequest) -> JsonRpcResponse {
        let JsonRpcRequest {
            id, method, params, ..
        } = request;

        let Ok(method) = Method::from_str(&method) else {
            return json_rpc_error(id, ErrorCode::MethodNotFound);
        };

        match method {
            Method::Initialize => to_result(id, initialize_result()),
            Method::Initialized | Method::Ping => JsonRpcResponse::result(id, json!({})),
            Method::ToolsList => JsonRpcResponse::result(id, json!({ "tools": self.tools.list() })),
            Method::ToolsCall => self.call_tool(ctx, id, params).await,
            Method::ResourcesList => to_result(
                id,
                ListResourcesResult {
                    meta: None,
                    next_cursor: None,
                    resources: self.resources.list(),
                },
            ),
            Method::ResourcesRead => self.read_resource(ctx, id, params).await,
            Method::ResourceTemplatesList => to_result(
                id,
                json!({ "resourceTemplates": self.resources.list_templates() }),
            ),
            Method::PromptsList => {
                to_result(id, json!({ "prompts": self.prompts.list() }))
            }
            Method::PromptsGet => self.get_prompt(id, params),
        }
    }

    async fn call_tool(
        &self,
        ctx: &RequestContext,
        id: Option<Value>,
        params: Option<Value>,
    ) -> JsonRpcResponse {
        let Some(call) = parse_params::<CallToolRequestParams>(params) else {
            return json_rpc_error(id, ErrorCode::InvalidParams);
        };

        if let Some(limiter) = &self.rate_limiter {
            if !limiter.try_acquire() {
                warn!(
                    tool = %call.name,
                    correlation_id = ctx.correlation_id(),
                    "tool call rejected by rate limiter"
                );
                return json_rpc_error(id, ErrorCode::RateLimited);
            }
        }

        let arguments = call.arguments.unwrap_or_default();
        let invocation = self.tools.call(ctx, &call.name, arguments);
        let outcome = match self.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, invocation).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(tool = %call.name, timeout_ms = limit.as_millis() as u64, "tool call timed out");
                    Err(ToolCallError::Failed(HandlerError::Timeout(call.name.clone())))
                }
            },
            None => invocation.await,
        };

        match outcome {
            Ok(result) => to_result(id, result),
            Err(ToolCallError::UnknownTool(name)) => JsonRpcResponse::error(
                id,
                RpcError::new(ErrorCode::InvalidParams).with_detail(
                    "tool_not_found",
                    "unknown tool name",
                    json!({ "name": name }),
                ),
            ),
            Err(ToolCallError::Failed(err)) => {
                handler_failure(id, ctx, "tool", &call.name, &err)
            }
        }
    }

    async fn read_resource(
        &self,
        ctx: &RequestContext,
        id: Option<Value>,
        params: Option<Value>,
    ) -> JsonRpcResponse {
        let Some(read) = parse_params::<ReadResourceRequestParams>(params) else {
            return json_rpc_error(id, ErrorCode::InvalidParams);
        };

        match self.resources.read(ctx, &read.uri).await {
            Ok(result) => to_result(id, result),
            Err(ResourceReadError::UnknownResource(uri)) => JsonRpcResponse::error(
                id,
                RpcError::new(ErrorCode::NotFound).with_detail(
                    "resource_not_found",
                    "unknown resource uri",
                    json!({ "uri": uri }),
                ),
            ),
            Err(ResourceReadError::Failed(err)) => {
                handler_failure(id, ctx, "resource", &read.uri, &err)
            }
        }
    }

    fn get_prompt(&self, id: Option<Value>, params: Option<Value>) -> JsonRpcResponse {
        let Some(get) = parse_params::<PromptGetParams>(params) else {
            return json_rpc_error(id, ErrorCode::InvalidParams);
        };

        match self.prompts.get(&get.name, &get.arguments) {
            Some(result) => JsonRpcResponse::result(id, result),
            None => JsonRpcResponse::error(
                id,
                RpcError::new(ErrorCode::InvalidParams).with_detail(
                    "prompt_not_found",
                    "unknown prompt name",
                    json!({ "name": get.name }),
                ),
            ),
        }
    }
}

fn initialize_result() -> InitializeResult {
    InitializeResult {
        server_info: Implementation {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: None,
            description: None,
            icons: vec![],
            website_url: None,
        },
        capabilities: ServerCapabilities {
            tools: Some(ServerCapabilitiesTools {
                list_changed: Some(false),
            }),
            resources: Some(ServerCapabilitiesResources {
                subscribe: Some(false),
                list_changed: Some(false),
            }),
            prompts: Some(ServerCapabilitiesPrompts {
                list_changed: Some(false),
            }),
            ..Default::default()
        },
        protocol_version: ProtocolVersion::V2024_11_05.into(),
        instructions: None,
        meta: None,
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Option<T> {
    serde_json::from_value(params?).ok()
}

fn to_result<T: Serialize>(id: Option<Value>, result: T) -> JsonRpcResponse {
    match serde_json::to_value(result) {
        Ok(value) => JsonRpcResponse::result(id, value),
        Err(err) => {
            error!(error = %err, "result serialization failed");
            json_rpc_error(id, ErrorCode::InternalError)
        }
    }
}

fn handler_failure(
    id: Option<Value>,
    ctx: &RequestContext,
    kind: &'static str,
    target: &str,
    err: &HandlerError,
) -> JsonRpcResponse {
    if err.is_sensitive() {
        error!(
            kind,
            target,
            correlation_id = ctx.correlation_id(),
            request_id = ?ctx.request_id(),
            error = %err,
            "handler failed"
        );
    } else {
        warn!(
            kind,
            target,
            correlation_id = ctx.correlation_id(),
            request_id = ?ctx.request_id(),
            error = %err,
            "handler rejected call"
        );
    }
    JsonRpcResponse::error(id, err.to_rpc_error())
}

const REDACTED: &str = "[REDACTED]";

/// Key fragments, compared after lowercasing and dropping `-` and `_`.
const SENSITIVE_KEY_FRAGMENTS: &[&str] = &[
    "token",
    "secret",
    "password",
    "passwd",
    "credential",
    "authorization",
    "bearer",
    "apikey",
    "privatekey",
    "cookie",
];

/// Copy of the request params safe to write to the audit log.
fn audit_params(params: Option<&Value>) -> Value {
    let mut params = params.cloned().unwrap_or(Value::Null);
    redact_in_place(&mut params);
    params
}

fn redact_in_place(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, item) in map.iter_mut() {
                if is_sensitive_key(key) {
                    *item = Value::String(REDACTED.to_string());
                } else {
                    redact_in_place(item);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact_in_place),
        _ => {}
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let folded: String = key
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .map(|c| c.to_ascii_lowercase())
        .collect();
    SENSITIVE_KEY_FRAGMENTS
        .iter()
        .any(|fragment| folded.contains(fragment))
}
