//! Tool, resource and prompt registries
//!
//! The host hands each registry an explicit list of providers at startup.
//! Registries are immutable afterwards; a duplicate name is a fatal
//! construction error so a misconfigured server never starts serving.

pub mod prompts;
pub mod resources;
pub mod tools;

use serde_json::json;
use thiserror::Error;

pub use prompts::{PromptArgument, PromptDefinition, PromptInfo, PromptProvider, PromptRegistry};
pub use resources::{
    ResourceContents, ResourceDefinition, ResourceHandler, ResourceInfo, ResourceProvider,
    ResourceRegistry, ResourceTemplateInfo,
};
pub use tools::{ToolDefinition, ToolHandler, ToolInfo, ToolOutput, ToolProvider, ToolRegistry};

use crate::mcp::rpc::{ErrorCode, RpcError};
use crate::session::SessionStoreError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("duplicate {kind} '{name}'")]
    Duplicate { kind: &'static str, name: String },
    #[error("invalid resource template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },
}

/// Failure reported by a tool, resource or prompt handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("rate limited")]
    RateLimited,
    #[error("external dependency failure: {0}")]
    External(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl HandlerError {
    /// Failures whose detail must stay server-side.
    pub fn is_sensitive(&self) -> bool {
        matches!(self, Self::External(_) | Self::Internal(_))
    }

    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            Self::InvalidParams(message) => RpcError::new(ErrorCode::InvalidParams).with_detail(
                "invalid_params",
                message,
                json!({}),
            ),
            Self::NotFound(message) => RpcError::with_message(ErrorCode::NotFound, message.clone()),
            Self::Unauthorized(message) => {
                RpcError::with_message(ErrorCode::Unauthorized, message.clone())
            }
            Self::RateLimited => RpcError::new(ErrorCode::RateLimited),
            Self::External(_) => RpcError::new(ErrorCode::ExternalService),
            Self::Timeout(_) => RpcError::new(ErrorCode::Timeout),
            Self::Internal(_) => RpcError::new(ErrorCode::InternalError),
        }
    }
}

impl From<SessionStoreError> for HandlerError {
    fn from(err: SessionStoreError) -> Self {
        match err {
            SessionStoreError::InvalidSessionId => Self::InvalidParams(err.to_string()),
            SessionStoreError::Unavailable | SessionStoreError::Backend(_) => {
                Self::External(err.to_string())
            }
            SessionStoreError::Serialization(_) => Self::Internal(err.to_string()),
        }
    }
}
